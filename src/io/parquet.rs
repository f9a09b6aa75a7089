//! Parquet export of a long-format trace table.

use std::fs::File;
use std::path::Path;

use ::parquet::{arrow::ArrowWriter, file::properties::WriterProperties};

use super::LongTable;
use crate::error::Result;

/// Writes `table` to a Parquet file, reusing the Arrow layout of the IPC export.
pub fn save_parquet(table: &LongTable, path: &Path) -> Result<()> {
    let batch = super::arrow::record_batch(table)?;
    let file = File::create(path)?;
    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    // close writes the footer metadata
    writer.close()?;
    Ok(())
}
