//! Arrow IPC export of a long-format trace table.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use ::arrow::{
    array::{ArrayRef, Float64Builder, StringBuilder, UInt32Builder},
    datatypes::{DataType, Field, Schema, SchemaRef},
    ipc::writer::FileWriter,
    record_batch::RecordBatch,
};

use super::LongTable;
use crate::error::Result;

pub(crate) fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("group", DataType::Utf8, false),
        Field::new("variable", DataType::Utf8, false),
        Field::new("chain", DataType::UInt32, false),
        Field::new("draw", DataType::UInt32, false),
        Field::new("index", DataType::UInt32, false),
        Field::new("value", DataType::Float64, false),
    ]))
}

/// Builds a single record batch holding the whole table. Empty tables give a
/// batch with zero rows.
pub(crate) fn record_batch(table: &LongTable) -> Result<RecordBatch> {
    let mut group = StringBuilder::new();
    let mut variable = StringBuilder::new();
    let mut chain = UInt32Builder::new();
    let mut draw = UInt32Builder::new();
    let mut index = UInt32Builder::new();
    let mut value = Float64Builder::new();
    for row in 0..table.len() {
        group.append_value(&table.group[row]);
        variable.append_value(&table.variable[row]);
        chain.append_value(table.chain[row]);
        draw.append_value(table.draw[row]);
        index.append_value(table.index[row]);
        value.append_value(table.value[row]);
    }
    let arrays: Vec<ArrayRef> = vec![
        Arc::new(group.finish()),
        Arc::new(variable.finish()),
        Arc::new(chain.finish()),
        Arc::new(draw.finish()),
        Arc::new(index.finish()),
        Arc::new(value.finish()),
    ];
    Ok(RecordBatch::try_new(schema(), arrays)?)
}

/// Writes `table` to an Arrow IPC file.
pub fn save_arrow(table: &LongTable, path: &Path) -> Result<()> {
    let batch = record_batch(table)?;
    let file = File::create(path)?;
    let mut writer = FileWriter::try_new(file, &batch.schema())?;
    writer.write(&batch)?;
    writer.finish()?;
    Ok(())
}
