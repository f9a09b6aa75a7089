//! CSV export of a long-format trace table.

use std::fs::File;
use std::path::Path;

use csv::Writer;

use super::LongTable;
use crate::error::Result;

/**
Writes `table` to `path` with a header row followed by one record per stored value.

# Example
```rust
use bpca::io::{csv::save_csv, LongTable};
let table = LongTable {
    group: vec!["posterior".into()],
    variable: vec!["sigma".into()],
    chain: vec![0],
    draw: vec![0],
    index: vec![0],
    value: vec![0.25],
};
let path = std::env::temp_dir().join("bpca_doc_trace.csv");
save_csv(&table, &path)?;
# Ok::<(), bpca::BpcaError>(())
```
*/
pub fn save_csv(table: &LongTable, path: &Path) -> Result<()> {
    let mut wtr = Writer::from_writer(File::create(path)?);
    wtr.write_record(LongTable::COLUMNS)?;
    for row in 0..table.len() {
        wtr.write_record(&[
            table.group[row].clone(),
            table.variable[row].clone(),
            table.chain[row].to_string(),
            table.draw[row].to_string(),
            table.index[row].to_string(),
            table.value[row].to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}
