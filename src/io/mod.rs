//! File ingestion and trace export.
//!
//! Traces are exported in long format, one row per stored value:
//! `group, variable, chain, draw, index, value`, where `index` is the row-major
//! position inside the per-draw block of the variable.

use std::fmt;
use std::path::Path;

use crate::error::{BpcaError, Result};
use crate::trace::{Group, InferenceData, Trace};

pub mod reader;

#[cfg(feature = "arrow")]
pub mod arrow;

#[cfg(feature = "csv")]
pub mod csv;

#[cfg(feature = "parquet")]
pub mod parquet;

/// Columnar long-format view of a trace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LongTable {
    pub group: Vec<String>,
    pub variable: Vec<String>,
    pub chain: Vec<u32>,
    pub draw: Vec<u32>,
    pub index: Vec<u32>,
    pub value: Vec<f64>,
}

impl LongTable {
    pub const COLUMNS: [&'static str; 6] = ["group", "variable", "chain", "draw", "index", "value"];

    pub fn from_trace(trace: &Trace) -> Self {
        let mut table = Self::default();
        match trace {
            Trace::Full(data) => table.push_data("", data),
            Trace::Compressed(compressed) => {
                table.push_data("mean/", &compressed.mean);
                table.push_data("std/", &compressed.std);
                table.push_group("random_mean", &compressed.random.mean);
                table.push_group("random_std", &compressed.random.std);
            }
        }
        table
    }

    fn push_data(&mut self, prefix: &str, data: &InferenceData) {
        self.push_group(&format!("{prefix}posterior"), &data.posterior);
        self.push_group(&format!("{prefix}sample_stats"), &data.sample_stats);
        self.push_group(&format!("{prefix}log_likelihood"), &data.log_likelihood);
    }

    fn push_group<K>(&mut self, label: &str, group: &Group<K>)
    where
        K: Ord + Copy + fmt::Display,
    {
        for (key, values) in group.iter() {
            let variable = key.to_string();
            for (chain, per_chain) in values.outer_iter().enumerate() {
                for (draw, block) in per_chain.outer_iter().enumerate() {
                    for (index, &value) in block.iter().enumerate() {
                        self.group.push(label.to_string());
                        self.variable.push(variable.clone());
                        self.chain.push(chain as u32);
                        self.draw.push(draw as u32);
                        self.index.push(index as u32);
                        self.value.push(value);
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

/// Export format of [`save_trace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceFormat {
    Csv,
    /// Arrow IPC file.
    Arrow,
    Parquet,
}

impl TraceFormat {
    pub fn extension(self) -> &'static str {
        match self {
            TraceFormat::Csv => "csv",
            TraceFormat::Arrow => "arrow",
            TraceFormat::Parquet => "parquet",
        }
    }
}

/// Writes `trace` to `path` in long format.
pub fn save_trace(trace: &Trace, path: &Path, format: TraceFormat) -> Result<()> {
    let table = LongTable::from_trace(trace);
    match format {
        #[cfg(feature = "csv")]
        TraceFormat::Csv => csv::save_csv(&table, path),
        #[cfg(feature = "arrow")]
        TraceFormat::Arrow => arrow::save_arrow(&table, path),
        #[cfg(feature = "parquet")]
        TraceFormat::Parquet => parquet::save_parquet(&table, path),
        #[allow(unreachable_patterns)]
        other => Err(BpcaError::NotImplemented(other.extension().to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{SampleStat, Variable};
    use ndarray::{Array, IxDyn};

    #[test]
    fn long_table_enumerates_every_value() {
        let mut data = InferenceData::default();
        data.posterior.insert(
            Variable::Eof,
            Array::from_shape_fn(IxDyn(&[2, 3, 2, 4]), |ix| (ix[2] * 4 + ix[3]) as f64),
        );
        data.sample_stats
            .insert(SampleStat::Lp, Array::from_elem(IxDyn(&[2, 3]), -5.0));
        let table = LongTable::from_trace(&Trace::Full(data));
        assert_eq!(table.len(), 2 * 3 * 8 + 2 * 3);
        assert_eq!(table.group[0], "posterior");
        assert_eq!(table.variable[0], "W");
        // index is the flattened position within the draw block
        assert_eq!(table.index[7], 7);
        assert_eq!(table.value[7], 7.0);
        assert_eq!(table.draw[8], 1);
        let last = table.len() - 1;
        assert_eq!(table.group[last], "sample_stats");
        assert_eq!(table.variable[last], "lp");
        assert_eq!((table.chain[last], table.draw[last], table.index[last]), (1, 2, 0));
    }
}
