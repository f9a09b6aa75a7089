//! Readers for whitespace-delimited station files with decimal-year timestamps.
//!
//! | extension      | header | time column | default value column |
//! |----------------|--------|-------------|----------------------|
//! | none or `txt`  | yes    | `Year`      | `Height`             |
//! | `tenv3`        | opt.   | 2           | `____up(m)` / 12     |
//! | `txyz2`        | no     | 2           | 3                    |
//!
//! Every series is resampled to daily bins by averaging; empty days are NaN.

use std::fs;
use std::path::{Path, PathBuf};

use crate::data::{Observations, TimeSeries};
use crate::error::{BpcaError, Result};

/// Days per year used to convert decimal years to days.
pub const DAYS_PER_YEAR: f64 = 365.2425;
const EPOCH_YEAR: f64 = 1970.0;
const TENV3_UP_COLUMN: usize = 12;

/// Which column holds the observed variable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Column {
    /// The format's default column.
    #[default]
    Auto,
    Name(String),
    Index(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Txt,
    Tenv3,
    Txyz2,
}

impl Format {
    fn from_path(path: &Path) -> Result<Self> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        match file_name.split_once('.').map(|(_, ext)| ext) {
            None | Some("txt") => Ok(Format::Txt),
            Some("tenv3") => Ok(Format::Tenv3),
            Some("txyz2") => Ok(Format::Txyz2),
            Some(other) => Err(BpcaError::NotImplemented(other.to_string())),
        }
    }
}

struct Table {
    header: Option<Vec<String>>,
    /// (line number, fields)
    rows: Vec<(usize, Vec<String>)>,
}

fn tokenize(content: &str) -> Vec<(usize, Vec<String>)> {
    content
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(i, line)| (i, line.split_whitespace().map(str::to_string).collect()))
        .collect()
}

fn split_header(mut rows: Vec<(usize, Vec<String>)>, format: Format, time_column: usize) -> Table {
    let has_header = match format {
        Format::Txt => true,
        Format::Txyz2 => false,
        Format::Tenv3 => rows.first().is_some_and(|(_, fields)| {
            fields
                .get(time_column)
                .map_or(true, |f| f.parse::<f64>().is_err())
        }),
    };
    let header = if has_header && !rows.is_empty() {
        Some(rows.remove(0).1)
    } else {
        None
    };
    Table { header, rows }
}

fn resolve(header: Option<&[String]>, column: &Column, path: &Path) -> Result<usize> {
    match column {
        Column::Index(i) => Ok(*i),
        Column::Name(name) => header
            .and_then(|h| h.iter().position(|c| c == name))
            .ok_or_else(|| BpcaError::Parse {
                path: path.to_path_buf(),
                line: 1,
                reason: format!("no column named `{name}`"),
            }),
        Column::Auto => Err(BpcaError::Parse {
            path: path.to_path_buf(),
            line: 1,
            reason: "column must be resolved before parsing".into(),
        }),
    }
}

fn parse_field(path: &Path, line: usize, fields: &[String], column: usize) -> Result<f64> {
    let field = fields.get(column).ok_or_else(|| BpcaError::Parse {
        path: path.to_path_buf(),
        line,
        reason: format!("missing column {column}"),
    })?;
    field.parse::<f64>().map_err(|e| BpcaError::Parse {
        path: path.to_path_buf(),
        line,
        reason: format!("`{field}`: {e}"),
    })
}

/// Averages values falling on the same day and fills the gaps between the
/// first and last day with NaN. Output times are decimal years at day start.
pub fn resample_daily(time: &[f64], values: &[f64]) -> TimeSeries {
    let days: Vec<i64> = time
        .iter()
        .map(|&t| ((t - EPOCH_YEAR) * DAYS_PER_YEAR).floor() as i64)
        .collect();
    let (Some(&first), Some(&last)) = (days.iter().min(), days.iter().max()) else {
        return TimeSeries {
            time: Vec::new(),
            values: Vec::new(),
        };
    };
    let n_days = (last - first + 1) as usize;
    let mut sums = vec![0.0; n_days];
    let mut counts = vec![0usize; n_days];
    for (&day, &v) in days.iter().zip(values) {
        if v.is_nan() {
            continue;
        }
        let bin = (day - first) as usize;
        sums[bin] += v;
        counts[bin] += 1;
    }
    TimeSeries {
        time: (first..=last)
            .map(|day| EPOCH_YEAR + day as f64 / DAYS_PER_YEAR)
            .collect(),
        values: sums
            .iter()
            .zip(&counts)
            .map(|(&s, &c)| if c == 0 { f64::NAN } else { s / c as f64 })
            .collect(),
    }
}

/// Reads one station file and resamples it to daily means.
pub fn read_series(path: &Path, column: &Column) -> Result<TimeSeries> {
    let format = Format::from_path(path)?;
    let content = fs::read_to_string(path)?;
    let time_column_fixed = 2;
    let table = split_header(tokenize(&content), format, time_column_fixed);
    let header = table.header.as_deref();

    let time_column = match format {
        Format::Txt => resolve(header, &Column::Name("Year".into()), path)?,
        Format::Tenv3 | Format::Txyz2 => time_column_fixed,
    };
    let value_column = match (column, format) {
        (Column::Auto, Format::Txt) => resolve(header, &Column::Name("Height".into()), path)?,
        (Column::Auto, Format::Tenv3) => match header {
            Some(_) => resolve(header, &Column::Name("____up(m)".into()), path)?,
            None => TENV3_UP_COLUMN,
        },
        (Column::Auto, Format::Txyz2) => 3,
        (other, _) => resolve(header, other, path)?,
    };

    let mut time = Vec::with_capacity(table.rows.len());
    let mut values = Vec::with_capacity(table.rows.len());
    for (line, fields) in &table.rows {
        time.push(parse_field(path, *line, fields, time_column)?);
        values.push(parse_field(path, *line, fields, value_column)?);
    }
    log::debug!("read {} records from {}", time.len(), path.display());
    Ok(resample_daily(&time, &values))
}

/// Label of a station file: its file name up to the first dot.
fn station_label(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.split('.').next().unwrap_or(n).to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Reads several station files into one observation matrix on the union of
/// their daily time grids.
pub fn read_observations<P: AsRef<Path>>(
    name: &str,
    paths: &[P],
    column: &Column,
) -> Result<Observations> {
    let series = paths
        .iter()
        .map(|p| {
            let path: PathBuf = p.as_ref().to_path_buf();
            read_series(&path, column).map(|ts| (station_label(&path), ts))
        })
        .collect::<Result<Vec<_>>>()?;
    Observations::from_series(name, series)
}
