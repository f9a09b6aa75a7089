//! Error type shared by every stage of the BPCA pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while configuring, sampling, post-processing or persisting a model.
#[derive(Debug, Error)]
pub enum BpcaError {
    #[error("define a model name before saving")]
    MissingName,
    #[error("define an output directory before saving")]
    MissingOutputDir,
    #[error("file of type *.{0} not implemented")]
    NotImplemented(String),
    #[error("invalid setting `{name}`: {reason}")]
    InvalidSetting { name: &'static str, reason: String },
    #[error("unknown option `{0}`")]
    UnknownOption(String),
    #[error("shape mismatch for {what}: expected {expected}, found {found}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("the model has not been sampled yet")]
    MissingTrace,
    #[error("operation requires the full trace, but it has been compressed")]
    TraceCompressed,
    #[error("random sub-samples only exist on a compressed trace")]
    RandomSamplesUnavailable,
    #[error("draw window {start}..{end} exceeds the {n_draws} available draws")]
    WindowOutOfRange {
        start: usize,
        end: usize,
        n_draws: usize,
    },
    #[error("index {index} out of range for {what} (length {len})")]
    IndexOutOfRange {
        what: &'static str,
        index: usize,
        len: usize,
    },
    #[error("trace has no variable `{0}`")]
    MissingVariable(String),
    #[error("backend failure: {0}")]
    Backend(String),
    #[error("could not parse {path:?} line {line}: {reason}")]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
    #[error(transparent)]
    Encode(#[from] bincode::error::EncodeError),
    #[error(transparent)]
    Decode(#[from] bincode::error::DecodeError),
    #[cfg(feature = "csv")]
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[cfg(feature = "arrow")]
    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),
    #[cfg(feature = "parquet")]
    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),
}

pub type Result<T> = std::result::Result<T, BpcaError>;
