//! Bayesian principal component analysis of gridded or station time series.
//!
//! A [`Bpca`] object samples latent PCs, EOF loadings, an optional linear trend and
//! per-location offsets with HMC, then post-processes the multi-chain trace:
//! chain symmetry resolution, convergence checks, compression and reconstruction.

pub mod bpca;
pub mod compress;
pub mod config;
pub mod data;
pub mod error;
pub mod io;
pub mod model;
pub mod reconstruct;
pub mod sampler;
pub mod stats;
pub mod symmetry;
pub mod trace;

pub use bpca::Bpca;
pub use config::{CompressionSettings, ModelSettings, RunSettings, SampleSettings, Settings};
pub use data::{Observations, TimeSeries};
pub use error::{BpcaError, Result};
pub use reconstruct::{MapPattern, Reconstruction, ReconstructionKind};
pub use trace::{InferenceData, Trace};

/// Backend used by [`Bpca::run`].
#[cfg(not(feature = "wgpu"))]
pub type DefaultBackend = burn::backend::Autodiff<burn::backend::NdArray<f64>>;

/// Backend used by [`Bpca::run`].
#[cfg(feature = "wgpu")]
pub type DefaultBackend = burn::backend::Autodiff<burn::backend::Wgpu>;
