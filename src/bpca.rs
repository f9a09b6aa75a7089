/*!
The [`Bpca`] object ties a dataset and its settings to a sampled trace and to the
products derived from it.

# Example
```rust,no_run
use bpca::{Bpca, Observations, Settings};
use ndarray::Array2;

let observations = Observations::from_matrix("tide gauges", Array2::zeros((120, 4)));
let mut settings = Settings::default();
settings.apply_overrides(["number_of_pcs=2", "n_samples=400", "cores=2"])?;
let mut bpca = Bpca::new(observations, settings, "north_sea")?;
bpca.run()?;
let explained = bpca.explained_variance()?;
println!("explained variance per station: {explained}");
bpca.save("out".as_ref())?;
# Ok::<(), bpca::BpcaError>(())
```
*/

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use burn::tensor::backend::AutodiffBackend;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::compress;
use crate::config::Settings;
use crate::data::{nan_variance, Observations};
use crate::error::{BpcaError, Result};
use crate::io::{self, TraceFormat};
use crate::model::BpcaModel;
use crate::reconstruct::{reconstruct, MapPattern, Reconstruction, ReconstructionKind};
use crate::sampler;
use crate::stats::{self, ChainComparison, ConvergenceStats};
use crate::symmetry::{self, ComponentMatch};
use crate::trace::{InferenceData, Trace};
use crate::DefaultBackend;

/// File extension of saved [`Bpca`] objects.
pub const EXTENSION: &str = "bpca";

/// R-hat above which a run is reported as not converged.
pub const RHAT_THRESHOLD: f64 = 1.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bpca {
    pub name: String,
    dataset: Observations,
    settings: Settings,
    trace: Option<Trace>,
    /// Last non-map reconstruction.
    pub estimated_dataset: Option<Reconstruction>,
    pub estimated_dataset_map: Option<Reconstruction>,
    /// Pattern used for `estimated_dataset_map`.
    pub map_pattern: Option<MapPattern>,
    pub chain_stats: Vec<ChainComparison>,
    pub convergence_stats: Option<ConvergenceStats>,
}

impl Bpca {
    /// Validates `settings` against `dataset`.
    pub fn new(dataset: Observations, settings: Settings, name: impl Into<String>) -> Result<Self> {
        settings.validate(dataset.n_space())?;
        Ok(Self {
            name: name.into(),
            dataset,
            settings,
            trace: None,
            estimated_dataset: None,
            estimated_dataset_map: None,
            map_pattern: None,
            chain_stats: Vec::new(),
            convergence_stats: None,
        })
    }

    pub fn dataset(&self) -> &Observations {
        &self.dataset
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn trace(&self) -> Option<&Trace> {
        self.trace.as_ref()
    }

    fn require_trace(&self) -> Result<&Trace> {
        self.trace.as_ref().ok_or(BpcaError::MissingTrace)
    }

    fn full_trace(&self) -> Result<&InferenceData> {
        self.require_trace()?.full()
    }

    /// Installs an externally produced trace and drops everything derived from
    /// the previous one.
    pub fn set_trace(&mut self, trace: Trace) {
        self.trace = Some(trace);
        self.estimated_dataset = None;
        self.estimated_dataset_map = None;
        self.map_pattern = None;
        self.chain_stats.clear();
        self.convergence_stats = None;
    }

    /// Samples with the [`DefaultBackend`], then post-processes as configured.
    pub fn run(&mut self) -> Result<()> {
        self.run_with_backend::<DefaultBackend>()
    }

    pub fn run_with_backend<B: AutodiffBackend>(&mut self) -> Result<()> {
        let model = BpcaModel::new(&self.dataset, &self.settings.model)?;
        let run = self.settings.run.clone();
        let data = sampler::sample::<B>(&model, run.n_samples, &run.sample_settings)?;
        self.set_trace(Trace::Full(data));

        if run.adjust_pca_symmetry {
            self.adjust_pca_symmetry()?;
        }
        if run.check_convergence {
            self.check_convergence(true)?;
        }
        if run.compress {
            self.compress()?;
        }
        Ok(())
    }

    /// Aligns component order and sign of every chain with chain 0.
    pub fn adjust_pca_symmetry(&mut self) -> Result<Vec<ComponentMatch>> {
        let data = self
            .trace
            .as_mut()
            .ok_or(BpcaError::MissingTrace)?
            .full_mut()?;
        symmetry::adjust(&mut data.posterior)
    }

    /// Computes R-hat and ESS of the posterior. A run that fails to converge is
    /// only reported.
    pub fn check_convergence(&mut self, main_components_only: bool) -> Result<&ConvergenceStats> {
        let data = self.full_trace()?;
        let stats = stats::convergence(&data.posterior, main_components_only, data.n_draws())?;
        log::info!("convergence statistics of {}:\n{stats}", self.name);
        if !stats.converged(RHAT_THRESHOLD) {
            log::warn!(
                "{} did not converge: max r_hat {:.3} >= {RHAT_THRESHOLD}",
                self.name,
                stats.max_rhat()
            );
        }
        Ok(self.convergence_stats.insert(stats))
    }

    /// Ranks the chains by WAIC.
    pub fn chain_statistics(&mut self) -> Result<&[ChainComparison]> {
        let rows = stats::compare_chains(&self.full_trace()?.log_likelihood)?;
        for row in &rows {
            log::info!(
                "chain {}: rank {} elpd_waic {:.2} (se {:.2}) p_waic {:.2} d_elpd {:.2}",
                row.chain,
                row.rank,
                row.elpd_waic,
                row.se,
                row.p_waic,
                row.d_elpd
            );
        }
        self.chain_stats = rows;
        Ok(&self.chain_stats)
    }

    /// Replaces the full trace by its compressed form. The chain comparison is
    /// computed beforehand since it needs every draw.
    pub fn compress(&mut self) -> Result<()> {
        self.chain_statistics()?;
        let compressed = compress::compress(self.full_trace()?, &self.settings.run.compression)?;
        self.trace = Some(Trace::Compressed(compressed));
        Ok(())
    }

    /// Reconstructs the field of `chain` and stores it on `self`.
    pub fn recombine(
        &mut self,
        kind: ReconstructionKind,
        chain: usize,
        with_offset: bool,
    ) -> Result<&Reconstruction> {
        let result = reconstruct(
            self.require_trace()?,
            &self.settings.model,
            &self.dataset,
            &kind,
            chain,
            with_offset,
        )?;
        let slot = match kind {
            ReconstructionKind::Maps(pattern) => {
                self.map_pattern = Some(pattern);
                &mut self.estimated_dataset_map
            }
            _ => &mut self.estimated_dataset,
        };
        Ok(slot.insert(result))
    }

    /// `1 - var(estimate - observed) / var(observed)` per location, using the
    /// stored reconstruction or the posterior mean of chain 0.
    pub fn explained_variance(&mut self) -> Result<Array1<f64>> {
        if self.estimated_dataset.is_none() {
            self.recombine(ReconstructionKind::Mean, 0, true)?;
        }
        let estimate = self
            .estimated_dataset
            .as_ref()
            .ok_or(BpcaError::MissingTrace)?;
        if estimate.estimate.dim() != self.dataset.values.dim() {
            return Err(BpcaError::ShapeMismatch {
                what: "reconstruction",
                expected: self.dataset.values.len(),
                found: estimate.estimate.len(),
            });
        }
        let residual = &estimate.estimate - &self.dataset.values;
        let explained = 1.0 - nan_variance(&residual) / self.dataset.temporal_variance();
        Ok(explained)
    }

    /// Writes `<dir>/<name>.bpca`.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        if self.name.is_empty() {
            return Err(BpcaError::MissingName);
        }
        if dir.as_os_str().is_empty() {
            return Err(BpcaError::MissingOutputDir);
        }
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.{EXTENSION}", self.name));
        let mut writer = BufWriter::new(File::create(&path)?);
        bincode::serde::encode_into_std_write(self, &mut writer, bincode::config::standard())?;
        writer.flush()?;
        log::info!("saved {} to {}", self.name, path.display());
        Ok(path)
    }

    /// Reads an object written by [`Bpca::save`]; the extension is optional.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut path = path.as_ref().to_path_buf();
        if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
            let mut name = path.clone().into_os_string();
            name.push(format!(".{EXTENSION}"));
            path = PathBuf::from(name);
        }
        let mut reader = BufReader::new(File::open(&path)?);
        let bpca = bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())?;
        Ok(bpca)
    }

    /// Exports the trace as `<dir>/<name>_trace.<ext>`.
    pub fn save_trace(&self, dir: &Path, format: TraceFormat) -> Result<PathBuf> {
        if self.name.is_empty() {
            return Err(BpcaError::MissingName);
        }
        if dir.as_os_str().is_empty() {
            return Err(BpcaError::MissingOutputDir);
        }
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}_trace.{}", self.name, format.extension()));
        io::save_trace(self.require_trace()?, &path, format)?;
        Ok(path)
    }
}
