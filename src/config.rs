//! Typed model and run settings.
//!
//! Every option has a default matching the reference setup of the tool. Options can
//! be overridden programmatically through the public fields or from `key=value`
//! strings with [`Settings::set`], which only accepts the enumerated option names
//! listed in each group's `OPTIONS`.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{BpcaError, Result};

/// Prior family of the trend pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendDistribution {
    Normal,
    /// Heavy-tailed Student's t prior.
    StudentT,
}

impl FromStr for TrendDistribution {
    type Err = BpcaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "normal" => Ok(Self::Normal),
            "student_t" | "studentt" | "heavy_tailed" => Ok(Self::StudentT),
            other => Err(BpcaError::InvalidSetting {
                name: "trend_distr",
                reason: format!("expected `normal` or `student_t`, found `{other}`"),
            }),
        }
    }
}

/// How the observation noise scale is parameterised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseModel {
    /// One scale for the whole field.
    Scalar,
    /// One scale per location.
    PerLocation,
    /// One scale per cluster of locations, expanded to locations.
    Clustered { n_clusters: usize },
}

/// Priors and structure of the BPCA model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    pub number_of_pcs: usize,
    pub model_trend: bool,
    /// Prior scale of the observation noise.
    pub sigma: f64,
    pub sigma_offset: f64,
    /// Innovation scale of the first PC random walk.
    pub sigma_random_walk: f64,
    /// Each further PC divides the innovation scale by this factor.
    pub sigma_random_walk_factor: f64,
    pub sigma_eofs: f64,
    pub trend_factor_sigma: f64,
    pub trend_factor_nu: f64,
    pub trend_distr: TrendDistribution,
    /// Temporal shift of the centred trend ramp, in time steps.
    pub trend_shift: f64,
    pub estimate_point_variance: bool,
    pub estimate_cluster_sigma: bool,
    pub estimate_offsets: bool,
    pub estimate_sigma_eof: bool,
    pub trend_pattern: Option<Vec<f64>>,
    /// Centre the trend prior on `trend_pattern` instead of zero.
    pub initialize_trend_pattern: bool,
    pub cluster_index: Option<Vec<usize>>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            number_of_pcs: 3,
            model_trend: true,
            sigma: 0.4,
            sigma_offset: 0.1,
            sigma_random_walk: 0.001,
            sigma_random_walk_factor: 2.0,
            sigma_eofs: 0.15,
            trend_factor_sigma: 0.01,
            trend_factor_nu: 2.1,
            trend_distr: TrendDistribution::Normal,
            trend_shift: -6.0,
            estimate_point_variance: false,
            estimate_cluster_sigma: false,
            estimate_offsets: false,
            estimate_sigma_eof: true,
            trend_pattern: None,
            initialize_trend_pattern: false,
            cluster_index: None,
        }
    }
}

impl ModelSettings {
    pub const OPTIONS: &'static [&'static str] = &[
        "number_of_pcs",
        "model_trend",
        "sigma",
        "sigma_offset",
        "sigma_random_walk",
        "sigma_random_walk_factor",
        "sigma_eofs",
        "trend_factor_sigma",
        "trend_factor_nu",
        "trend_distr",
        "trend_shift",
        "estimate_point_variance",
        "estimate_cluster_sigma",
        "estimate_offsets",
        "estimate_sigma_eof",
        "trend_pattern",
        "initialize_trend_pattern",
        "cluster_index",
    ];

    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "number_of_pcs" => self.number_of_pcs = parse("number_of_pcs", value)?,
            "model_trend" => self.model_trend = parse("model_trend", value)?,
            "sigma" => self.sigma = parse("sigma", value)?,
            "sigma_offset" => self.sigma_offset = parse("sigma_offset", value)?,
            "sigma_random_walk" => self.sigma_random_walk = parse("sigma_random_walk", value)?,
            "sigma_random_walk_factor" => {
                self.sigma_random_walk_factor = parse("sigma_random_walk_factor", value)?
            }
            "sigma_eofs" => self.sigma_eofs = parse("sigma_eofs", value)?,
            "trend_factor_sigma" => self.trend_factor_sigma = parse("trend_factor_sigma", value)?,
            "trend_factor_nu" => self.trend_factor_nu = parse("trend_factor_nu", value)?,
            "trend_distr" => self.trend_distr = value.parse()?,
            "trend_shift" => self.trend_shift = parse("trend_shift", value)?,
            "estimate_point_variance" => {
                self.estimate_point_variance = parse("estimate_point_variance", value)?
            }
            "estimate_cluster_sigma" => {
                self.estimate_cluster_sigma = parse("estimate_cluster_sigma", value)?
            }
            "estimate_offsets" => self.estimate_offsets = parse("estimate_offsets", value)?,
            "estimate_sigma_eof" => self.estimate_sigma_eof = parse("estimate_sigma_eof", value)?,
            "trend_pattern" => self.trend_pattern = parse_list("trend_pattern", value)?,
            "initialize_trend_pattern" => {
                self.initialize_trend_pattern = parse("initialize_trend_pattern", value)?
            }
            "cluster_index" => self.cluster_index = parse_list("cluster_index", value)?,
            other => return Err(BpcaError::UnknownOption(other.to_string())),
        }
        Ok(())
    }

    pub fn noise_model(&self) -> NoiseModel {
        match (self.estimate_point_variance, self.estimate_cluster_sigma) {
            (true, true) => NoiseModel::Clustered {
                n_clusters: self
                    .cluster_index
                    .as_ref()
                    .and_then(|idx| idx.iter().max())
                    .map_or(0, |max| max + 1),
            },
            (true, false) => NoiseModel::PerLocation,
            _ => NoiseModel::Scalar,
        }
    }

    /// Innovation scale of the random walk of component `k`.
    pub fn random_walk_scale(&self, k: usize) -> f64 {
        self.sigma_random_walk / self.sigma_random_walk_factor.powi(k as i32)
    }

    /// Checks the settings against a field with `n_space` locations.
    pub fn validate(&self, n_space: usize) -> Result<()> {
        if self.number_of_pcs == 0 {
            return Err(invalid("number_of_pcs", "at least one component is required"));
        }
        for (name, value) in [
            ("sigma", self.sigma),
            ("sigma_offset", self.sigma_offset),
            ("sigma_random_walk", self.sigma_random_walk),
            ("sigma_random_walk_factor", self.sigma_random_walk_factor),
            ("sigma_eofs", self.sigma_eofs),
            ("trend_factor_sigma", self.trend_factor_sigma),
            ("trend_factor_nu", self.trend_factor_nu),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(invalid(name, &format!("must be positive, found {value}")));
            }
        }
        if let Some(pattern) = &self.trend_pattern {
            if pattern.len() != n_space {
                return Err(BpcaError::ShapeMismatch {
                    what: "trend_pattern",
                    expected: n_space,
                    found: pattern.len(),
                });
            }
        } else if self.initialize_trend_pattern {
            return Err(invalid(
                "initialize_trend_pattern",
                "requires a trend_pattern",
            ));
        }
        if self.estimate_point_variance && self.estimate_cluster_sigma {
            let index = self
                .cluster_index
                .as_ref()
                .ok_or_else(|| invalid("cluster_index", "required for clustered sigma"))?;
            if index.len() != n_space {
                return Err(BpcaError::ShapeMismatch {
                    what: "cluster_index",
                    expected: n_space,
                    found: index.len(),
                });
            }
            let n_clusters = index.iter().max().map_or(0, |max| max + 1);
            if (0..n_clusters).any(|c| !index.contains(&c)) {
                return Err(invalid(
                    "cluster_index",
                    "cluster ids must cover 0..n_clusters without gaps",
                ));
            }
        }
        Ok(())
    }
}

/// Options of the sampler itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleSettings {
    /// Adaptation iterations, discarded.
    pub tune: usize,
    /// Number of chains.
    pub cores: usize,
    pub target_accept: f64,
    pub n_leapfrog: usize,
    pub seed: Option<u64>,
    pub progress: bool,
}

impl Default for SampleSettings {
    fn default() -> Self {
        Self {
            tune: 2000,
            cores: 4,
            target_accept: 0.9,
            n_leapfrog: 20,
            seed: None,
            progress: true,
        }
    }
}

impl SampleSettings {
    pub const OPTIONS: &'static [&'static str] = &[
        "tune",
        "cores",
        "target_accept",
        "n_leapfrog",
        "seed",
        "progress",
    ];

    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "tune" => self.tune = parse("tune", value)?,
            "cores" => self.cores = parse("cores", value)?,
            "target_accept" => self.target_accept = parse("target_accept", value)?,
            "n_leapfrog" => self.n_leapfrog = parse("n_leapfrog", value)?,
            "seed" => {
                self.seed = match value {
                    "none" | "" => None,
                    v => Some(parse("seed", v)?),
                }
            }
            "progress" => self.progress = parse("progress", value)?,
            other => return Err(BpcaError::UnknownOption(other.to_string())),
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.cores == 0 {
            return Err(invalid("cores", "at least one chain is required"));
        }
        if self.n_leapfrog == 0 {
            return Err(invalid("n_leapfrog", "must be positive"));
        }
        if !(self.target_accept > 0.0 && self.target_accept < 1.0) {
            return Err(invalid("target_accept", "must lie in (0, 1)"));
        }
        Ok(())
    }
}

/// Layout of the random draw windows kept after compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionSettings {
    pub random_sample_size: usize,
    pub number_of_rands: usize,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            random_sample_size: 20,
            number_of_rands: 5,
        }
    }
}

impl CompressionSettings {
    pub const OPTIONS: &'static [&'static str] = &["random_sample_size", "number_of_rands"];

    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "random_sample_size" => self.random_sample_size = parse("random_sample_size", value)?,
            "number_of_rands" => self.number_of_rands = parse("number_of_rands", value)?,
            other => return Err(BpcaError::UnknownOption(other.to_string())),
        }
        Ok(())
    }

    /// Start draw of every window for a trace of `n_draws` draws.
    pub fn window_starts(&self, n_draws: usize) -> Vec<usize> {
        let max_draw = n_draws.saturating_sub(1);
        let factor = max_draw / self.number_of_rands.max(1);
        (0..self.number_of_rands).map(|w| factor * w).collect()
    }

    pub fn validate(&self, n_draws: usize) -> Result<()> {
        if self.number_of_rands == 0 {
            return Err(invalid("number_of_rands", "must be positive"));
        }
        if self.random_sample_size == 0 {
            return Err(invalid("random_sample_size", "must be positive"));
        }
        if let Some(&last) = self.window_starts(n_draws).last() {
            let end = last + self.random_sample_size;
            if end > n_draws {
                return Err(BpcaError::WindowOutOfRange {
                    start: last,
                    end,
                    n_draws,
                });
            }
        }
        Ok(())
    }
}

/// Options of a full `run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSettings {
    pub n_samples: usize,
    pub compress: bool,
    pub adjust_pca_symmetry: bool,
    pub check_convergence: bool,
    pub sample_settings: SampleSettings,
    pub compression: CompressionSettings,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            n_samples: 4000,
            compress: true,
            adjust_pca_symmetry: true,
            check_convergence: true,
            sample_settings: SampleSettings::default(),
            compression: CompressionSettings::default(),
        }
    }
}

impl RunSettings {
    pub const OPTIONS: &'static [&'static str] = &[
        "n_samples",
        "compress",
        "adjust_pca_symmetry",
        "check_convergence",
    ];

    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "n_samples" => self.n_samples = parse("n_samples", value)?,
            "compress" => self.compress = parse("compress", value)?,
            "adjust_pca_symmetry" => self.adjust_pca_symmetry = parse("adjust_pca_symmetry", value)?,
            "check_convergence" => self.check_convergence = parse("check_convergence", value)?,
            k if SampleSettings::OPTIONS.contains(&k) => self.sample_settings.set(k, value)?,
            k if CompressionSettings::OPTIONS.contains(&k) => self.compression.set(k, value)?,
            other => return Err(BpcaError::UnknownOption(other.to_string())),
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_samples == 0 {
            return Err(invalid("n_samples", "must be positive"));
        }
        self.sample_settings.validate()?;
        if self.compress {
            self.compression.validate(self.n_samples)?;
        }
        Ok(())
    }
}

/// All settings of a [`crate::bpca::Bpca`] instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub model: ModelSettings,
    pub run: RunSettings,
}

impl Settings {
    /// Applies a single override, e.g. `set("number_of_pcs", "2")`.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        if ModelSettings::OPTIONS.contains(&key) {
            self.model.set(key, value)
        } else {
            self.run.set(key, value)
        }
    }

    /// Applies overrides of the form `key=value`.
    pub fn apply_overrides<'a, I>(&mut self, overrides: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for item in overrides {
            let (key, value) = item
                .split_once('=')
                .ok_or_else(|| BpcaError::UnknownOption(item.to_string()))?;
            self.set(key.trim(), value.trim())?;
        }
        Ok(())
    }

    pub fn validate(&self, n_space: usize) -> Result<()> {
        self.model.validate(n_space)?;
        self.run.validate()
    }
}

fn invalid(name: &'static str, reason: &str) -> BpcaError {
    BpcaError::InvalidSetting {
        name,
        reason: reason.to_string(),
    }
}

fn parse<T: FromStr>(name: &'static str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| BpcaError::InvalidSetting {
        name,
        reason: format!("cannot parse `{value}`: {e}"),
    })
}

fn parse_list<T: FromStr>(name: &'static str, value: &str) -> Result<Option<Vec<T>>>
where
    T::Err: std::fmt::Display,
{
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    value
        .split(',')
        .map(|item| parse(name, item))
        .collect::<Result<Vec<T>>>()
        .map(Some)
}
