//! Posterior trace containers.
//!
//! A [`Group`] maps a typed variable key to an array whose two leading axes are
//! always `[chain, draw, ...]`. Reductions keep the draw axis (with length one), so
//! full, compressed and windowed traces share the same layout.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

use ndarray::{concatenate, Array1, ArrayD, ArrayViewD, Axis, Slice};
use serde::{Deserialize, Serialize};

use crate::error::{BpcaError, Result};

/// Latent variables of the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Variable {
    /// `[chain, draw, component, time]`
    Pc,
    /// `[chain, draw, component, space]`
    Eof,
    /// `[chain, draw, component]`
    SigmaEof,
    /// `[chain, draw, space]`
    Trend,
    /// `[chain, draw, space]`
    Offset,
    /// `[chain, draw]` or `[chain, draw, space]`
    Sigma,
    /// `[chain, draw, cluster]`
    SigmaCluster,
}

impl Variable {
    /// Whether the third axis indexes PCA components.
    pub fn is_per_component(self) -> bool {
        matches!(self, Variable::Pc | Variable::Eof | Variable::SigmaEof)
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Variable::Pc => "PC",
            Variable::Eof => "W",
            Variable::SigmaEof => "sigma_eof",
            Variable::Trend => "trend_g",
            Variable::Offset => "offset",
            Variable::Sigma => "sigma",
            Variable::SigmaCluster => "sigma_hier",
        };
        f.write_str(name)
    }
}

/// Per-draw sampler statistics, each `[chain, draw]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SampleStat {
    Lp,
    AcceptanceRate,
    StepSize,
    Energy,
    Diverging,
}

impl fmt::Display for SampleStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SampleStat::Lp => "lp",
            SampleStat::AcceptanceRate => "acceptance_rate",
            SampleStat::StepSize => "step_size",
            SampleStat::Energy => "energy",
            SampleStat::Diverging => "diverging",
        };
        f.write_str(name)
    }
}

/// Pointwise log-likelihood, `[chain, draw, space]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogLikelihood {
    Observations,
}

impl fmt::Display for LogLikelihood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Observations")
    }
}

/// Reduction applied along the draw axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reduction {
    Mean,
    /// Population standard deviation.
    Std,
}

impl Reduction {
    fn reduce(self, view: ArrayViewD<'_, f64>) -> Result<ArrayD<f64>> {
        let n_draws = view.shape()[1];
        if n_draws == 0 {
            return Err(BpcaError::IndexOutOfRange {
                what: "draw",
                index: 0,
                len: 0,
            });
        }
        let reduced = match self {
            Reduction::Mean => view.sum_axis(Axis(1)) / n_draws as f64,
            Reduction::Std => view.std_axis(Axis(1), 0.0),
        };
        Ok(reduced.insert_axis(Axis(1)))
    }
}

/// A set of variables sharing the `[chain, draw]` leading axes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group<K: Ord> {
    vars: BTreeMap<K, ArrayD<f64>>,
}

impl<K: Ord> Default for Group<K> {
    fn default() -> Self {
        Self {
            vars: BTreeMap::new(),
        }
    }
}

impl<K> Group<K>
where
    K: Ord + Copy + fmt::Display,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: K, values: ArrayD<f64>) {
        self.vars.insert(key, values);
    }

    pub fn get(&self, key: K) -> Option<&ArrayD<f64>> {
        self.vars.get(&key)
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut ArrayD<f64>> {
        self.vars.get_mut(&key)
    }

    pub fn require(&self, key: K) -> Result<&ArrayD<f64>> {
        self.vars
            .get(&key)
            .ok_or_else(|| BpcaError::MissingVariable(key.to_string()))
    }

    pub fn contains(&self, key: K) -> bool {
        self.vars.contains_key(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &ArrayD<f64>)> + '_ {
        self.vars.iter().map(|(k, v)| (*k, v))
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn n_chains(&self) -> usize {
        self.vars.values().next().map_or(0, |a| a.shape()[0])
    }

    pub fn n_draws(&self) -> usize {
        self.vars.values().next().map_or(0, |a| a.shape()[1])
    }

    /// Reduces the draws in `draws` of every variable.
    pub fn reduce(&self, reduction: Reduction, draws: Range<usize>) -> Result<Self> {
        let n_draws = self.n_draws();
        if draws.end > n_draws {
            return Err(BpcaError::WindowOutOfRange {
                start: draws.start,
                end: draws.end,
                n_draws,
            });
        }
        let vars = self
            .vars
            .iter()
            .map(|(&key, values)| {
                let window = values.slice_axis(Axis(1), Slice::from(draws.clone()));
                Ok((key, reduction.reduce(window)?))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self { vars })
    }

    /// Reduces the whole draw axis.
    pub fn reduce_all(&self, reduction: Reduction) -> Result<Self> {
        self.reduce(reduction, 0..self.n_draws())
    }

    /// Concatenates groups with identical variables along the draw axis.
    pub fn concat_draws(parts: &[Self]) -> Result<Self> {
        let first = match parts.first() {
            Some(first) => first,
            None => return Ok(Self::default()),
        };
        let mut vars = BTreeMap::new();
        for &key in first.vars.keys() {
            let views = parts
                .iter()
                .map(|part| part.require(key).map(|a| a.view()))
                .collect::<Result<Vec<_>>>()?;
            vars.insert(key, concatenate(Axis(1), &views)?);
        }
        Ok(Self { vars })
    }
}

impl Group<Variable> {
    /// Series of component `k` at `[chain, draw]`; the last axis of a per-component variable.
    pub fn component(&self, var: Variable, chain: usize, draw: usize, k: usize) -> Result<Array1<f64>> {
        let values = self.require(var)?;
        check_index("chain", chain, values.shape()[0])?;
        check_index("draw", draw, values.shape()[1])?;
        check_index("component", k, values.shape().get(2).copied().unwrap_or(0))?;
        let series = values
            .index_axis(Axis(0), chain)
            .index_axis_move(Axis(0), draw)
            .index_axis_move(Axis(0), k);
        Ok(series.into_dimensionality::<ndarray::Ix1>()?.to_owned())
    }

    /// Space-indexed vector at `[chain, draw]`, e.g. the trend pattern.
    pub fn vector(&self, var: Variable, chain: usize, draw: usize) -> Result<Array1<f64>> {
        let values = self.require(var)?;
        check_index("chain", chain, values.shape()[0])?;
        check_index("draw", draw, values.shape()[1])?;
        let vector = values
            .index_axis(Axis(0), chain)
            .index_axis_move(Axis(0), draw);
        Ok(vector.into_dimensionality::<ndarray::Ix1>()?.to_owned())
    }

    /// Number of PCA components stored in the group.
    pub fn n_components(&self) -> usize {
        self.get(Variable::Pc).map_or(0, |pc| pc.shape()[2])
    }
}

fn check_index(what: &'static str, index: usize, len: usize) -> Result<()> {
    if index >= len {
        return Err(BpcaError::IndexOutOfRange { what, index, len });
    }
    Ok(())
}

/// Posterior draws plus sampler statistics and pointwise log-likelihood.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InferenceData {
    pub posterior: Group<Variable>,
    pub sample_stats: Group<SampleStat>,
    pub log_likelihood: Group<LogLikelihood>,
}

impl InferenceData {
    pub fn reduce_all(&self, reduction: Reduction) -> Result<Self> {
        Ok(Self {
            posterior: self.posterior.reduce_all(reduction)?,
            sample_stats: self.sample_stats.reduce_all(reduction)?,
            log_likelihood: self.log_likelihood.reduce_all(reduction)?,
        })
    }

    pub fn n_chains(&self) -> usize {
        self.posterior.n_chains()
    }

    pub fn n_draws(&self) -> usize {
        self.posterior.n_draws()
    }
}

/// Posterior reductions over a few contiguous draw windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomWindows {
    pub mean: Group<Variable>,
    pub std: Group<Variable>,
    /// First draw of every window.
    pub starts: Vec<usize>,
    /// Draws per window.
    pub size: usize,
}

impl RandomWindows {
    pub fn n_windows(&self) -> usize {
        self.starts.len()
    }
}

/// Draw-reduced trace; replaces the full trace once compressed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedTrace {
    pub mean: InferenceData,
    pub std: InferenceData,
    pub random: RandomWindows,
}

/// Either the full draws or their compressed summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Trace {
    Full(InferenceData),
    Compressed(CompressedTrace),
}

impl Trace {
    pub fn is_compressed(&self) -> bool {
        matches!(self, Trace::Compressed(_))
    }

    pub fn full(&self) -> Result<&InferenceData> {
        match self {
            Trace::Full(data) => Ok(data),
            Trace::Compressed(_) => Err(BpcaError::TraceCompressed),
        }
    }

    pub fn full_mut(&mut self) -> Result<&mut InferenceData> {
        match self {
            Trace::Full(data) => Ok(data),
            Trace::Compressed(_) => Err(BpcaError::TraceCompressed),
        }
    }

    pub fn n_chains(&self) -> usize {
        match self {
            Trace::Full(data) => data.n_chains(),
            Trace::Compressed(compressed) => compressed.mean.n_chains(),
        }
    }
}
