//! MCMC diagnostics: online and split R-hat, effective sample size, variable summaries
//! and per-chain WAIC comparison.

use std::fmt;

use ndarray::prelude::*;
use ndarray_stats::QuantileExt;
use rayon::prelude::*;
use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};

use crate::error::{BpcaError, Result};
use crate::trace::{Group, LogLikelihood, Variable};

/// Running potential scale reduction across chains, updated one draw at a time.
#[derive(Debug, Clone, PartialEq)]
pub struct RhatMulti {
    n: usize,
    mean: Array2<f64>,    // n_chains x n_params
    mean_sq: Array2<f64>, // n_chains x n_params
    n_chains: usize,
    n_params: usize,
}

impl RhatMulti {
    pub fn new(n_chains: usize, n_params: usize) -> Self {
        Self {
            n: 0,
            mean: Array2::<f64>::zeros((n_chains, n_params)),
            mean_sq: Array2::<f64>::zeros((n_chains, n_params)),
            n_chains,
            n_params,
        }
    }

    /// Adds one draw of every chain, `x` shaped `[n_chains, n_params]`.
    pub fn step(&mut self, x: ArrayView2<'_, f64>) -> Result<()> {
        if x.dim() != (self.n_chains, self.n_params) {
            return Err(BpcaError::ShapeMismatch {
                what: "online R-hat state",
                expected: self.n_chains * self.n_params,
                found: x.len(),
            });
        }
        self.n += 1;
        let n = self.n as f64;
        self.mean = (&self.mean * (n - 1.0) + &x) / n;
        self.mean_sq = (&self.mean_sq * (n - 1.0) + &x.pow2()) / n;
        Ok(())
    }

    /// R-hat of every parameter; NaN before two draws or with a single chain.
    pub fn all(&self) -> Array1<f64> {
        if self.n < 2 || self.n_chains < 2 {
            return Array1::from_elem(self.n_params, f64::NAN);
        }
        let n = self.n as f64;
        let n_chains = self.n_chains as f64;
        let mean_chain = self.mean.sum_axis(Axis(0)) / n_chains;
        let between = (&self.mean - &mean_chain.insert_axis(Axis(0)))
            .pow2()
            .sum_axis(Axis(0))
            * (n / (n_chains - 1.0));
        let sm2 = (&self.mean_sq - &self.mean.pow2()) * n / (n - 1.0);
        let within = sm2.sum_axis(Axis(0)) / n_chains;
        let var = &within * ((n - 1.0) / n) + between * (1.0 / n);
        (var / within).sqrt()
    }

    /// Largest finite R-hat, NaN if there is none.
    pub fn max(&self) -> f64 {
        finite_max(self.all().iter().copied())
    }
}

fn finite_max(values: impl Iterator<Item = f64>) -> f64 {
    let finite: Array1<f64> = values.filter(|v| v.is_finite()).collect();
    finite.max().copied().unwrap_or(f64::NAN)
}

/// Biased autocovariance of `x` at lags `0..n`, via zero-padded FFT.
pub fn autocovariance(x: ArrayView1<'_, f64>) -> Array1<f64> {
    let n = x.len();
    if n == 0 {
        return Array1::zeros(0);
    }
    let mean = x.sum() / n as f64;
    let size = (2 * n).next_power_of_two();
    let mut buffer: Vec<Complex<f64>> = x
        .iter()
        .map(|&v| Complex::new(v - mean, 0.0))
        .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
        .take(size)
        .collect();
    let mut planner = FftPlanner::new();
    planner.plan_fft_forward(size).process(&mut buffer);
    for value in buffer.iter_mut() {
        *value = Complex::new(value.norm_sqr(), 0.0);
    }
    planner.plan_fft_inverse(size).process(&mut buffer);
    Array1::from_iter(buffer.iter().take(n).map(|c| c.re / (size * n) as f64))
}

/// Split R-hat and mean-ESS of one parameter given per-chain draws `[chain, draw]`.
fn split_rhat_ess_single(draws: ArrayView2<'_, f64>) -> (f64, f64) {
    let (n_chains, n_draws) = draws.dim();
    let n = n_draws / 2;
    if n_chains == 0 || n < 2 {
        return (f64::NAN, f64::NAN);
    }
    // Each chain contributes its first and last `n` draws; the middle draw of an
    // odd-length chain is dropped.
    let halves: Vec<ArrayView1<'_, f64>> = draws
        .outer_iter()
        .flat_map(|chain| {
            let len = chain.len();
            [chain.slice_move(s![..n]), chain.slice_move(s![len - n..])]
        })
        .collect();
    let m = halves.len() as f64;
    let nf = n as f64;

    let acov: Vec<Array1<f64>> = halves.iter().map(|h| autocovariance(h.view())).collect();
    let means: Array1<f64> = halves.iter().map(|h| h.sum() / nf).collect();
    let chain_var = Array1::from_iter(acov.iter().map(|a| a[0] * nf / (nf - 1.0)));
    let within = chain_var.sum() / m;
    let mean_of_means = means.sum() / m;
    let between_over_n = means.mapv(|v| (v - mean_of_means).powi(2)).sum() / (m - 1.0).max(1.0);
    let var_plus = within * (nf - 1.0) / nf + between_over_n;
    if within.is_nan() || within <= 0.0 {
        return (f64::NAN, f64::NAN);
    }
    let rhat = (var_plus / within).sqrt();

    let mean_acov = |lag: usize| acov.iter().map(|a| a[lag]).sum::<f64>() / m;
    let rho = |lag: usize| {
        if lag == 0 {
            1.0
        } else {
            1.0 - (within - mean_acov(lag)) / var_plus
        }
    };
    // Geyer's initial positive, monotone sequence of paired autocorrelations.
    let mut tau = -1.0;
    let mut previous = f64::INFINITY;
    let mut lag = 0;
    while lag + 1 < n {
        let pair = rho(lag) + rho(lag + 1);
        if pair <= 0.0 {
            break;
        }
        let pair = pair.min(previous);
        tau += 2.0 * pair;
        previous = pair;
        lag += 2;
    }
    let total = m * nf;
    let tau = tau.max(1.0 / total.log10().max(1.0));
    (rhat, total / tau)
}

/// Split R-hat and mean-ESS of every parameter of `samples` shaped `[chain, draw, param]`.
pub fn split_rhat_mean_ess(samples: ArrayView3<'_, f64>) -> (Array1<f64>, Array1<f64>) {
    let n_params = samples.shape()[2];
    let pairs: Vec<(f64, f64)> = (0..n_params)
        .into_par_iter()
        .map(|p| split_rhat_ess_single(samples.index_axis(Axis(2), p)))
        .collect();
    let (rhat, ess): (Vec<f64>, Vec<f64>) = pairs.into_iter().unzip();
    (Array1::from(rhat), Array1::from(ess))
}

/// Summary of one variable, or one component of a per-component variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSummary {
    pub variable: Variable,
    pub component: Option<usize>,
    pub mean: f64,
    pub sd: f64,
    /// Mean split R-hat over the variable's elements.
    pub r_hat: f64,
    /// Mean effective sample size over the variable's elements.
    pub ess_mean: f64,
}

impl VariableSummary {
    pub fn label(&self) -> String {
        match self.component {
            Some(k) => format!("{}{k}", self.variable),
            None => self.variable.to_string(),
        }
    }

    fn from_draws(variable: Variable, component: Option<usize>, draws: ArrayViewD<'_, f64>) -> Result<Self> {
        let shape = draws.shape();
        let (n_chains, n_draws) = (shape[0], shape[1]);
        let n_params = shape[2..].iter().product::<usize>();
        let flat = draws
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((n_chains, n_draws, n_params))?;
        let (rhat, ess) = split_rhat_mean_ess(flat.view());
        let mean = flat.mean().unwrap_or(f64::NAN);
        let sd = flat.std(0.0);
        Ok(Self {
            variable,
            component,
            mean,
            sd,
            r_hat: nan_mean(rhat.view()),
            ess_mean: nan_mean(ess.view()),
        })
    }
}

fn nan_mean(values: ArrayView1<'_, f64>) -> f64 {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return f64::NAN;
    }
    finite.iter().sum::<f64>() / finite.len() as f64
}

/// Summaries of every posterior variable, split per component where applicable.
pub fn summary(posterior: &Group<Variable>) -> Result<Vec<VariableSummary>> {
    let mut rows = Vec::new();
    for (variable, values) in posterior.iter() {
        if variable.is_per_component() {
            for k in 0..values.shape()[2] {
                let draws = values.index_axis(Axis(2), k);
                rows.push(VariableSummary::from_draws(variable, Some(k), draws)?);
            }
        } else {
            rows.push(VariableSummary::from_draws(variable, None, values.view())?);
        }
    }
    Ok(rows)
}

/// Convergence statistics of the sampled posterior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceStats {
    pub rows: Vec<VariableSummary>,
    /// Kept draws per chain, the reference for [`ConvergenceStats::relative_ess`].
    pub n_samples: usize,
}

impl ConvergenceStats {
    /// Mean ESS of each row divided by the number of kept draws per chain.
    pub fn relative_ess(&self) -> Vec<f64> {
        self.rows
            .iter()
            .map(|row| row.ess_mean / self.n_samples as f64)
            .collect()
    }

    pub fn max_rhat(&self) -> f64 {
        finite_max(self.rows.iter().map(|row| row.r_hat))
    }

    /// Whether every row has a finite R-hat below `threshold`.
    pub fn converged(&self, threshold: f64) -> bool {
        self.rows.iter().all(|row| row.r_hat.is_finite() && row.r_hat < threshold)
    }
}

impl fmt::Display for ConvergenceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<14} {:>10} {:>10} {:>8} {:>10} {:>8}",
            "variable", "mean", "sd", "r_hat", "ess_mean", "ess/n"
        )?;
        for (row, rel) in self.rows.iter().zip(self.relative_ess()) {
            writeln!(
                f,
                "{:<14} {:>10.4} {:>10.4} {:>8.3} {:>10.0} {:>8.3}",
                row.label(),
                row.mean,
                row.sd,
                row.r_hat,
                row.ess_mean,
                rel
            )?;
        }
        Ok(())
    }
}

/// Convergence statistics, restricted to the leading PC and EOF, trend and noise
/// scale when `main_components_only` is set.
pub fn convergence(
    posterior: &Group<Variable>,
    main_components_only: bool,
    n_samples: usize,
) -> Result<ConvergenceStats> {
    let rows = summary(posterior)?
        .into_iter()
        .filter(|row| {
            !main_components_only
                || match row.variable {
                    Variable::Pc | Variable::Eof => row.component == Some(0),
                    Variable::Trend | Variable::Sigma => true,
                    _ => false,
                }
        })
        .collect();
    Ok(ConvergenceStats { rows, n_samples })
}

/// WAIC of one chain, ranked against the other chains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainComparison {
    pub chain: usize,
    /// Zero for the chain with the highest expected log predictive density.
    pub rank: usize,
    pub elpd_waic: f64,
    pub p_waic: f64,
    /// Standard error of `elpd_waic` over locations.
    pub se: f64,
    /// Difference to the best chain.
    pub d_elpd: f64,
}

fn log_mean_exp(values: ArrayView1<'_, f64>) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = values.iter().map(|v| (v - max).exp()).sum();
    max + (sum / values.len() as f64).ln()
}

/// Compares chains by WAIC computed from the pointwise log-likelihood
/// `[chain, draw, location]`. Rows are sorted by rank.
pub fn compare_chains(log_likelihood: &Group<LogLikelihood>) -> Result<Vec<ChainComparison>> {
    let values = log_likelihood.require(LogLikelihood::Observations)?;
    let values = values.view().into_dimensionality::<Ix3>()?;
    let (n_chains, n_draws, n_points) = values.dim();
    if n_draws < 2 {
        return Err(BpcaError::InvalidSetting {
            name: "n_samples",
            reason: "WAIC needs at least two draws per chain".to_string(),
        });
    }
    let mut rows: Vec<ChainComparison> = (0..n_chains)
        .into_par_iter()
        .map(|chain| {
            let draws = values.index_axis(Axis(0), chain);
            let pointwise = Array1::from_iter(draws.axis_iter(Axis(1)).map(|point| {
                let lppd = log_mean_exp(point);
                let p_waic = point.var(1.0);
                (lppd - p_waic, p_waic)
            }));
            let elpd_i = pointwise.mapv(|(e, _)| e);
            let elpd = elpd_i.sum();
            let p_waic = pointwise.iter().map(|(_, p)| p).sum();
            let se = (n_points as f64 * elpd_i.var(0.0)).sqrt();
            ChainComparison {
                chain,
                rank: 0,
                elpd_waic: elpd,
                p_waic,
                se,
                d_elpd: 0.0,
            }
        })
        .collect();
    rows.sort_by(|a, b| b.elpd_waic.total_cmp(&a.elpd_waic));
    let best = rows.first().map_or(f64::NAN, |row| row.elpd_waic);
    for (rank, row) in rows.iter_mut().enumerate() {
        row.rank = rank;
        row.d_elpd = best - row.elpd_waic;
    }
    Ok(rows)
}
