//! Batched Hamiltonian Monte Carlo over the BPCA posterior, using `burn` for autodiff.
//!
//! All chains advance together: the target evaluates the log density of a `[n_chains, D]`
//! batch in one pass and autodiff returns the gradient for every chain at once. Chain state
//! lives on the host as `ndarray` arrays; each log-density evaluation moves the batch onto
//! the backend device and reads log density and gradient back.
//!
//! During tuning the shared step size is adapted by dual averaging (Hoffman & Gelman, 2014)
//! towards the requested mean acceptance probability, starting from a step size found with
//! the usual doubling/halving heuristic. Tuning draws are discarded.

use std::collections::VecDeque;
use std::marker::PhantomData;

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{s, Array1, Array2, Array3, ArrayD, Axis, IxDyn};
use rand::prelude::*;
use rand_distr::StandardNormal;

use crate::config::{NoiseModel, SampleSettings};
use crate::error::{BpcaError, Result};
use crate::model::BpcaModel;
use crate::stats::RhatMulti;
use crate::trace::{Group, InferenceData, LogLikelihood, SampleStat, Variable};

/// A batched target computing the unnormalized log density of many positions at once.
pub trait GradientTarget<B: AutodiffBackend> {
    /// Log density of a `[n_chains, D]` batch, one value per chain.
    fn log_prob_batch(&self, positions: &Tensor<B, 2>) -> Tensor<B, 1>;
}

impl<B: AutodiffBackend, T: GradientTarget<B>> GradientTarget<B> for &T {
    fn log_prob_batch(&self, positions: &Tensor<B, 2>) -> Tensor<B, 1> {
        (**self).log_prob_batch(positions)
    }
}

/// Energy error above which a trajectory counts as divergent.
const MAX_ENERGY_ERROR: f64 = 1000.0;

/// Outcome of one batched update.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub accept_prob: Array1<f64>,
    pub accepted: Vec<bool>,
    pub diverging: Vec<bool>,
    /// Hamiltonian at the end of the step, per chain.
    pub energy: Array1<f64>,
}

/// Draws and per-draw statistics of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct HmcOutput {
    /// `[n_chains, n_draws, D]`
    pub positions: Array3<f64>,
    /// `[n_chains, n_draws]`
    pub logp: Array2<f64>,
    pub accept_prob: Array2<f64>,
    pub energy: Array2<f64>,
    pub diverging: Array2<f64>,
    pub step_size: f64,
}

/// Dual averaging of the log step size.
#[derive(Debug, Clone, PartialEq)]
struct DualAveraging {
    mu: f64,
    target: f64,
    log_step: f64,
    log_step_bar: f64,
    h_bar: f64,
    count: usize,
}

impl DualAveraging {
    const GAMMA: f64 = 0.05;
    const T0: f64 = 10.0;
    const KAPPA: f64 = 0.75;

    fn new(initial_step: f64, target: f64) -> Self {
        Self {
            mu: (10.0 * initial_step).ln(),
            target,
            log_step: initial_step.ln(),
            log_step_bar: 0.0,
            h_bar: 0.0,
            count: 0,
        }
    }

    fn update(&mut self, accept_prob: f64) -> f64 {
        self.count += 1;
        let m = self.count as f64;
        let w = 1.0 / (m + Self::T0);
        self.h_bar = (1.0 - w) * self.h_bar + w * (self.target - accept_prob);
        self.log_step = self.mu - m.sqrt() / Self::GAMMA * self.h_bar;
        let eta = m.powf(-Self::KAPPA);
        self.log_step_bar = eta * self.log_step + (1.0 - eta) * self.log_step_bar;
        self.log_step.exp()
    }

    fn final_step(&self) -> f64 {
        self.log_step_bar.exp()
    }
}

/// A data-parallel HMC sampler.
#[derive(Debug, Clone)]
pub struct HMC<B, GTarget>
where
    B: AutodiffBackend,
{
    /// Provides log density and gradients.
    pub target: GTarget,
    pub step_size: f64,
    pub n_leapfrog: usize,
    /// `[n_chains, D]`
    pub positions: Array2<f64>,
    logp: Array1<f64>,
    grad: Array2<f64>,
    pub rng: SmallRng,
    device: B::Device,
    _backend: PhantomData<B>,
}

impl<B, GTarget> HMC<B, GTarget>
where
    B: AutodiffBackend,
    GTarget: GradientTarget<B>,
{
    pub fn new(
        target: GTarget,
        initial_positions: Array2<f64>,
        step_size: f64,
        n_leapfrog: usize,
    ) -> Result<Self> {
        let mut sampler = Self {
            target,
            step_size,
            n_leapfrog,
            logp: Array1::zeros(initial_positions.nrows()),
            grad: Array2::zeros(initial_positions.raw_dim()),
            positions: initial_positions,
            rng: SmallRng::from_entropy(),
            device: B::Device::default(),
            _backend: PhantomData,
        };
        let (logp, grad) = sampler.logp_and_grad(&sampler.positions)?;
        if logp.iter().any(|v| !v.is_finite()) {
            return Err(BpcaError::Backend(
                "log density is not finite at the initial positions".to_string(),
            ));
        }
        sampler.logp = logp;
        sampler.grad = grad;
        Ok(sampler)
    }

    /// Sets a new random seed.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    pub fn n_chains(&self) -> usize {
        self.positions.nrows()
    }

    /// Log density and its gradient for every row of `positions`.
    fn logp_and_grad(&self, positions: &Array2<f64>) -> Result<(Array1<f64>, Array2<f64>)> {
        let (n_chains, dim) = positions.dim();
        let data = TensorData::new(positions.iter().copied().collect::<Vec<f64>>(), [n_chains, dim])
            .convert::<B::FloatElem>();
        let pos = Tensor::<B, 2>::from_data(data, &self.device).require_grad();
        let logp = self.target.log_prob_batch(&pos);
        let logp_host = to_host(logp.to_data())?;
        let grads = logp.sum().backward();
        let grad = pos
            .grad(&grads)
            .ok_or_else(|| BpcaError::Backend("no gradient for the positions".to_string()))?;
        let grad_host = to_host(grad.into_data())?;
        Ok((
            Array1::from(logp_host),
            Array2::from_shape_vec((n_chains, dim), grad_host)?,
        ))
    }

    /// Integrates `n_steps` leapfrog steps from the current state.
    fn leapfrog(
        &self,
        momentum: &Array2<f64>,
        step_size: f64,
        n_steps: usize,
    ) -> Result<(Array2<f64>, Array2<f64>, Array1<f64>, Array2<f64>)> {
        let mut pos = self.positions.clone();
        let mut mom = momentum.clone();
        let mut grad = self.grad.clone();
        let mut logp = self.logp.clone();
        for _ in 0..n_steps {
            mom.scaled_add(0.5 * step_size, &grad);
            pos.scaled_add(step_size, &mom);
            (logp, grad) = self.logp_and_grad(&pos)?;
            if logp.iter().all(|v| !v.is_finite()) {
                break;
            }
            mom.scaled_add(0.5 * step_size, &grad);
        }
        Ok((pos, mom, logp, grad))
    }

    fn sample_momentum(&mut self) -> Array2<f64> {
        let rng = &mut self.rng;
        Array2::from_shape_simple_fn(self.positions.raw_dim(), || rng.sample(StandardNormal))
    }

    /// Per-chain `min(1, exp(H0 - H1))` and whether the energy error diverged.
    fn acceptance(h0: &Array1<f64>, h1: &Array1<f64>) -> (Array1<f64>, Vec<bool>) {
        let mut diverging = Vec::with_capacity(h0.len());
        let accept = Array1::from_iter(h0.iter().zip(h1).map(|(&a, &b)| {
            let log_ratio = a - b;
            if !log_ratio.is_finite() {
                diverging.push(true);
                return 0.0;
            }
            diverging.push(-log_ratio > MAX_ENERGY_ERROR);
            log_ratio.exp().min(1.0)
        }));
        (accept, diverging)
    }

    /// One batched HMC update of all chains.
    pub fn step(&mut self) -> Result<Transition> {
        let momentum = self.sample_momentum();
        let h0 = kinetic(&momentum) - &self.logp;
        let (pos, mom, logp, grad) = self.leapfrog(&momentum, self.step_size, self.n_leapfrog)?;
        let h1 = kinetic(&mom) - &logp;
        let (accept_prob, diverging) = Self::acceptance(&h0, &h1);

        let mut accepted = Vec::with_capacity(self.n_chains());
        for chain in 0..self.n_chains() {
            let take = self.rng.gen::<f64>() < accept_prob[chain];
            if take {
                self.positions.row_mut(chain).assign(&pos.row(chain));
                self.grad.row_mut(chain).assign(&grad.row(chain));
                self.logp[chain] = logp[chain];
            }
            accepted.push(take);
        }
        let energy = Array1::from_iter(
            (0..self.n_chains()).map(|c| if accepted[c] { h1[c] } else { h0[c] }),
        );
        Ok(Transition {
            accept_prob,
            accepted,
            diverging,
            energy,
        })
    }

    /// Doubles or halves the step size until a single leapfrog step has a mean
    /// acceptance probability that crosses one half.
    pub fn find_reasonable_step_size(&mut self) -> Result<f64> {
        let mean_accept = |sampler: &mut Self, step_size: f64| -> Result<f64> {
            let momentum = sampler.sample_momentum();
            let h0 = kinetic(&momentum) - &sampler.logp;
            let (_, mom, logp, _) = sampler.leapfrog(&momentum, step_size, 1)?;
            let h1 = kinetic(&mom) - &logp;
            let (accept, _) = Self::acceptance(&h0, &h1);
            Ok(accept.mean().unwrap_or(0.0))
        };
        let mut step_size = self.step_size;
        let mut accept = mean_accept(self, step_size)?;
        let direction: f64 = if accept > 0.5 { 1.0 } else { -1.0 };
        for _ in 0..100 {
            if direction * accept.ln() <= -direction * 2f64.ln() {
                break;
            }
            step_size *= 2f64.powf(direction);
            accept = mean_accept(self, step_size)?;
        }
        self.step_size = step_size;
        Ok(step_size)
    }

    /// Tunes for `n_tune` steps, then collects `n_collect` draws.
    ///
    /// With `progress` set, a bar reports the windowed acceptance rate and the running
    /// maximum potential scale reduction over all coordinates.
    pub fn run(
        &mut self,
        n_collect: usize,
        n_tune: usize,
        target_accept: f64,
        progress: bool,
    ) -> Result<HmcOutput> {
        let (n_chains, dim) = self.positions.dim();
        let pb = if progress {
            ProgressBar::new((n_tune + n_collect) as u64)
        } else {
            ProgressBar::hidden()
        };
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:8} {bar:40.white} ETA {eta:3} | {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );

        if n_tune > 0 {
            pb.set_prefix("tune");
            let initial = self.find_reasonable_step_size()?;
            log::debug!("initial step size {initial:.3e}");
            let mut adaptation = DualAveraging::new(initial, target_accept);
            for _ in 0..n_tune {
                let transition = self.step()?;
                let mean_accept = transition.accept_prob.mean().unwrap_or(0.0);
                self.step_size = adaptation.update(mean_accept);
                pb.inc(1);
                pb.set_message(format!("step size {:.2e}", self.step_size));
            }
            self.step_size = adaptation.final_step();
            log::info!("tuned step size {:.3e} after {n_tune} steps", self.step_size);
        }

        let mut out = HmcOutput {
            positions: Array3::zeros((n_chains, n_collect, dim)),
            logp: Array2::zeros((n_chains, n_collect)),
            accept_prob: Array2::zeros((n_chains, n_collect)),
            energy: Array2::zeros((n_chains, n_collect)),
            diverging: Array2::zeros((n_chains, n_collect)),
            step_size: self.step_size,
        };

        pb.set_prefix("HMC");
        let window_size = 100;
        let mut accept_window: VecDeque<f64> = VecDeque::with_capacity(window_size);
        let mut psr = RhatMulti::new(n_chains, dim);

        for draw in 0..n_collect {
            let transition = self.step()?;
            out.positions
                .slice_mut(s![.., draw, ..])
                .assign(&self.positions);
            out.logp.column_mut(draw).assign(&self.logp);
            out.accept_prob.column_mut(draw).assign(&transition.accept_prob);
            out.energy.column_mut(draw).assign(&transition.energy);
            for (chain, &d) in transition.diverging.iter().enumerate() {
                out.diverging[[chain, draw]] = if d { 1.0 } else { 0.0 };
            }

            let rate =
                transition.accepted.iter().filter(|&&a| a).count() as f64 / n_chains as f64;
            accept_window.push_front(rate);
            if accept_window.len() > window_size {
                accept_window.pop_back();
            }
            pb.inc(1);
            if progress {
                psr.step(self.positions.view())?;
                let avg = accept_window.iter().sum::<f64>() / accept_window.len() as f64;
                pb.set_message(format!("p(accept)≈{:.2} max(rhat)≈{:.2}", avg, psr.max()));
            }
        }
        pb.finish_with_message("Done!");

        let n_divergent = out.diverging.iter().filter(|&&d| d > 0.0).count();
        if n_divergent > 0 {
            log::warn!("{n_divergent} divergent transitions after tuning");
        }
        Ok(out)
    }
}

fn kinetic(momentum: &Array2<f64>) -> Array1<f64> {
    momentum.mapv(|p| p * p).sum_axis(Axis(1)) * 0.5
}

fn to_host(data: TensorData) -> Result<Vec<f64>> {
    data.convert::<f64>()
        .to_vec::<f64>()
        .map_err(|e| BpcaError::Backend(format!("{e:?}")))
}

/// Samples the posterior of `model` and records it as an [`InferenceData`] trace.
pub fn sample<B: AutodiffBackend>(
    model: &BpcaModel,
    n_samples: usize,
    settings: &SampleSettings,
) -> Result<InferenceData> {
    settings.validate()?;
    let mut rng = match settings.seed {
        Some(seed) => SmallRng::seed_from_u64(seed),
        None => SmallRng::from_entropy(),
    };
    let initial = model.initial_positions(settings.cores, &mut rng);
    log::info!(
        "sampling {} chains of {} parameters: {} tuning + {} draws",
        settings.cores,
        model.layout().dim,
        settings.tune,
        n_samples
    );
    let mut sampler = HMC::<B, _>::new(model, initial, 0.01, settings.n_leapfrog)?;
    sampler.rng = rng;
    let output = sampler.run(n_samples, settings.tune, settings.target_accept, settings.progress)?;
    record(model, &output)
}

/// Unpacks raw draws into named posterior variables, pointwise log-likelihood and
/// sampler statistics.
pub(crate) fn record(model: &BpcaModel, output: &HmcOutput) -> Result<InferenceData> {
    let (n_chains, n_draws, _) = output.positions.dim();
    let layout = model.layout();
    let (t, sp, k) = (layout.n_time, layout.n_space, layout.n_components);
    let noise = model.settings().noise_model();

    let zeros = |tail: &[usize]| {
        let mut shape = vec![n_chains, n_draws];
        shape.extend_from_slice(tail);
        ArrayD::<f64>::zeros(IxDyn(&shape))
    };
    let mut pcs = zeros(&[k, t]);
    let mut eofs = zeros(&[k, sp]);
    let mut sigma_eof = layout.log_sigma_eof.as_ref().map(|_| zeros(&[k]));
    let mut trend = layout.trend.as_ref().map(|_| zeros(&[sp]));
    let mut offset = layout.offset.as_ref().map(|_| zeros(&[sp]));
    let mut sigma = match noise {
        NoiseModel::Scalar => zeros(&[]),
        _ => zeros(&[sp]),
    };
    let mut sigma_cluster = match noise {
        NoiseModel::Clustered { n_clusters } => Some(zeros(&[n_clusters])),
        _ => None,
    };
    let mut log_lik = zeros(&[sp]);

    for chain in 0..n_chains {
        for draw in 0..n_draws {
            let position = output.positions.slice(s![chain, draw, ..]);
            let params = model.unpack(position)?;
            let at = |array: &mut ArrayD<f64>, values: ArrayD<f64>| {
                array
                    .index_axis_mut(Axis(0), chain)
                    .index_axis_mut(Axis(0), draw)
                    .assign(&values);
            };
            at(&mut pcs, params.pcs.clone().into_dyn());
            at(&mut eofs, params.eofs.clone().into_dyn());
            if let (Some(array), Some(values)) = (sigma_eof.as_mut(), &params.sigma_eof) {
                at(array, values.clone().into_dyn());
            }
            if let (Some(array), Some(values)) = (trend.as_mut(), &params.trend) {
                at(array, values.clone().into_dyn());
            }
            if let (Some(array), Some(values)) = (offset.as_mut(), &params.offset) {
                at(array, values.clone().into_dyn());
            }
            match noise {
                NoiseModel::Scalar => sigma[&[chain, draw][..]] = params.sigma[0],
                _ => at(&mut sigma, params.sigma.clone().into_dyn()),
            }
            if let (Some(array), Some(values)) = (sigma_cluster.as_mut(), &params.sigma_cluster) {
                at(array, values.clone().into_dyn());
            }
            at(&mut log_lik, model.pointwise_log_likelihood(&params).into_dyn());
        }
    }

    let mut posterior = Group::new();
    posterior.insert(Variable::Pc, pcs);
    posterior.insert(Variable::Eof, eofs);
    if let Some(values) = sigma_eof {
        posterior.insert(Variable::SigmaEof, values);
    }
    if let Some(values) = trend {
        posterior.insert(Variable::Trend, values);
    }
    if let Some(values) = offset {
        posterior.insert(Variable::Offset, values);
    }
    posterior.insert(Variable::Sigma, sigma);
    if let Some(values) = sigma_cluster {
        posterior.insert(Variable::SigmaCluster, values);
    }

    let mut sample_stats = Group::new();
    sample_stats.insert(SampleStat::Lp, output.logp.clone().into_dyn());
    sample_stats.insert(SampleStat::AcceptanceRate, output.accept_prob.clone().into_dyn());
    sample_stats.insert(
        SampleStat::StepSize,
        Array2::from_elem((n_chains, n_draws), output.step_size).into_dyn(),
    );
    sample_stats.insert(SampleStat::Energy, output.energy.clone().into_dyn());
    sample_stats.insert(SampleStat::Diverging, output.diverging.clone().into_dyn());

    let mut log_likelihood = Group::new();
    log_likelihood.insert(LogLikelihood::Observations, log_lik);

    Ok(InferenceData {
        posterior,
        sample_stats,
        log_likelihood,
    })
}
