//! The BPCA model: priors, likelihood and the flat parameter layout the sampler moves in.
//!
//! ```text
//! Y(t, x) = Σ_k PC_k(t) W_k(x) + r(t) trend(x) + offset(x) + ε,   ε ~ Normal(0, sigma)
//! ```
//!
//! * `PC_k` is a Gaussian random walk (flat start) whose innovation scale shrinks by
//!   `sigma_random_walk_factor` per component, so earlier components carry more variance.
//! * `W_k ~ Normal(0, sigma_eof_k)`, with `sigma_eof_k ~ HalfNormal(sigma_eofs)` when estimated.
//! * `trend ~ Normal(mu, trend_factor_sigma)` or Student's t, `r(t)` the centred ramp.
//! * `offset ~ Normal(0, sigma_offset)` when estimated.
//! * `sigma ~ HalfNormal(sigma)`: scalar, per location, or per cluster of locations.
//!
//! Positive parameters live on the log scale; the log-Jacobian is part of the density.

use std::f64::consts::PI;
use std::ops::Range;

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use ndarray::{s, Array1, Array2, ArrayView1};
use rand::rngs::SmallRng;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::config::{ModelSettings, NoiseModel, TrendDistribution};
use crate::data::Observations;
use crate::error::{BpcaError, Result};
use crate::sampler::GradientTarget;

/// Centred linear time ramp `linspace(-T/2 + shift, T - 1 - T/2 + shift, T)`.
pub fn trend_ramp(n_time: usize, shift: f64) -> Array1<f64> {
    let half = n_time as f64 / 2.0;
    Array1::from_iter((0..n_time).map(|t| t as f64 - half + shift))
}

/// Position of every latent block inside the flat parameter vector.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterLayout {
    pub n_time: usize,
    pub n_space: usize,
    pub n_components: usize,
    /// `K × T`, component-major.
    pub pcs: Range<usize>,
    /// `K × S`, component-major.
    pub eofs: Range<usize>,
    pub log_sigma_eof: Option<Range<usize>>,
    pub trend: Option<Range<usize>>,
    pub offset: Option<Range<usize>>,
    /// One entry, one per location, or one per cluster.
    pub log_sigma: Range<usize>,
    pub dim: usize,
}

impl ParameterLayout {
    fn new(n_time: usize, n_space: usize, settings: &ModelSettings) -> Self {
        let k = settings.number_of_pcs;
        let mut next = 0;
        let mut take = |len: usize| {
            let range = next..next + len;
            next += len;
            range
        };
        let pcs = take(k * n_time);
        let eofs = take(k * n_space);
        let log_sigma_eof = settings.estimate_sigma_eof.then(|| take(k));
        let trend = settings.model_trend.then(|| take(n_space));
        let offset = settings.estimate_offsets.then(|| take(n_space));
        let log_sigma = match settings.noise_model() {
            NoiseModel::Scalar => take(1),
            NoiseModel::PerLocation => take(n_space),
            NoiseModel::Clustered { n_clusters } => take(n_clusters),
        };
        Self {
            n_time,
            n_space,
            n_components: k,
            pcs,
            eofs,
            log_sigma_eof,
            trend,
            offset,
            log_sigma,
            dim: next,
        }
    }
}

/// Constrained parameter values of one chain at one draw.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameters {
    /// `K × T`
    pub pcs: Array2<f64>,
    /// `K × S`
    pub eofs: Array2<f64>,
    pub sigma_eof: Option<Array1<f64>>,
    pub trend: Option<Array1<f64>>,
    pub offset: Option<Array1<f64>>,
    /// Length one for a scalar noise model, otherwise one per location.
    pub sigma: Array1<f64>,
    pub sigma_cluster: Option<Array1<f64>>,
}

/// Model built from an observation field and [`ModelSettings`].
#[derive(Debug, Clone)]
pub struct BpcaModel {
    settings: ModelSettings,
    layout: ParameterLayout,
    noise: NoiseModel,
    /// Observations with missing cells set to zero.
    observed: Array2<f64>,
    /// One where a cell is observed, zero otherwise.
    mask: Array2<f64>,
    ramp: Array1<f64>,
    trend_prior_mean: Array1<f64>,
}

impl BpcaModel {
    pub fn new(observations: &Observations, settings: &ModelSettings) -> Result<Self> {
        let (n_time, n_space) = observations.values.dim();
        settings.validate(n_space)?;
        if n_time < 2 {
            return Err(BpcaError::InvalidSetting {
                name: "observations",
                reason: "at least two time steps are required".to_string(),
            });
        }
        let mask = observations.values.mapv(|v| if v.is_nan() { 0.0 } else { 1.0 });
        let observed = observations.values.mapv(|v| if v.is_nan() { 0.0 } else { v });
        let trend_prior_mean = match (&settings.trend_pattern, settings.initialize_trend_pattern) {
            (Some(pattern), true) => Array1::from(pattern.clone()),
            _ => Array1::zeros(n_space),
        };
        Ok(Self {
            layout: ParameterLayout::new(n_time, n_space, settings),
            noise: settings.noise_model(),
            settings: settings.clone(),
            observed,
            mask,
            ramp: trend_ramp(n_time, settings.trend_shift),
            trend_prior_mean,
        })
    }

    pub fn layout(&self) -> &ParameterLayout {
        &self.layout
    }

    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    /// Maps an unconstrained position onto the model parameters.
    pub fn unpack(&self, position: ArrayView1<'_, f64>) -> Result<Parameters> {
        let layout = &self.layout;
        if position.len() != layout.dim {
            return Err(BpcaError::ShapeMismatch {
                what: "parameter vector",
                expected: layout.dim,
                found: position.len(),
            });
        }
        let block = |range: &Range<usize>| position.slice(s![range.clone()]).to_owned();
        let k = layout.n_components;
        let pcs = block(&layout.pcs).into_shape_with_order((k, layout.n_time))?;
        let eofs = block(&layout.eofs).into_shape_with_order((k, layout.n_space))?;
        let log_sigma = block(&layout.log_sigma).mapv(f64::exp);
        let (sigma, sigma_cluster) = match self.noise {
            NoiseModel::Clustered { .. } => {
                let index = self.settings.cluster_index.as_deref().unwrap_or_default();
                let expanded = Array1::from_iter(index.iter().map(|&c| log_sigma[c]));
                (expanded, Some(log_sigma))
            }
            _ => (log_sigma, None),
        };
        Ok(Parameters {
            pcs,
            eofs,
            sigma_eof: layout.log_sigma_eof.as_ref().map(|r| block(r).mapv(f64::exp)),
            trend: layout.trend.as_ref().map(block),
            offset: layout.offset.as_ref().map(block),
            sigma,
            sigma_cluster,
        })
    }

    /// Jittered starting points, one row per chain.
    pub fn initial_positions(&self, n_chains: usize, rng: &mut SmallRng) -> Array2<f64> {
        let layout = &self.layout;
        let mut positions = Array2::<f64>::zeros((n_chains, layout.dim));
        for mut row in positions.rows_mut() {
            for i in layout.pcs.clone().chain(layout.eofs.clone()) {
                row[i] = 0.1 * rng.sample::<f64, _>(StandardNormal);
            }
            if let Some(range) = &layout.log_sigma_eof {
                for i in range.clone() {
                    row[i] = self.settings.sigma_eofs.ln() + 0.1 * rng.sample::<f64, _>(StandardNormal);
                }
            }
            if let Some(range) = &layout.trend {
                for (x, i) in range.clone().enumerate() {
                    row[i] = self.trend_prior_mean[x]
                        + 0.1 * self.settings.trend_factor_sigma * rng.sample::<f64, _>(StandardNormal);
                }
            }
            for i in layout.log_sigma.clone() {
                row[i] = self.settings.sigma.ln() + 0.1 * rng.sample::<f64, _>(StandardNormal);
            }
        }
        positions
    }

    /// Expected field `Σ_k PC_k ⊗ W_k + r ⊗ trend + offset` (time × space).
    pub fn mean_field(&self, params: &Parameters) -> Array2<f64> {
        let mut field = params.pcs.t().dot(&params.eofs);
        if let Some(trend) = &params.trend {
            let ramp = self.ramp.view().insert_axis(ndarray::Axis(1));
            field = field + &ramp * &trend.view().insert_axis(ndarray::Axis(0));
        }
        if let Some(offset) = &params.offset {
            field = field + &offset.view().insert_axis(ndarray::Axis(0));
        }
        field
    }

    /// Log-likelihood of the observed cells of every location, summed over time.
    pub fn pointwise_log_likelihood(&self, params: &Parameters) -> Array1<f64> {
        let field = self.mean_field(params);
        let half_log_two_pi = 0.5 * (2.0 * PI).ln();
        let mut out = Array1::<f64>::zeros(self.layout.n_space);
        for ((t, x), &observed) in self.mask.indexed_iter() {
            if observed == 0.0 {
                continue;
            }
            let sigma = if params.sigma.len() == 1 {
                params.sigma[0]
            } else {
                params.sigma[x]
            };
            let z = (self.observed[[t, x]] - field[[t, x]]) / sigma;
            out[x] += -half_log_two_pi - sigma.ln() - 0.5 * z * z;
        }
        out
    }

    fn constant<B: Backend, const D: usize>(
        values: impl IntoIterator<Item = f64>,
        shape: [usize; D],
        device: &B::Device,
    ) -> Tensor<B, D> {
        let values: Vec<f64> = values.into_iter().collect();
        let data = TensorData::new(values, shape).convert::<B::FloatElem>();
        Tensor::<B, D>::from_data(data, device)
    }
}

/// `Σ (-½ (e^θ / scale)² + θ)` per chain: half-normal prior on `e^θ` plus log-Jacobian.
fn half_normal_on_log<B: Backend>(theta: Tensor<B, 2>, scale: f64) -> Tensor<B, 1> {
    let n_chains = theta.dims()[0];
    let density = theta
        .clone()
        .exp()
        .div_scalar(scale)
        .powf_scalar(2.0)
        .mul_scalar(-0.5);
    (density + theta).sum_dim(1).reshape([n_chains])
}

impl<B: AutodiffBackend> GradientTarget<B> for BpcaModel {
    fn log_prob_batch(&self, positions: &Tensor<B, 2>) -> Tensor<B, 1> {
        let layout = &self.layout;
        let settings = &self.settings;
        let [c, _] = positions.dims();
        let (t, s, k) = (layout.n_time, layout.n_space, layout.n_components);
        let device = positions.device();
        let block = |range: &Range<usize>| positions.clone().slice([0..c, range.clone()]);

        let mut logp = Tensor::<B, 1>::zeros([c], &device);

        let eof_scale = match &layout.log_sigma_eof {
            Some(range) => {
                let theta = block(range);
                logp = logp + half_normal_on_log(theta.clone(), settings.sigma_eofs);
                theta.exp()
            }
            None => Tensor::<B, 2>::ones([c, k], &device).mul_scalar(settings.sigma_eofs),
        };

        let pcs = block(&layout.pcs).reshape([c, k, t]);
        let eofs = block(&layout.eofs).reshape([c, k, s]);

        // Random-walk innovations; the first value is flat.
        let walk_scale = Self::constant::<B, 3>(
            (0..k).map(|i| settings.random_walk_scale(i)),
            [1, k, 1],
            &device,
        )
        .expand([c, k, t - 1]);
        let innovations = pcs.clone().slice([0..c, 0..k, 1..t]) - pcs.clone().slice([0..c, 0..k, 0..t - 1]);
        logp = logp
            + innovations
                .div(walk_scale)
                .powf_scalar(2.0)
                .mul_scalar(-0.5)
                .sum_dim(2)
                .sum_dim(1)
                .reshape([c]);

        let z_eofs = eofs.clone().div(eof_scale.clone().reshape([c, k, 1]).expand([c, k, s]));
        logp = logp
            + z_eofs
                .powf_scalar(2.0)
                .mul_scalar(-0.5)
                .sum_dim(2)
                .sum_dim(1)
                .reshape([c])
            - eof_scale.log().sum_dim(1).reshape([c]).mul_scalar(s as f64);

        let mut mu = pcs.swap_dims(1, 2).matmul(eofs);

        if let Some(range) = &layout.trend {
            let trend = block(range);
            let prior_mean =
                Self::constant::<B, 2>(self.trend_prior_mean.iter().copied(), [1, s], &device)
                    .expand([c, s]);
            let z2 = (trend.clone() - prior_mean)
                .div_scalar(settings.trend_factor_sigma)
                .powf_scalar(2.0);
            let prior = match settings.trend_distr {
                TrendDistribution::Normal => z2.mul_scalar(-0.5),
                TrendDistribution::StudentT => {
                    let nu = settings.trend_factor_nu;
                    z2.div_scalar(nu)
                        .add_scalar(1.0)
                        .log()
                        .mul_scalar(-(nu + 1.0) / 2.0)
                }
            };
            logp = logp + prior.sum_dim(1).reshape([c]);
            let ramp = Self::constant::<B, 3>(self.ramp.iter().copied(), [1, t, 1], &device)
                .expand([c, t, s]);
            mu = mu + ramp * trend.reshape([c, 1, s]).expand([c, t, s]);
        }

        if let Some(range) = &layout.offset {
            let offset = block(range);
            logp = logp
                + offset
                    .clone()
                    .div_scalar(settings.sigma_offset)
                    .powf_scalar(2.0)
                    .mul_scalar(-0.5)
                    .sum_dim(1)
                    .reshape([c]);
            mu = mu + offset.reshape([c, 1, s]).expand([c, t, s]);
        }

        let theta = block(&layout.log_sigma);
        logp = logp + half_normal_on_log(theta.clone(), settings.sigma);
        let sigma = match self.noise {
            NoiseModel::Scalar => theta.exp().reshape([c, 1, 1]).expand([c, t, s]),
            NoiseModel::PerLocation => theta.exp().reshape([c, 1, s]).expand([c, t, s]),
            NoiseModel::Clustered { n_clusters } => {
                let index = self.settings.cluster_index.as_deref().unwrap_or_default();
                let one_hot = Self::constant::<B, 2>(
                    (0..n_clusters).flat_map(|m| index.iter().map(move |&i| if i == m { 1.0 } else { 0.0 })),
                    [n_clusters, s],
                    &device,
                );
                theta.exp().matmul(one_hot).reshape([c, 1, s]).expand([c, t, s])
            }
        };

        let observed =
            Self::constant::<B, 3>(self.observed.iter().copied(), [1, t, s], &device).expand([c, t, s]);
        let mask =
            Self::constant::<B, 3>(self.mask.iter().copied(), [1, t, s], &device).expand([c, t, s]);
        let z = (observed - mu).div(sigma.clone());
        let log_lik = (z.powf_scalar(2.0).mul_scalar(-0.5) - sigma.log()).mul(mask);
        logp + log_lik.sum_dim(2).sum_dim(1).reshape([c])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use burn::backend::{Autodiff, NdArray};
    use ndarray::{array, Array2};
    use rand::SeedableRng;

    type BackendType = Autodiff<NdArray<f64>>;

    fn observations() -> Observations {
        let values = Array2::from_shape_fn((6, 3), |(t, x)| (t as f64 - 2.5) * (x as f64 + 1.0));
        Observations::from_matrix("synthetic", values)
    }

    #[test]
    fn ramp_is_centred_with_shift() {
        assert_eq!(trend_ramp(4, 0.0), array![-2.0, -1.0, 0.0, 1.0]);
        assert_eq!(trend_ramp(4, -6.0), array![-8.0, -7.0, -6.0, -5.0]);
    }

    #[test]
    fn layout_follows_settings() {
        let settings = ModelSettings {
            number_of_pcs: 2,
            estimate_offsets: true,
            estimate_point_variance: true,
            ..ModelSettings::default()
        };
        let model = BpcaModel::new(&observations(), &settings).unwrap();
        let layout = model.layout();
        assert_eq!(layout.pcs, 0..12);
        assert_eq!(layout.eofs, 12..18);
        assert_eq!(layout.log_sigma_eof, Some(18..20));
        assert_eq!(layout.trend, Some(20..23));
        assert_eq!(layout.offset, Some(23..26));
        assert_eq!(layout.log_sigma, 26..29);
        assert_eq!(layout.dim, 29);
    }

    #[test]
    fn clustered_sigma_expands_to_locations() {
        let settings = ModelSettings {
            number_of_pcs: 1,
            model_trend: false,
            estimate_sigma_eof: false,
            estimate_point_variance: true,
            estimate_cluster_sigma: true,
            cluster_index: Some(vec![1, 0, 1]),
            ..ModelSettings::default()
        };
        let model = BpcaModel::new(&observations(), &settings).unwrap();
        let mut position = Array1::<f64>::zeros(model.layout().dim);
        let sigma = model.layout().log_sigma.clone();
        position[sigma.start] = 0.5_f64.ln();
        position[sigma.start + 1] = 2.0_f64.ln();
        let params = model.unpack(position.view()).unwrap();
        assert_abs_diff_eq!(params.sigma, array![2.0, 0.5, 2.0], epsilon = 1e-12);
        assert_abs_diff_eq!(params.sigma_cluster.unwrap(), array![0.5, 2.0], epsilon = 1e-12);
    }

    #[test]
    fn mean_field_is_outer_product_plus_trend_and_offset() {
        let settings = ModelSettings {
            number_of_pcs: 1,
            estimate_offsets: true,
            trend_shift: 0.0,
            ..ModelSettings::default()
        };
        let obs = Observations::from_matrix("f", Array2::zeros((4, 2)));
        let model = BpcaModel::new(&obs, &settings).unwrap();
        let params = Parameters {
            pcs: array![[1.0, 2.0, 3.0, 4.0]],
            eofs: array![[1.0, -1.0]],
            sigma_eof: None,
            trend: Some(array![0.5, 0.0]),
            offset: Some(array![10.0, 20.0]),
            sigma: array![1.0],
            sigma_cluster: None,
        };
        let field = model.mean_field(&params);
        // ramp = [-2, -1, 0, 1]
        let expected = array![[10.0, 19.0], [11.5, 18.0], [13.0, 17.0], [14.5, 16.0]];
        assert_abs_diff_eq!(field, expected, epsilon = 1e-12);
    }

    #[test]
    fn missing_cells_do_not_contribute() {
        let mut obs = observations();
        let settings = ModelSettings {
            number_of_pcs: 1,
            model_trend: false,
            ..ModelSettings::default()
        };
        let full = BpcaModel::new(&obs, &settings).unwrap();
        obs.values[[0, 1]] = f64::NAN;
        let gappy = BpcaModel::new(&obs, &settings).unwrap();
        let position = Array1::<f64>::zeros(full.layout().dim);
        let a = full.pointwise_log_likelihood(&full.unpack(position.view()).unwrap());
        let b = gappy.pointwise_log_likelihood(&gappy.unpack(position.view()).unwrap());
        assert_abs_diff_eq!(a[0], b[0], epsilon = 1e-12);
        assert!(b[1] > a[1]);
    }

    #[test]
    fn tensor_density_gradient_matches_finite_difference() {
        let settings = ModelSettings {
            number_of_pcs: 2,
            estimate_offsets: true,
            trend_distr: TrendDistribution::StudentT,
            ..ModelSettings::default()
        };
        let model = BpcaModel::new(&observations(), &settings).unwrap();
        let mut rng = SmallRng::seed_from_u64(7);
        let start = model.initial_positions(2, &mut rng);
        let dim = model.layout().dim;

        let eval = |positions: &Array2<f64>| -> Vec<f64> {
            let data = TensorData::new(positions.iter().copied().collect::<Vec<f64>>(), [2, dim]);
            let tensor = Tensor::<BackendType, 2>::from_data(data, &Default::default());
            let logp = <BpcaModel as GradientTarget<BackendType>>::log_prob_batch(&model, &tensor);
            logp.into_data().convert::<f64>().to_vec::<f64>().unwrap()
        };

        let data = TensorData::new(start.iter().copied().collect::<Vec<f64>>(), [2, dim]);
        let tensor = Tensor::<BackendType, 2>::from_data(data, &Default::default()).require_grad();
        let logp = <BpcaModel as GradientTarget<BackendType>>::log_prob_batch(&model, &tensor);
        let grads = logp.sum().backward();
        let grad = tensor
            .grad(&grads)
            .unwrap()
            .into_data()
            .convert::<f64>()
            .to_vec::<f64>()
            .unwrap();

        let h = 1e-6;
        for i in [0, 5, dim / 2, dim - 1] {
            let mut plus = start.clone();
            let mut minus = start.clone();
            plus[[1, i]] += h;
            minus[[1, i]] -= h;
            let numeric = (eval(&plus)[1] - eval(&minus)[1]) / (2.0 * h);
            let analytic = grad[dim + i];
            assert!(
                (numeric - analytic).abs() < 1e-3 * (1.0 + analytic.abs()),
                "parameter {i}: numeric {numeric}, autodiff {analytic}"
            );
        }
    }

    #[test]
    fn tensor_likelihood_agrees_with_pointwise_sum() {
        // Without priors on anything but sigma, the two densities differ by constants only.
        let settings = ModelSettings {
            number_of_pcs: 1,
            model_trend: false,
            estimate_sigma_eof: false,
            ..ModelSettings::default()
        };
        let model = BpcaModel::new(&observations(), &settings).unwrap();
        let dim = model.layout().dim;
        let logp_at = |scale: f64| -> (f64, f64) {
            let mut position = Array1::<f64>::zeros(dim);
            position[model.layout().log_sigma.start] = scale.ln();
            let params = model.unpack(position.view()).unwrap();
            let pointwise = model.pointwise_log_likelihood(&params).sum();
            let data = TensorData::new(position.to_vec(), [1, dim]);
            let tensor = Tensor::<BackendType, 2>::from_data(data, &Default::default());
            let logp = <BpcaModel as GradientTarget<BackendType>>::log_prob_batch(&model, &tensor)
                .into_data()
                .convert::<f64>()
                .to_vec::<f64>()
                .unwrap()[0];
            (pointwise, logp)
        };
        let (p1, l1) = logp_at(1.0);
        let (p2, l2) = logp_at(2.0);
        let prior = |scale: f64| -0.5 * (scale / settings.sigma).powi(2) + scale.ln();
        assert_abs_diff_eq!(
            (l2 - prior(2.0)) - (l1 - prior(1.0)),
            p2 - p1,
            epsilon = 1e-8
        );
    }
}
