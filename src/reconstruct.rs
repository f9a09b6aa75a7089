//! Field reconstruction from the posterior summaries of one chain.
//!
//! The estimate is `Σ_k PC_k ⊗ W_k`, plus `r ⊗ trend` when a trend is modelled and
//! `1 ⊗ offset` on request. Standard deviations are propagated per component as
//! `sqrt((σ_PC · W)² + (PC · σ_W)²)`, summed over components by absolute value,
//! the trend contributes `|r| ⊗ σ_trend` linearly and the offset is added in
//! quadrature last.

use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use crate::config::ModelSettings;
use crate::data::Observations;
use crate::error::{BpcaError, Result};
use crate::model::trend_ramp;
use crate::trace::{Group, Reduction, Trace, Variable};

/// Spatial patterns interpolated onto a target grid, with uncertainties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapPattern {
    /// Labels of the grid points.
    pub space: Vec<String>,
    /// `[component, grid]`
    pub eof_mean: Array2<f64>,
    pub eof_std: Array2<f64>,
    pub trend_mean: Option<Array1<f64>>,
    pub trend_std: Option<Array1<f64>>,
    pub offset_mean: Option<Array1<f64>>,
    pub offset_std: Option<Array1<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReconstructionKind {
    /// Posterior mean over all draws.
    Mean,
    /// One random draw window of a compressed trace.
    Random { draw: usize },
    /// Average over the random draw windows.
    RandomMean,
    /// PCs of the trace combined with externally interpolated patterns.
    Maps(MapPattern),
}

/// Additional split of a map reconstruction into its trend and PC parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapComponents {
    pub trend_series: Option<Array2<f64>>,
    pub trend_series_std: Option<Array2<f64>>,
    pub trend_map: Option<Array1<f64>>,
    pub trend_map_std: Option<Array1<f64>>,
    pub pcs: Array2<f64>,
    pub pcs_std: Array2<f64>,
    pub offset_map: Option<Array1<f64>>,
    pub offset_map_std: Option<Array1<f64>>,
}

/// A reconstructed time × space field with its standard deviation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reconstruction {
    pub name: String,
    pub time: Array1<f64>,
    pub space: Vec<String>,
    pub estimate: Array2<f64>,
    pub std: Array2<f64>,
    /// Chain the factors were taken from.
    pub chain: usize,
    pub components: Option<MapComponents>,
}

/// Mean and standard deviation of every factor of one chain.
struct Factors {
    pc_mean: Vec<Array1<f64>>,
    pc_std: Vec<Array1<f64>>,
    eof_mean: Vec<Array1<f64>>,
    eof_std: Vec<Array1<f64>>,
    trend: Option<(Array1<f64>, Array1<f64>)>,
    offset: Option<(Array1<f64>, Array1<f64>)>,
}

impl Factors {
    fn from_groups(mean: &Group<Variable>, std: &Group<Variable>, chain: usize, draw: usize) -> Result<Self> {
        let n_components = mean.n_components();
        let per_component = |group: &Group<Variable>, var: Variable| -> Result<Vec<Array1<f64>>> {
            (0..n_components)
                .map(|k| group.component(var, chain, draw, k))
                .collect()
        };
        let optional = |var: Variable| -> Result<Option<(Array1<f64>, Array1<f64>)>> {
            if !mean.contains(var) {
                return Ok(None);
            }
            Ok(Some((mean.vector(var, chain, draw)?, std.vector(var, chain, draw)?)))
        };
        Ok(Self {
            pc_mean: per_component(mean, Variable::Pc)?,
            pc_std: per_component(std, Variable::Pc)?,
            eof_mean: per_component(mean, Variable::Eof)?,
            eof_std: per_component(std, Variable::Eof)?,
            trend: optional(Variable::Trend)?,
            offset: optional(Variable::Offset)?,
        })
    }

    /// Factors of the posterior mean and standard deviation over all draws.
    fn mean(trace: &Trace, chain: usize) -> Result<Self> {
        match trace {
            Trace::Full(data) => {
                let mean = data.posterior.reduce_all(Reduction::Mean)?;
                let std = data.posterior.reduce_all(Reduction::Std)?;
                Self::from_groups(&mean, &std, chain, 0)
            }
            Trace::Compressed(compressed) => Self::from_groups(
                &compressed.mean.posterior,
                &compressed.std.posterior,
                chain,
                0,
            ),
        }
    }

    /// Every factor must span `n_time` or `n_space`.
    fn check(&self, n_time: usize, n_space: usize) -> Result<()> {
        let series = self.pc_mean.iter().chain(&self.pc_std).map(|v| ("PC", v, n_time));
        let patterns = self
            .eof_mean
            .iter()
            .chain(&self.eof_std)
            .map(|v| ("W", v, n_space));
        let trend = self.trend.iter().flat_map(|(m, s)| [("trend", m, n_space), ("trend", s, n_space)]);
        let offset = self
            .offset
            .iter()
            .flat_map(|(m, s)| [("offset", m, n_space), ("offset", s, n_space)]);
        for (what, values, expected) in series.chain(patterns).chain(trend).chain(offset) {
            if values.len() != expected {
                return Err(BpcaError::ShapeMismatch {
                    what,
                    expected,
                    found: values.len(),
                });
            }
        }
        Ok(())
    }
}

/// `a ⊗ b`
pub fn outer(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> Array2<f64> {
    a.insert_axis(Axis(1)).dot(&b.insert_axis(Axis(0)))
}

/// Reconstruction of one chain of `trace` on the axes of `observations`.
pub fn reconstruct(
    trace: &Trace,
    settings: &ModelSettings,
    observations: &Observations,
    kind: &ReconstructionKind,
    chain: usize,
    with_offset: bool,
) -> Result<Reconstruction> {
    let n_chains = trace.n_chains();
    if chain >= n_chains {
        return Err(BpcaError::IndexOutOfRange {
            what: "chain",
            index: chain,
            len: n_chains,
        });
    }
    let random = || match trace {
        Trace::Compressed(compressed) => Ok(&compressed.random),
        Trace::Full(_) => Err(BpcaError::RandomSamplesUnavailable),
    };
    let space = &observations.space;
    let (factors, space, components) = match kind {
        ReconstructionKind::Mean => (Factors::mean(trace, chain)?, space.clone(), false),
        ReconstructionKind::Random { draw } => {
            let windows = random()?;
            (
                Factors::from_groups(&windows.mean, &windows.std, chain, *draw)?,
                space.clone(),
                false,
            )
        }
        ReconstructionKind::RandomMean => {
            let windows = random()?;
            let mean = windows.mean.reduce_all(Reduction::Mean)?;
            let std = windows.std.reduce_all(Reduction::Mean)?;
            (Factors::from_groups(&mean, &std, chain, 0)?, space.clone(), false)
        }
        ReconstructionKind::Maps(pattern) => {
            let mut factors = Factors::mean(trace, chain)?;
            let n_components = factors.pc_mean.len();
            if pattern.eof_mean.nrows() != n_components || pattern.eof_std.dim() != pattern.eof_mean.dim() {
                return Err(BpcaError::ShapeMismatch {
                    what: "map pattern components",
                    expected: n_components,
                    found: pattern.eof_mean.nrows(),
                });
            }
            if pattern.space.len() != pattern.eof_mean.ncols() {
                return Err(BpcaError::ShapeMismatch {
                    what: "map pattern grid",
                    expected: pattern.eof_mean.ncols(),
                    found: pattern.space.len(),
                });
            }
            factors.eof_mean = pattern.eof_mean.outer_iter().map(|row| row.to_owned()).collect();
            factors.eof_std = pattern.eof_std.outer_iter().map(|row| row.to_owned()).collect();
            factors.trend = pattern.trend_mean.clone().zip(pattern.trend_std.clone());
            factors.offset = pattern.offset_mean.clone().zip(pattern.offset_std.clone());
            (factors, pattern.space.clone(), true)
        }
    };

    let time = &observations.time;
    let n_time = time.len();
    let n_space = space.len();
    factors.check(n_time, n_space)?;

    let mut estimate = Array2::<f64>::zeros((n_time, n_space));
    let mut std = Array2::<f64>::zeros((n_time, n_space));
    for k in 0..factors.pc_mean.len() {
        let (pc, pc_std) = (&factors.pc_mean[k], &factors.pc_std[k]);
        let (w, w_std) = (&factors.eof_mean[k], &factors.eof_std[k]);
        estimate += &outer(pc.view(), w.view());
        let a = outer(pc_std.view(), w.view());
        let b = outer(pc.view(), w_std.view());
        std += &(&a * &a + &b * &b).mapv(f64::sqrt);
    }
    let pcs = estimate.clone();
    let pcs_std = std.clone();

    let mut trend_parts = None;
    if settings.model_trend {
        let (trend, trend_std) = factors
            .trend
            .as_ref()
            .ok_or_else(|| BpcaError::MissingVariable(Variable::Trend.to_string()))?;
        let ramp = trend_ramp(n_time, settings.trend_shift);
        let field = outer(ramp.view(), trend.view());
        let field_std = outer(ramp.mapv(f64::abs).view(), trend_std.view());
        estimate += &field;
        std += &field_std;
        trend_parts = Some((field, field_std, trend.clone(), trend_std.clone()));
    }

    let mut offset_parts = None;
    if with_offset {
        if let Some((offset, offset_std)) = &factors.offset {
            estimate += &offset.view().insert_axis(Axis(0));
            let variance = offset_std.mapv(|s| s * s).insert_axis(Axis(0));
            std = (std.mapv(|s| s * s) + &variance).mapv(f64::sqrt);
            offset_parts = Some((offset.clone(), offset_std.clone()));
        }
    }

    let components = components.then(|| {
        let (trend_series, trend_series_std, trend_map, trend_map_std) = match trend_parts {
            Some((a, b, c, d)) => (Some(a), Some(b), Some(c), Some(d)),
            None => (None, None, None, None),
        };
        let (offset_map, offset_map_std) = offset_parts.unzip();
        MapComponents {
            trend_series,
            trend_series_std,
            trend_map,
            trend_map_std,
            pcs,
            pcs_std,
            offset_map,
            offset_map_std,
        }
    });

    Ok(Reconstruction {
        name: observations.name.clone(),
        time: time.clone(),
        space,
        estimate,
        std,
        chain,
        components,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{CompressedTrace, InferenceData, RandomWindows};
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array, IxDyn};

    fn group(pc: f64, w: f64, trend: f64, offset: f64) -> Group<Variable> {
        let mut g = Group::new();
        g.insert(Variable::Pc, Array::from_elem(IxDyn(&[1, 1, 1, 4]), pc));
        g.insert(Variable::Eof, Array::from_elem(IxDyn(&[1, 1, 1, 2]), w));
        g.insert(Variable::Trend, Array::from_elem(IxDyn(&[1, 1, 2]), trend));
        g.insert(Variable::Offset, Array::from_elem(IxDyn(&[1, 1, 2]), offset));
        g
    }

    fn compressed(mean: Group<Variable>, std: Group<Variable>) -> Trace {
        let random = RandomWindows {
            mean: mean.clone(),
            std: std.clone(),
            starts: vec![0],
            size: 1,
        };
        Trace::Compressed(CompressedTrace {
            mean: InferenceData {
                posterior: mean,
                ..InferenceData::default()
            },
            std: InferenceData {
                posterior: std,
                ..InferenceData::default()
            },
            random,
        })
    }

    fn observations() -> Observations {
        Observations::new(
            "h",
            array![0.0, 1.0, 2.0, 3.0],
            vec!["a".to_string(), "b".to_string()],
            Array2::zeros((4, 2)),
        )
        .unwrap()
    }

    fn map_pattern() -> MapPattern {
        MapPattern {
            space: vec!["g0".into(), "g1".into(), "g2".into()],
            eof_mean: array![[1.0, 2.0, 3.0]],
            eof_std: array![[0.0, 0.0, 0.0]],
            trend_mean: Some(array![1.0, 0.0, -1.0]),
            trend_std: Some(array![0.1, 0.1, 0.1]),
            offset_mean: None,
            offset_std: None,
        }
    }

    fn settings() -> ModelSettings {
        ModelSettings {
            number_of_pcs: 1,
            trend_shift: 0.0,
            ..ModelSettings::default()
        }
    }

    #[test]
    fn outer_product_is_exact() {
        let a = Array1::from_iter((0..10).map(|i| i as f64 * 0.5));
        let b = Array1::from_iter((0..5).map(|j| j as f64 - 2.0));
        let product = outer(a.view(), b.view());
        assert_eq!(product.dim(), (10, 5));
        for i in 0..10 {
            for j in 0..5 {
                assert_eq!(product[[i, j]], a[i] * b[j]);
            }
        }
    }

    #[test]
    fn zero_components_leave_trend_and_offset() {
        let trace = compressed(group(0.0, 0.0, 0.5, 3.0), group(0.0, 0.0, 0.1, 0.4));
        let obs = observations();
        let rec = reconstruct(&trace, &settings(), &obs, &ReconstructionKind::Mean, 0, true)
            .unwrap();
        // ramp = [-2, -1, 0, 1]
        let expected = array![[2.0, 2.0], [2.5, 2.5], [3.0, 3.0], [3.5, 3.5]];
        assert_abs_diff_eq!(rec.estimate, expected, epsilon = 1e-12);
        let expected_std = array![[0.2, 0.2], [0.1, 0.1], [0.0, 0.0], [0.1, 0.1]]
            .mapv(|s: f64| (s * s + 0.16).sqrt());
        assert_abs_diff_eq!(rec.std, expected_std, epsilon = 1e-12);
    }

    #[test]
    fn component_error_is_finite_at_zero_factor() {
        let trace = compressed(group(2.0, 0.0, 0.0, 0.0), group(0.5, 0.3, 0.0, 0.0));
        let obs = observations();
        let mut s = settings();
        s.model_trend = false;
        let rec = reconstruct(&trace, &s, &obs, &ReconstructionKind::Mean, 0, false).unwrap();
        assert!(rec.estimate.iter().all(|&v| v == 0.0));
        // sqrt((0.5 * 0)^2 + (2 * 0.3)^2)
        assert!(rec.std.iter().all(|&v| (v - 0.6).abs() < 1e-12));
    }

    #[test]
    fn random_kinds_need_a_compressed_trace() {
        let trace = Trace::Full(InferenceData {
            posterior: group(1.0, 1.0, 0.0, 0.0),
            ..InferenceData::default()
        });
        let obs = observations();
        let err = reconstruct(
            &trace,
            &settings(),
            &obs,
            &ReconstructionKind::RandomMean,
            0,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, BpcaError::RandomSamplesUnavailable));
        let mean = reconstruct(&trace, &settings(), &obs, &ReconstructionKind::Mean, 0, false);
        assert!(mean.is_ok());
    }

    #[test]
    fn maps_use_interpolated_patterns() {
        let trace = compressed(group(1.0, 5.0, 9.0, 0.0), group(0.0, 0.0, 0.0, 0.0));
        let obs = observations();
        let pattern = map_pattern();
        let rec = reconstruct(
            &trace,
            &settings(),
            &obs,
            &ReconstructionKind::Maps(pattern),
            0,
            true,
        )
        .unwrap();
        assert_eq!(rec.estimate.dim(), (4, 3));
        let parts = rec.components.unwrap();
        assert_abs_diff_eq!(parts.pcs.row(0), array![1.0, 2.0, 3.0], epsilon = 1e-12);
        let trend_series = parts.trend_series.unwrap();
        assert_abs_diff_eq!(trend_series.column(0), array![-2.0, -1.0, 0.0, 1.0], epsilon = 1e-12);
        assert_abs_diff_eq!(&parts.pcs + &trend_series, rec.estimate, epsilon = 1e-12);
        assert!(parts.offset_map.is_none());
    }

    #[test]
    fn mean_of_a_single_component_is_its_outer_product() {
        let pc = Array1::from_iter((0..10).map(|t| (t as f64 * 0.7).sin()));
        let w = array![0.5, -1.0, 2.0, 0.0, 1.5];
        let mut posterior = Group::new();
        posterior.insert(
            Variable::Pc,
            Array::from_shape_fn(IxDyn(&[1, 3, 1, 10]), |ix| pc[ix[3]]),
        );
        posterior.insert(
            Variable::Eof,
            Array::from_shape_fn(IxDyn(&[1, 3, 1, 5]), |ix| w[ix[3]]),
        );
        let trace = Trace::Full(InferenceData {
            posterior,
            ..InferenceData::default()
        });
        let obs = Observations::from_matrix("field", outer(pc.view(), w.view()));
        let mut s = settings();
        s.model_trend = false;
        let rec = reconstruct(&trace, &s, &obs, &ReconstructionKind::Mean, 0, false).unwrap();
        assert_eq!(rec.name, "field");
        assert_eq!(rec.estimate.dim(), (10, 5));
        assert_abs_diff_eq!(rec.estimate, obs.values, epsilon = 1e-12);
        assert!(rec.std.iter().all(|&v| v.abs() < 1e-12));
    }

    #[test]
    fn map_trend_and_offset_must_match_the_grid() {
        let trace = compressed(group(1.0, 5.0, 9.0, 0.0), group(0.0, 0.0, 0.0, 0.0));
        let mut pattern = map_pattern();
        pattern.trend_mean = Some(array![1.0, 0.0]);
        let err = reconstruct(
            &trace,
            &settings(),
            &observations(),
            &ReconstructionKind::Maps(pattern),
            0,
            false,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            BpcaError::ShapeMismatch { what: "trend", expected: 3, found: 2 }
        ));

        let mut pattern = map_pattern();
        pattern.offset_mean = Some(array![1.0, 2.0, 3.0]);
        pattern.offset_std = Some(array![0.1]);
        let err = reconstruct(
            &trace,
            &settings(),
            &observations(),
            &ReconstructionKind::Maps(pattern),
            0,
            true,
        )
        .unwrap_err();
        assert!(matches!(err, BpcaError::ShapeMismatch { what: "offset", .. }));
    }

    #[test]
    fn factor_lengths_must_match_the_observation_axes() {
        let mut std = group(0.1, 0.1, 0.1, 0.1);
        std.insert(Variable::Pc, Array::from_elem(IxDyn(&[1, 1, 1, 3]), 0.1));
        let trace = compressed(group(1.0, 1.0, 0.0, 0.0), std);
        let err = reconstruct(&trace, &settings(), &observations(), &ReconstructionKind::Mean, 0, false)
            .unwrap_err();
        assert!(matches!(
            err,
            BpcaError::ShapeMismatch { what: "PC", expected: 4, found: 3 }
        ));
    }
}
