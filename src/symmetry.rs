//! Resolution of the sign and label ambiguity of PCA components across chains.
//!
//! Every chain may find the same components in a different order and with flipped
//! signs. Chain 0 is the reference: for each of its components, the best matching
//! component of every chain (largest absolute correlation of the draw-averaged PC
//! series) is moved into place and multiplied by the sign of that correlation.
//! The sign goes onto both the PC and the EOF so their product is unchanged.

use ndarray::{Array1, Array2, ArrayD, Axis};

use crate::error::{BpcaError, Result};
use crate::trace::{Group, Variable};

/// Where component `component` of `chain` is taken from after relabeling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComponentMatch {
    pub component: usize,
    pub chain: usize,
    pub source_component: usize,
    /// `±1`, or NaN when the correlation is undefined.
    pub sign: f64,
}

/// Pearson correlation over the time steps where both series are present.
fn pearson_complete(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
    let pairs: Vec<(f64, f64)> = a
        .iter()
        .zip(b)
        .filter(|(x, y)| !x.is_nan() && !y.is_nan())
        .map(|(&x, &y)| (x, y))
        .collect();
    if pairs.len() < 2 {
        return f64::NAN;
    }
    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (x, y) in &pairs {
        sxy += (x - mean_x) * (y - mean_y);
        sxx += (x - mean_x).powi(2);
        syy += (y - mean_y).powi(2);
    }
    sxy / (sxx * syy).sqrt()
}

/// Pairwise-complete correlation matrix of a set of series.
pub fn correlation_matrix(series: &[Array1<f64>]) -> Array2<f64> {
    let n = series.len();
    let mut corr = Array2::<f64>::from_elem((n, n), f64::NAN);
    for i in 0..n {
        for j in i..n {
            let c = pearson_complete(&series[i], &series[j]);
            corr[[i, j]] = c;
            corr[[j, i]] = c;
        }
    }
    corr
}

/// Draw-averaged PC series, ordered component-major: index `k * n_chains + chain`.
fn mean_pc_series(pcs: &ArrayD<f64>) -> Result<Vec<Array1<f64>>> {
    let (n_chains, n_components) = (pcs.shape()[0], pcs.shape()[2]);
    let mean = pcs
        .mean_axis(Axis(1))
        .ok_or(BpcaError::IndexOutOfRange {
            what: "draw",
            index: 0,
            len: 0,
        })?
        .into_dimensionality::<ndarray::Ix3>()?;
    let mut series = Vec::with_capacity(n_chains * n_components);
    for k in 0..n_components {
        for chain in 0..n_chains {
            series.push(mean.slice(ndarray::s![chain, k, ..]).to_owned());
        }
    }
    Ok(series)
}

/// Finds, for every (component, chain), the matching component of that chain.
pub fn resolve(posterior: &Group<Variable>) -> Result<Vec<ComponentMatch>> {
    let pcs = posterior.require(Variable::Pc)?;
    let (n_chains, n_components) = (pcs.shape()[0], pcs.shape()[2]);
    let corr = correlation_matrix(&mean_pc_series(pcs)?);

    let mut matches = Vec::with_capacity(n_chains * n_components);
    for component in 0..n_components {
        let reference = component * n_chains;
        for chain in 0..n_chains {
            let mut best: Option<(usize, f64)> = None;
            for candidate in 0..n_components {
                let c = corr[[reference, candidate * n_chains + chain]];
                if best.map_or(!c.is_nan(), |(_, b)| c.abs() > b.abs()) {
                    best = Some((candidate, c));
                }
            }
            let (source_component, c) = best.unwrap_or((component, f64::NAN));
            matches.push(ComponentMatch {
                component,
                chain,
                source_component,
                sign: if c.is_nan() { f64::NAN } else { c.signum() },
            });
        }
    }
    Ok(matches)
}

/// Rescales every (chain, component) pair so the draw-averaged EOF has unit
/// standard deviation over space; the PC takes the inverse scale.
pub fn normalize(posterior: &mut Group<Variable>) -> Result<()> {
    let eofs = posterior.require(Variable::Eof)?;
    let (n_chains, n_components) = (eofs.shape()[0], eofs.shape()[2]);
    let mean_eofs = eofs
        .mean_axis(Axis(1))
        .ok_or(BpcaError::IndexOutOfRange {
            what: "draw",
            index: 0,
            len: 0,
        })?
        .into_dimensionality::<ndarray::Ix3>()?;
    let scales = Array2::from_shape_fn((n_chains, n_components), |(chain, k)| {
        mean_eofs.slice(ndarray::s![chain, k, ..]).std(0.0)
    });

    for (var, scale) in [
        (Variable::Eof, Scale::Divide),
        (Variable::Pc, Scale::Multiply),
        (Variable::SigmaEof, Scale::Divide),
    ] {
        let Some(values) = posterior.get_mut(var) else {
            continue;
        };
        for chain in 0..n_chains {
            for k in 0..n_components {
                let s = scales[[chain, k]];
                let mut block = values
                    .index_axis_mut(Axis(0), chain)
                    .index_axis_move(Axis(1), k);
                match scale {
                    Scale::Divide => block.mapv_inplace(|v| v / s),
                    Scale::Multiply => block.mapv_inplace(|v| v * s),
                }
            }
        }
    }
    Ok(())
}

#[derive(Clone, Copy)]
enum Scale {
    Divide,
    Multiply,
}

/// Relabels PC, EOF and EOF scale of every chain from a snapshot of the input.
pub fn apply(posterior: &mut Group<Variable>, matches: &[ComponentMatch]) -> Result<()> {
    for var in [Variable::Pc, Variable::Eof, Variable::SigmaEof] {
        let signed = var != Variable::SigmaEof;
        let Some(values) = posterior.get_mut(var) else {
            continue;
        };
        let snapshot = values.clone();
        for m in matches {
            let source = snapshot
                .index_axis(Axis(0), m.chain)
                .index_axis_move(Axis(1), m.source_component);
            let mut target = values
                .index_axis_mut(Axis(0), m.chain)
                .index_axis_move(Axis(1), m.component);
            if signed {
                target.assign(&source.mapv(|v| m.sign * v));
            } else {
                target.assign(&source);
            }
            log::info!(
                "replaced variable {var}{} (chain {}) with variable {var}{} (chain {})",
                m.component,
                m.chain,
                m.source_component,
                m.chain
            );
        }
    }
    Ok(())
}

/// Normalizes, matches and relabels all chains against chain 0.
pub fn adjust(posterior: &mut Group<Variable>) -> Result<Vec<ComponentMatch>> {
    let matches = resolve(posterior)?;
    normalize(posterior)?;
    apply(posterior, &matches)?;
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{s, Array, Array4, IxDyn};
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    const T: usize = 30;
    const S: usize = 6;
    const N: usize = 4;

    /// Two chains; chain 1 holds the components of chain 0 swapped and negated.
    fn swapped_posterior() -> Group<Variable> {
        let mut rng = SmallRng::seed_from_u64(9);
        let base_pc = Array::from_shape_fn((2, T), |(k, t)| {
            let t = t as f64;
            if k == 0 {
                (t / 4.0).sin()
            } else {
                0.05 * t - 0.7
            }
        });
        let base_w = Array::from_shape_fn((2, S), |(k, x)| (x as f64 + 1.0) * if k == 0 { 1.0 } else { -0.5 });
        let mut pcs = Array4::<f64>::zeros((2, N, 2, T));
        let mut eofs = Array4::<f64>::zeros((2, N, 2, S));
        for d in 0..N {
            for k in 0..2 {
                let noise: f64 = 0.01 * rng.sample::<f64, _>(StandardNormal);
                pcs.slice_mut(s![0, d, k, ..]).assign(&base_pc.row(k).mapv(|v| v + noise));
                eofs.slice_mut(s![0, d, k, ..]).assign(&base_w.row(k));
                pcs.slice_mut(s![1, d, 1 - k, ..]).assign(&base_pc.row(k).mapv(|v| -2.0 * (v + noise)));
                eofs.slice_mut(s![1, d, 1 - k, ..]).assign(&base_w.row(k).mapv(|v| -0.5 * v));
            }
        }
        let mut posterior = Group::new();
        posterior.insert(Variable::Pc, pcs.into_dyn());
        posterior.insert(Variable::Eof, eofs.into_dyn());
        posterior.insert(
            Variable::SigmaEof,
            Array::from_shape_fn(IxDyn(&[2, N, 2]), |ix| 1.0 + ix[0] as f64 + 10.0 * ix[2] as f64),
        );
        posterior
    }

    fn product(posterior: &Group<Variable>, chain: usize) -> Array2<f64> {
        let mut field = Array2::<f64>::zeros((T, S));
        for k in 0..2 {
            let pc = posterior.component(Variable::Pc, chain, 0, k).unwrap();
            let w = posterior.component(Variable::Eof, chain, 0, k).unwrap();
            field = field + &pc.insert_axis(Axis(1)) * &w.insert_axis(Axis(0));
        }
        field
    }

    #[test]
    fn correlation_skips_missing_pairs() {
        let a = ndarray::array![1.0, 2.0, f64::NAN, 4.0];
        let b = ndarray::array![2.0, 4.0, 100.0, 8.0];
        let corr = correlation_matrix(&[a, b]);
        assert_abs_diff_eq!(corr[[0, 1]], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn resolve_finds_swapped_and_negated_components() {
        let matches = resolve(&swapped_posterior()).unwrap();
        let chain1: Vec<(usize, usize, f64)> = matches
            .iter()
            .filter(|m| m.chain == 1)
            .map(|m| (m.component, m.source_component, m.sign))
            .collect();
        assert_eq!(chain1, vec![(0, 1, -1.0), (1, 0, -1.0)]);
        assert!(matches
            .iter()
            .filter(|m| m.chain == 0)
            .all(|m| m.component == m.source_component && m.sign == 1.0));
    }

    #[test]
    fn adjusted_chains_correlate_positively_and_keep_products() {
        let mut posterior = swapped_posterior();
        let before: Vec<Array2<f64>> = (0..2).map(|c| product(&posterior, c)).collect();
        adjust(&mut posterior).unwrap();

        let series = mean_pc_series(posterior.require(Variable::Pc).unwrap()).unwrap();
        let corr = correlation_matrix(&series);
        // series index k * n_chains + chain
        assert!(corr[[0, 1]] > 0.99);
        assert!(corr[[2, 3]] > 0.99);

        for chain in 0..2 {
            assert_abs_diff_eq!(product(&posterior, chain), before[chain], epsilon = 1e-9);
        }
        let eofs = posterior.require(Variable::Eof).unwrap();
        let w = eofs.slice(s![1, 0, 0, ..]);
        assert_abs_diff_eq!(w.std(0.0), 1.0, epsilon = 1e-12);

        // sigma_eof follows its component: chain 1 component 0 came from component 1.
        let sigma_eof = posterior.require(Variable::SigmaEof).unwrap();
        let scale = eofs.slice(s![1, 0, 0, ..]).std(0.0);
        assert!(sigma_eof[[1, 0, 0].as_slice()] > 5.0 * scale);
    }

    #[test]
    fn constant_series_give_nan_sign() {
        let mut posterior = Group::new();
        posterior.insert(Variable::Pc, Array::from_elem(IxDyn(&[2, 3, 1, 5]), 1.0));
        posterior.insert(Variable::Eof, Array::from_elem(IxDyn(&[2, 3, 1, 4]), 1.0));
        let matches = resolve(&posterior).unwrap();
        assert!(matches.iter().all(|m| m.sign.is_nan()));
    }
}
