//! Post-processing of hand-built traces through the public `Bpca` API.

use approx::assert_abs_diff_eq;
use bpca::reconstruct::{MapPattern, ReconstructionKind};
use bpca::symmetry::correlation_matrix;
use bpca::trace::{InferenceData, LogLikelihood, SampleStat, Trace, Variable};
use bpca::{Bpca, BpcaError, Observations, Settings};
use ndarray::{array, Array, Array2, Array4, IxDyn};
use tempfile::TempDir;

const T: usize = 24;
const S: usize = 4;
const N: usize = 40;

fn pc(k: usize, t: usize) -> f64 {
    let t = t as f64;
    if k == 0 {
        (t / 3.0).sin()
    } else {
        (t / 7.0).cos() + 0.02 * t
    }
}

fn w(k: usize, x: usize) -> f64 {
    if k == 0 {
        x as f64 - 1.5
    } else {
        0.5 + 0.25 * x as f64
    }
}

fn observations() -> Observations {
    let values = Array2::from_shape_fn((T, S), |(t, x)| pc(0, t) * w(0, x) + pc(1, t) * w(1, x));
    Observations::from_matrix("field", values)
}

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings
        .apply_overrides([
            "number_of_pcs=2",
            "model_trend=false",
            "n_samples=40",
            "compress=false",
        ])
        .unwrap();
    settings
}

/// Chain 1 finds the components in reverse order, with flipped signs and
/// different scales; both chains describe the same field.
fn swapped_trace() -> InferenceData {
    let mut pcs = Array4::<f64>::zeros((2, N, 2, T));
    let mut eofs = Array4::<f64>::zeros((2, N, 2, S));
    for d in 0..N {
        for k in 0..2 {
            for t in 0..T {
                pcs[[0, d, k, t]] = pc(k, t);
                pcs[[1, d, 1 - k, t]] = -3.0 * pc(k, t);
            }
            for x in 0..S {
                eofs[[0, d, k, x]] = w(k, x);
                eofs[[1, d, 1 - k, x]] = -w(k, x) / 3.0;
            }
        }
    }
    let mut data = InferenceData::default();
    data.posterior.insert(Variable::Pc, pcs.into_dyn());
    data.posterior.insert(Variable::Eof, eofs.into_dyn());
    data.posterior
        .insert(Variable::Sigma, Array::from_elem(IxDyn(&[2, N]), 0.05));
    data.sample_stats
        .insert(SampleStat::Lp, Array::from_elem(IxDyn(&[2, N]), -1.0));
    data.log_likelihood.insert(
        LogLikelihood::Observations,
        Array::from_shape_fn(IxDyn(&[2, N, S]), |ix| -0.5 - 0.1 * ix[0] as f64 - 0.01 * (ix[1] % 2) as f64),
    );
    data
}

#[test]
fn symmetry_adjustment_aligns_chains_without_changing_the_field() {
    let mut bpca = Bpca::new(observations(), settings(), "symmetry").unwrap();
    bpca.set_trace(Trace::Full(swapped_trace()));
    let before = bpca
        .recombine(ReconstructionKind::Mean, 1, false)
        .unwrap()
        .estimate
        .clone();

    let matches = bpca.adjust_pca_symmetry().unwrap();
    assert_eq!(matches.len(), 4);

    let posterior = &bpca.trace().unwrap().full().unwrap().posterior;
    for k in 0..2 {
        let reference = posterior.component(Variable::Pc, 0, 0, k).unwrap();
        let other = posterior.component(Variable::Pc, 1, 0, k).unwrap();
        let corr = correlation_matrix(&[reference, other]);
        assert!(corr[[0, 1]] > 0.999, "component {k}: {}", corr[[0, 1]]);
    }

    for chain in 0..2 {
        let after = bpca
            .recombine(ReconstructionKind::Mean, chain, false)
            .unwrap();
        assert_abs_diff_eq!(after.estimate, before, epsilon = 1e-9);
    }
    let explained = bpca.explained_variance().unwrap();
    for v in explained {
        assert_abs_diff_eq!(v, 1.0, epsilon = 1e-9);
    }
}

#[test]
fn compressed_traces_reject_symmetry_and_support_random_windows() {
    let mut settings = settings();
    settings
        .apply_overrides(["random_sample_size=5", "number_of_rands=4"])
        .unwrap();
    let mut bpca = Bpca::new(observations(), settings, "compressed").unwrap();
    bpca.set_trace(Trace::Full(swapped_trace()));
    bpca.compress().unwrap();
    // chain 0 has the higher pointwise log-likelihood
    assert_eq!(bpca.chain_stats[0].chain, 0);
    assert!(bpca.chain_stats[1].d_elpd > 0.0);

    assert!(matches!(
        bpca.adjust_pca_symmetry(),
        Err(BpcaError::TraceCompressed)
    ));
    assert!(matches!(
        bpca.recombine(ReconstructionKind::Random { draw: 4 }, 0, false),
        Err(BpcaError::IndexOutOfRange { .. })
    ));
    let random = bpca
        .recombine(ReconstructionKind::Random { draw: 3 }, 0, false)
        .unwrap();
    assert_abs_diff_eq!(random.std.sum(), 0.0, epsilon = 1e-12);

    let dir = TempDir::new().unwrap();
    let path = bpca.save(dir.path()).unwrap();
    let loaded = Bpca::load(path).unwrap();
    assert_eq!(loaded.dataset(), bpca.dataset());
    assert_eq!(loaded.settings(), bpca.settings());
    assert_eq!(loaded.trace(), bpca.trace());
    assert_eq!(loaded.chain_stats, bpca.chain_stats);
}

#[test]
fn map_reconstruction_is_stored_separately() {
    let mut bpca = Bpca::new(observations(), settings(), "maps").unwrap();
    bpca.set_trace(Trace::Full(swapped_trace()));
    let pattern = MapPattern {
        space: vec!["a".into(), "b".into()],
        eof_mean: array![[1.0, 0.0], [0.0, 2.0]],
        eof_std: Array2::zeros((2, 2)),
        trend_mean: None,
        trend_std: None,
        offset_mean: None,
        offset_std: None,
    };
    let map = bpca
        .recombine(ReconstructionKind::Maps(pattern.clone()), 0, false)
        .unwrap();
    assert_eq!(map.estimate.dim(), (T, 2));
    for t in 0..T {
        assert_abs_diff_eq!(map.estimate[[t, 0]], pc(0, t), epsilon = 1e-12);
        assert_abs_diff_eq!(map.estimate[[t, 1]], 2.0 * pc(1, t), epsilon = 1e-12);
    }
    let components = map.components.as_ref().unwrap();
    assert_eq!(components.pcs, map.estimate);
    assert_eq!(bpca.map_pattern.as_ref(), Some(&pattern));
    assert!(bpca.estimated_dataset.is_none());
}
