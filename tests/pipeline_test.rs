//! End-to-end run of a small model: sampling, symmetry adjustment, convergence
//! check, compression, reconstruction and persistence.

use bpca::io::TraceFormat;
use bpca::reconstruct::ReconstructionKind;
use bpca::trace::{Trace, Variable};
use bpca::{Bpca, Observations, Settings};
use ndarray::Array2;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use tempfile::TempDir;

const N_TIME: usize = 30;
const N_SPACE: usize = 3;

fn observations() -> Observations {
    let mut rng = SmallRng::seed_from_u64(7);
    let values = Array2::from_shape_fn((N_TIME, N_SPACE), |(t, x)| {
        let noise: f64 = rng.sample(StandardNormal);
        (t as f64 / 4.0).sin() * (x as f64 + 1.0) * 0.3 + 0.02 * noise
    });
    Observations::from_matrix("pipeline", values)
}

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings
        .apply_overrides([
            "number_of_pcs=1",
            "n_samples=60",
            "tune=60",
            "cores=2",
            "n_leapfrog=5",
            "seed=3",
            "progress=false",
            "random_sample_size=10",
            "number_of_rands=3",
        ])
        .unwrap();
    settings
}

#[test]
fn full_run_produces_a_compressed_trace() {
    let mut bpca = Bpca::new(observations(), settings(), "pipeline").unwrap();
    bpca.run().unwrap();

    let Some(Trace::Compressed(compressed)) = bpca.trace() else {
        panic!("run should leave a compressed trace");
    };
    let pc = compressed.mean.posterior.require(Variable::Pc).unwrap();
    assert_eq!(pc.shape(), &[2, 1, 1, N_TIME]);
    assert_eq!(compressed.random.starts, vec![0, 19, 38]);
    assert_eq!(bpca.chain_stats.len(), 2);
    assert_eq!(bpca.chain_stats[0].rank, 0);
    assert!(bpca.convergence_stats.is_some());

    let mean = bpca
        .recombine(ReconstructionKind::Mean, 0, true)
        .unwrap()
        .clone();
    assert_eq!(mean.estimate.dim(), (N_TIME, N_SPACE));
    assert!(mean.estimate.iter().all(|v| v.is_finite()));
    assert!(mean.std.iter().all(|v| v.is_finite() && *v >= 0.0));

    let random = bpca
        .recombine(ReconstructionKind::Random { draw: 2 }, 1, false)
        .unwrap();
    assert_eq!(random.chain, 1);
    bpca.recombine(ReconstructionKind::RandomMean, 1, false)
        .unwrap();

    let explained = bpca.explained_variance().unwrap();
    assert_eq!(explained.len(), N_SPACE);
    assert!(explained.iter().all(|v| v.is_finite()));
}

#[test]
fn saved_objects_and_traces_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut settings = settings();
    settings.apply_overrides(["compress=false"]).unwrap();
    let mut bpca = Bpca::new(observations(), settings, "saved").unwrap();
    bpca.run().unwrap();
    assert!(!bpca.trace().unwrap().is_compressed());

    let path = bpca.save(dir.path()).unwrap();
    let loaded = Bpca::load(&path).unwrap();
    assert_eq!(loaded.trace(), bpca.trace());
    assert_eq!(loaded.settings(), bpca.settings());

    let csv = bpca.save_trace(dir.path(), TraceFormat::Csv).unwrap();
    let contents = std::fs::read_to_string(csv).unwrap();
    let mut lines = contents.lines();
    assert_eq!(lines.next(), Some("group,variable,chain,draw,index,value"));
    assert!(lines.any(|line| line.starts_with("posterior,PC,1,59,")));
}
