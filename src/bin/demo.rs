//! Runs BPCA on a synthetic field of two oscillations plus a trend, then prints
//! diagnostics and the explained variance per location.

use bpca::reconstruct::ReconstructionKind;
use bpca::{Bpca, Observations, Settings};
use ndarray::Array2;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::error::Error;
use std::path::Path;
use std::time::Instant;

fn main() -> Result<(), Box<dyn Error>> {
    const N_TIME: usize = 200;
    const N_SPACE: usize = 6;
    const SEED: u64 = 42;

    let mut rng = SmallRng::seed_from_u64(SEED);
    let values = Array2::from_shape_fn((N_TIME, N_SPACE), |(t, x)| {
        let (t, x) = (t as f64, x as f64);
        let annual = (2.0 * std::f64::consts::PI * t / 36.5).sin() * (1.0 + 0.3 * x);
        let slow = (t / 60.0).cos() * (x - 2.5) * 0.5;
        let trend = 0.002 * (t - N_TIME as f64 / 2.0) * (1.0 + 0.1 * x);
        let noise: f64 = rng.sample(StandardNormal);
        annual + slow + trend + 0.05 * noise
    });
    let observations = Observations::from_matrix("synthetic", values);

    let mut settings = Settings::default();
    settings.apply_overrides([
        "number_of_pcs=2",
        "n_samples=500",
        "tune=500",
        "cores=4",
        "seed=42",
    ])?;

    let mut bpca = Bpca::new(observations, settings, "synthetic_demo")?;
    let start = Instant::now();
    bpca.run()?;
    println!("Sampling and post-processing took {:.2?}", start.elapsed());

    if let Some(stats) = &bpca.convergence_stats {
        println!("{stats}");
    }
    for row in &bpca.chain_stats {
        println!(
            "chain {}: rank {}, elpd_waic {:.1} ± {:.1}",
            row.chain, row.rank, row.elpd_waic, row.se
        );
    }

    let best = bpca.chain_stats.first().map_or(0, |row| row.chain);
    bpca.recombine(ReconstructionKind::Mean, best, true)?;
    let explained = bpca.explained_variance()?;
    println!("Explained variance per location: {explained:.3}");

    let path = bpca.save(Path::new("target/demo"))?;
    println!("Saved model to {}", path.display());
    Ok(())
}
