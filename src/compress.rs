//! Trace compression: keeps the draw-wise mean and standard deviation of every
//! variable, plus the same reductions over a few evenly spaced draw windows.

use crate::config::CompressionSettings;
use crate::error::Result;
use crate::trace::{CompressedTrace, Group, InferenceData, RandomWindows, Reduction, Variable};

/// Reduces the posterior over `number_of_rands` windows of `random_sample_size`
/// draws each. The window reductions are stacked along the draw axis.
pub fn random_windows(
    posterior: &Group<Variable>,
    settings: &CompressionSettings,
) -> Result<RandomWindows> {
    let n_draws = posterior.n_draws();
    settings.validate(n_draws)?;
    let starts = settings.window_starts(n_draws);
    let reduce = |reduction: Reduction| -> Result<Group<Variable>> {
        let parts = starts
            .iter()
            .map(|&start| posterior.reduce(reduction, start..start + settings.random_sample_size))
            .collect::<Result<Vec<_>>>()?;
        Group::concat_draws(&parts)
    };
    Ok(RandomWindows {
        mean: reduce(Reduction::Mean)?,
        std: reduce(Reduction::Std)?,
        starts,
        size: settings.random_sample_size,
    })
}

/// Replaces a full trace by its compressed form.
pub fn compress(trace: &InferenceData, settings: &CompressionSettings) -> Result<CompressedTrace> {
    let random = random_windows(&trace.posterior, settings)?;
    let compressed = CompressedTrace {
        mean: trace.reduce_all(Reduction::Mean)?,
        std: trace.reduce_all(Reduction::Std)?,
        random,
    };
    log::info!(
        "compressed trace of {} draws into {} windows of {} draws",
        trace.n_draws(),
        compressed.random.n_windows(),
        compressed.random.size
    );
    Ok(compressed)
}
