//! Audio tempo decomposition.
//!
//! ffmpeg's `atempo` filter only accepts a multiplier in `[0.5, 2.0]` per
//! stage. Larger or smaller speed changes are expressed as a chain of stages
//! whose product is the requested factor. Stages are split off by exact
//! powers of two so the product reconstructs the factor bit for bit.

/// Smallest multiplier a single `atempo` stage accepts.
pub const ATEMPO_MIN: f64 = 0.5;
/// Largest multiplier a single `atempo` stage accepts.
pub const ATEMPO_MAX: f64 = 2.0;

/// Decompose `factor` into `atempo` stages, each within
/// [`ATEMPO_MIN`]..=[`ATEMPO_MAX`].
///
/// `factor` must be positive and finite; callers validate this upstream.
pub fn atempo_chain(factor: f64) -> Vec<f64> {
    debug_assert!(factor.is_finite() && factor > 0.0);

    let mut stages = Vec::new();
    let mut rest = factor;
    while rest > ATEMPO_MAX {
        stages.push(ATEMPO_MAX);
        rest /= ATEMPO_MAX;
    }
    while rest < ATEMPO_MIN {
        stages.push(ATEMPO_MIN);
        rest /= ATEMPO_MIN;
    }
    stages.push(rest);
    stages
}

/// Render the chain as an ffmpeg audio filter, e.g. `atempo=2,atempo=2,atempo=2`.
pub fn atempo_filter(factor: f64) -> String {
    atempo_chain(factor)
        .iter()
        .map(|s| format!("atempo={s}"))
        .collect::<Vec<_>>()
        .join(",")
}
