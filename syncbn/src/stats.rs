use ndarray::{ArrayView4, Axis};
use rayon::prelude::*;

use crate::error::{Result, SyncBnErr};

/// One device's per-channel reduction over its local `[n, c, h, w]` shard.
///
/// Sums are accumulated in `f64` so that large spatial extents don't erode
/// the combined statistics. Produced fresh every pass and moved by value
/// into the rendezvous mailboxes.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialStats {
    /// Per-channel Σx.
    pub sum: Vec<f64>,
    /// Per-channel Σx².
    pub sum_sq: Vec<f64>,
    /// Elements contributed per channel, `n * h * w`.
    pub count: usize,
}

/// The cohort-wide statistics broadcast back to every worker.
///
/// `var` is the biased (population) variance; the unbiased correction is
/// applied only to the running estimate, never to what gets broadcast.
/// `count` is the total element count behind the statistics, which every
/// device needs as the denominator in the backward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalStats {
    pub mean: Vec<f32>,
    pub var: Vec<f32>,
    pub count: usize,
}

impl GlobalStats {
    /// Fails the step if the combined batch held no elements at all.
    ///
    /// A single empty shard is fine; a cohort of empty shards is not.
    pub fn ensure_valid(&self) -> Result<()> {
        if self.count == 0 {
            Err(SyncBnErr::DegenerateBatch)
        } else {
            Ok(())
        }
    }
}

/// One device's backward reduction quantities.
#[derive(Debug, Clone, PartialEq)]
pub struct GradPartials {
    /// Per-channel Σ dy.
    pub grad_sum: Vec<f64>,
    /// Per-channel Σ dy·(x − mean).
    pub grad_dot_sum: Vec<f64>,
}

/// Cohort-wide sums of [`GradPartials`].
#[derive(Debug, Clone, PartialEq)]
pub struct GradTotals {
    pub grad_sum: Vec<f64>,
    pub grad_dot_sum: Vec<f64>,
}

impl From<GradPartials> for GradTotals {
    fn from(value: GradPartials) -> Self {
        Self {
            grad_sum: value.grad_sum,
            grad_dot_sum: value.grad_dot_sum,
        }
    }
}

/// Computes Σx and Σx² per channel over a local shard.
///
/// Pure, O(elements), parallel over channels. An empty shard (`n == 0`)
/// yields all-zero sums and a zero count.
pub fn partial_stats(x: &ArrayView4<'_, f32>) -> PartialStats {
    let (n, c, h, w) = x.dim();

    let sums: Vec<(f64, f64)> = (0..c)
        .into_par_iter()
        .map(|ch| {
            let lane = x.index_axis(Axis(1), ch);
            let mut sum = 0.0f64;
            let mut sum_sq = 0.0f64;
            for &v in lane.iter() {
                let v = v as f64;
                sum += v;
                sum_sq += v * v;
            }
            (sum, sum_sq)
        })
        .collect();

    PartialStats {
        sum: sums.iter().map(|&(s, _)| s).collect(),
        sum_sq: sums.iter().map(|&(_, q)| q).collect(),
        count: n * h * w,
    }
}

/// Combines per-device partials into the cohort statistics.
///
/// Summation is commutative and associative, so the arrival order of the
/// partials is irrelevant. Devices with `count == 0` contribute nothing.
/// The variance is `E[x²] − E[x]²` clamped to be non-negative, guarding
/// against floating-point cancellation.
pub fn combine(partials: &[PartialStats]) -> GlobalStats {
    let channels = partials.first().map_or(0, |p| p.sum.len());

    let mut total_sum = vec![0.0f64; channels];
    let mut total_sum_sq = vec![0.0f64; channels];
    let mut total_count = 0usize;

    for partial in partials {
        for ch in 0..channels {
            total_sum[ch] += partial.sum[ch];
            total_sum_sq[ch] += partial.sum_sq[ch];
        }
        total_count += partial.count;
    }

    let mut mean = vec![0.0f32; channels];
    let mut var = vec![0.0f32; channels];
    if total_count > 0 {
        let m = total_count as f64;
        for ch in 0..channels {
            let mu = total_sum[ch] / m;
            mean[ch] = mu as f32;
            var[ch] = (total_sum_sq[ch] / m - mu * mu).max(0.0) as f32;
        }
    }

    GlobalStats {
        mean,
        var,
        count: total_count,
    }
}

/// Sums per-device gradient partials into cohort totals.
pub fn combine_grads(partials: &[GradPartials]) -> GradTotals {
    let channels = partials.first().map_or(0, |p| p.grad_sum.len());

    let mut grad_sum = vec![0.0f64; channels];
    let mut grad_dot_sum = vec![0.0f64; channels];
    for partial in partials {
        for ch in 0..channels {
            grad_sum[ch] += partial.grad_sum[ch];
            grad_dot_sum[ch] += partial.grad_dot_sum[ch];
        }
    }

    GradTotals {
        grad_sum,
        grad_dot_sum,
    }
}
