use ndarray::{Array4, ArrayView4, Axis, Zip};
use rayon::prelude::*;

use crate::stats::{GradPartials, GradTotals};

/// Per-device gradients produced by the backward kernel.
///
/// `dx` is the gradient with respect to the local input shard. `dweight`
/// and `dbias` are this device's partial sums; the external
/// optimizer/reducer is responsible for summing them across devices.
#[derive(Debug, Clone, PartialEq)]
pub struct BackwardOutput {
    pub dx: Array4<f32>,
    pub dweight: Vec<f32>,
    pub dbias: Vec<f32>,
}

/// Applies `y = weight·(x − mean)/√(var + eps) + bias` per channel.
///
/// The per-channel affine and normalization collapse into one fused
/// scale/shift, applied identically by every device once the statistics
/// are resolved.
pub fn normalize_forward(
    x: &ArrayView4<'_, f32>,
    mean: &[f32],
    var: &[f32],
    weight: &[f32],
    bias: &[f32],
    eps: f32,
) -> Array4<f32> {
    let (_, channels, _, _) = x.dim();

    let scale: Vec<f32> = (0..channels)
        .map(|ch| weight[ch] / (var[ch] + eps).sqrt())
        .collect();
    let shift: Vec<f32> = (0..channels)
        .map(|ch| bias[ch] - mean[ch] * scale[ch])
        .collect();

    let mut y = Array4::<f32>::zeros(x.raw_dim());
    y.axis_iter_mut(Axis(1))
        .into_par_iter()
        .enumerate()
        .for_each(|(ch, mut lane)| {
            let (a, b) = (scale[ch], shift[ch]);
            Zip::from(&mut lane)
                .and(&x.index_axis(Axis(1), ch))
                .for_each(|out, &v| *out = v.mul_add(a, b));
        });

    y
}

/// Computes the local backward reduction sums Σdy and Σdy·(x − mean).
///
/// Double accumulation, parallel over channels. These are the only
/// quantities exchanged through the rendezvous in the backward pass.
pub fn grad_partials(
    x: &ArrayView4<'_, f32>,
    dy: &ArrayView4<'_, f32>,
    mean: &[f32],
) -> GradPartials {
    let (_, channels, _, _) = x.dim();

    let sums: Vec<(f64, f64)> = (0..channels)
        .into_par_iter()
        .map(|ch| {
            let xc = x.index_axis(Axis(1), ch);
            let dyc = dy.index_axis(Axis(1), ch);
            let mu = mean[ch] as f64;

            let mut grad_sum = 0.0f64;
            let mut grad_dot_sum = 0.0f64;
            for (&xv, &g) in xc.iter().zip(dyc.iter()) {
                let g = g as f64;
                grad_sum += g;
                grad_dot_sum += g * (xv as f64 - mu);
            }
            (grad_sum, grad_dot_sum)
        })
        .collect();

    GradPartials {
        grad_sum: sums.iter().map(|&(s, _)| s).collect(),
        grad_dot_sum: sums.iter().map(|&(_, d)| d).collect(),
    }
}

/// Standard batch-norm backward with the globally-combined sums
/// substituted for the local ones.
///
/// Per channel, with `m` the cohort-wide element count:
/// `dx = weight/√(var+eps) · (dy − Σdy/m − (x−mean)·Σdy(x−mean)/(m·(var+eps)))`
pub fn normalize_backward(
    x: &ArrayView4<'_, f32>,
    dy: &ArrayView4<'_, f32>,
    mean: &[f32],
    var: &[f32],
    totals: &GradTotals,
    count: usize,
    weight: &[f32],
    eps: f32,
) -> BackwardOutput {
    let (_, channels, _, _) = x.dim();
    let m = count as f64;

    let mut dx = Array4::<f32>::zeros(x.raw_dim());
    let mut dweight = vec![0.0f32; channels];
    let mut dbias = vec![0.0f32; channels];

    dx.axis_iter_mut(Axis(1))
        .into_par_iter()
        .zip(dweight.par_iter_mut())
        .zip(dbias.par_iter_mut())
        .enumerate()
        .for_each(|(ch, ((mut dxc, dw), db))| {
            let xc = x.index_axis(Axis(1), ch);
            let dyc = dy.index_axis(Axis(1), ch);

            let mu = mean[ch] as f64;
            let denom = var[ch] as f64 + eps as f64;
            let inv_std = 1.0 / denom.sqrt();
            let w = weight[ch] as f64;
            let mean_dy = totals.grad_sum[ch] / m;
            let mean_dot = totals.grad_dot_sum[ch] / m;

            let mut dw_acc = 0.0f64;
            let mut db_acc = 0.0f64;
            Zip::from(&mut dxc).and(&xc).and(&dyc).for_each(|out, &xv, &g| {
                let xv = xv as f64;
                let g = g as f64;
                let centered = xv - mu;
                *out = (w * inv_std * (g - mean_dy - centered * mean_dot / denom)) as f32;
                dw_acc += g * centered * inv_std;
                db_acc += g;
            });

            *dw = dw_acc as f32;
            *db = db_acc as f32;
        });

    BackwardOutput { dx, dweight, dbias }
}
