use log::debug;
use ndarray::{Array4, ArrayView4};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, SyncBnErr},
    kernel::{self, BackwardOutput},
    metrics::SyncMetrics,
    stats::{self, GlobalStats, GradTotals},
    sync::{DeviceRole, SyncEndpoint},
};

/// Configuration surface of a [`BatchNorm2dSync`] layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchNormConfig {
    pub num_features: usize,
    pub eps: f32,
    pub momentum: f32,
    pub affine: bool,
    pub track_running_stats: bool,
}

impl BatchNormConfig {
    /// Defaults matching the usual batch norm conventions: `eps = 1e-5`,
    /// `momentum = 0.1`, affine and running-stats tracking enabled.
    pub fn new(num_features: usize) -> Self {
        Self {
            num_features,
            eps: 1e-5,
            momentum: 0.1,
            affine: true,
            track_running_stats: true,
        }
    }
}

/// How a forward call resolves its statistics.
///
/// Recomputed fresh on every call from the training flag, the tracking
/// flag and the endpoint role. There is no stored phase field, so a device
/// being re-assigned between calls needs no explicit reconfiguration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Use running statistics directly, no accumulation, no rendezvous.
    Inference,
    /// Compute local statistics, no rendezvous.
    SingleDevice,
    /// Collect the cohort's partials, combine, broadcast.
    Coordinator,
    /// Send partials, block for the combined result.
    Worker,
}

/// Statistics cached between a forward call and its backward call.
///
/// One slot only: rounds never overlap, so pipelining steps through a
/// single layer instance is not supported.
struct ForwardContext {
    mean: Vec<f32>,
    var: Vec<f32>,
    count: usize,
    synced: bool,
}

/// Checkpointable state of one layer replica, `[C]` vectors each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchNormState {
    pub running_mean: Vec<f32>,
    pub running_var: Vec<f32>,
    pub weight: Option<Vec<f32>>,
    pub bias: Option<Vec<f32>>,
    pub steps_tracked: u64,
}

/// One device's replica of a synchronized 2d batch normalization layer.
///
/// In multi-device training every replica of the same layer shares a
/// rendezvous group; statistics are combined across the cohort so each
/// shard is normalized with the exact global mean and variance. The
/// external launcher keeps `weight`, `bias` and the running statistics
/// identical across replicas at step start; this layer only synchronizes
/// the statistics. The coordinator replica is the sole writer of the
/// running statistics.
pub struct BatchNorm2dSync {
    cfg: BatchNormConfig,
    weight: Vec<f32>,
    bias: Vec<f32>,
    running_mean: Vec<f32>,
    running_var: Vec<f32>,
    steps_tracked: u64,
    training: bool,
    endpoint: Option<SyncEndpoint>,
    forward_ctx: Option<ForwardContext>,
}

impl BatchNorm2dSync {
    /// Creates a single-device replica (no rendezvous group).
    pub fn new(cfg: BatchNormConfig) -> Self {
        Self::build(cfg, None)
    }

    /// Creates a replica wired into a rendezvous group.
    ///
    /// # Arguments
    /// * `cfg` - The layer configuration, identical across the cohort.
    /// * `endpoint` - This device's endpoint from [`sync_group`](crate::sync::sync_group).
    pub fn with_endpoint(cfg: BatchNormConfig, endpoint: SyncEndpoint) -> Self {
        Self::build(cfg, Some(endpoint))
    }

    fn build(cfg: BatchNormConfig, endpoint: Option<SyncEndpoint>) -> Self {
        let c = cfg.num_features;
        debug!(
            "BatchNorm2dSync({c}, eps = {}, momentum = {}, affine = {}, track_running_stats = {}, role = {:?})",
            cfg.eps,
            cfg.momentum,
            cfg.affine,
            cfg.track_running_stats,
            endpoint.as_ref().map(SyncEndpoint::role),
        );

        Self {
            weight: vec![1.0; c],
            bias: vec![0.0; c],
            running_mean: vec![0.0; c],
            running_var: vec![1.0; c],
            steps_tracked: 0,
            training: true,
            endpoint,
            forward_ctx: None,
            cfg,
        }
    }

    /// Switches between training and evaluation behavior.
    pub fn train(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Resolves the mode a call issued right now would run in.
    pub fn mode(&self) -> Mode {
        // Batch statistics are still needed in eval when nothing is tracked.
        let compute_stats = self.training || !self.cfg.track_running_stats;
        if !compute_stats {
            return Mode::Inference;
        }
        match self.endpoint.as_ref().map(SyncEndpoint::role) {
            None => Mode::SingleDevice,
            Some(DeviceRole::Coordinator) => Mode::Coordinator,
            Some(DeviceRole::Worker) => Mode::Worker,
        }
    }

    /// Normalizes the local `[n, c, h, w]` shard.
    ///
    /// Training replicas resolve the batch statistics (through the
    /// rendezvous when multi-device) and cache them for the matching
    /// backward call; inference applies the running statistics and
    /// mutates nothing.
    ///
    /// # Errors
    /// `ChannelMismatch` before any synchronization if the input channel
    /// dim differs from the configured `num_features`; `DegenerateBatch`
    /// if the whole cohort contributed zero elements; `Disconnected` if a
    /// peer hung up mid-round.
    pub fn forward(&mut self, x: &ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        let (_, channels, _, _) = x.dim();
        if channels != self.cfg.num_features {
            return Err(SyncBnErr::ChannelMismatch {
                got: channels,
                expected: self.cfg.num_features,
            });
        }

        let mode = self.mode();
        if mode == Mode::Inference {
            // Running statistics have no matching backward; a leftover
            // training cache must not arm one with stale moments.
            self.forward_ctx = None;
            return Ok(kernel::normalize_forward(
                x,
                &self.running_mean,
                &self.running_var,
                &self.weight,
                &self.bias,
                self.cfg.eps,
            ));
        }

        let local = stats::partial_stats(x);
        let (global, synced) = match self.endpoint.as_mut() {
            Some(endpoint) => (endpoint.reduce_stats(local)?, true),
            None => {
                let global = stats::combine(&[local]);
                global.ensure_valid()?;
                (global, false)
            }
        };

        // Workers never write the running statistics; the coordinator is
        // the sole writer of record and worker copies are refreshed by the
        // external launcher.
        if self.training && self.cfg.track_running_stats && mode != Mode::Worker {
            self.update_running(&global);
        }

        let y = kernel::normalize_forward(
            x,
            &global.mean,
            &global.var,
            &self.weight,
            &self.bias,
            self.cfg.eps,
        );

        self.forward_ctx = Some(ForwardContext {
            mean: global.mean,
            var: global.var,
            count: global.count,
            synced,
        });

        Ok(y)
    }

    /// Computes the local input gradient and the per-device weight/bias
    /// gradient partials for the step whose forward was just run.
    ///
    /// Consumes the cached forward statistics; calling backward twice, or
    /// without a forward, fails with `MissingForwardContext`.
    pub fn backward(
        &mut self,
        x: &ArrayView4<'_, f32>,
        dy: &ArrayView4<'_, f32>,
    ) -> Result<BackwardOutput> {
        let (_, channels, _, _) = x.dim();
        if channels != self.cfg.num_features {
            return Err(SyncBnErr::ChannelMismatch {
                got: channels,
                expected: self.cfg.num_features,
            });
        }
        if dy.dim() != x.dim() {
            return Err(SyncBnErr::ShapeMismatch {
                a: "upstream gradient",
                b: "input",
                got: dy.len(),
                expected: x.len(),
            });
        }

        let ctx = self
            .forward_ctx
            .take()
            .ok_or(SyncBnErr::MissingForwardContext)?;

        let local = kernel::grad_partials(x, dy, &ctx.mean);
        let totals = match self.endpoint.as_mut() {
            Some(endpoint) if ctx.synced => endpoint.reduce_grads(local)?,
            _ => GradTotals::from(local),
        };

        Ok(kernel::normalize_backward(
            x,
            dy,
            &ctx.mean,
            &ctx.var,
            &totals,
            ctx.count,
            &self.weight,
            self.cfg.eps,
        ))
    }

    /// Exponential moving average over the running statistics.
    ///
    /// The running variance takes the unbiased estimate, corrected with
    /// the cohort-wide count rather than any per-device count. The biased
    /// variance is what was broadcast and applied.
    fn update_running(&mut self, global: &GlobalStats) {
        let momentum = self.cfg.momentum;
        let n = global.count as f32;
        let correction = if global.count > 1 { n / (n - 1.0) } else { 1.0 };

        for ch in 0..self.cfg.num_features {
            self.running_mean[ch] =
                (1.0 - momentum) * self.running_mean[ch] + momentum * global.mean[ch];
            self.running_var[ch] =
                (1.0 - momentum) * self.running_var[ch] + momentum * global.var[ch] * correction;
        }
        self.steps_tracked += 1;
    }

    /// Restores the running statistics to their freshly-initialized values.
    pub fn reset_running_stats(&mut self) {
        self.running_mean.fill(0.0);
        self.running_var.fill(1.0);
        self.steps_tracked = 0;
    }

    /// Snapshot for model checkpointing.
    pub fn state(&self) -> BatchNormState {
        BatchNormState {
            running_mean: self.running_mean.clone(),
            running_var: self.running_var.clone(),
            weight: self.cfg.affine.then(|| self.weight.clone()),
            bias: self.cfg.affine.then(|| self.bias.clone()),
            steps_tracked: self.steps_tracked,
        }
    }

    /// Restores a checkpointed snapshot.
    ///
    /// Every vector is shape-checked before anything is written, so a bad
    /// checkpoint leaves the layer untouched.
    pub fn load_state(&mut self, state: BatchNormState) -> Result<()> {
        let expected = self.cfg.num_features;
        check_len("running_mean", state.running_mean.len(), expected)?;
        check_len("running_var", state.running_var.len(), expected)?;

        let affine = if self.cfg.affine {
            let weight = state
                .weight
                .ok_or(SyncBnErr::MissingParameter { name: "weight" })?;
            let bias = state
                .bias
                .ok_or(SyncBnErr::MissingParameter { name: "bias" })?;
            check_len("weight", weight.len(), expected)?;
            check_len("bias", bias.len(), expected)?;
            Some((weight, bias))
        } else {
            None
        };

        self.running_mean = state.running_mean;
        self.running_var = state.running_var;
        self.steps_tracked = state.steps_tracked;
        if let Some((weight, bias)) = affine {
            self.weight = weight;
            self.bias = bias;
        }

        Ok(())
    }

    pub fn config(&self) -> &BatchNormConfig {
        &self.cfg
    }

    pub fn role(&self) -> Option<DeviceRole> {
        self.endpoint.as_ref().map(SyncEndpoint::role)
    }

    pub fn sync_metrics(&self) -> Option<&SyncMetrics> {
        self.endpoint.as_ref().map(SyncEndpoint::metrics)
    }

    pub fn weight(&self) -> &[f32] {
        &self.weight
    }

    pub fn weight_mut(&mut self) -> &mut [f32] {
        &mut self.weight
    }

    pub fn bias(&self) -> &[f32] {
        &self.bias
    }

    pub fn bias_mut(&mut self) -> &mut [f32] {
        &mut self.bias
    }

    pub fn running_mean(&self) -> &[f32] {
        &self.running_mean
    }

    pub fn running_var(&self) -> &[f32] {
        &self.running_var
    }

    pub fn steps_tracked(&self) -> u64 {
        self.steps_tracked
    }
}

fn check_len(name: &'static str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(SyncBnErr::ShapeMismatch {
            a: name,
            b: "num_features",
            got,
            expected,
        });
    }
    Ok(())
}
