use ndarray::{Array4, Axis};
use syncbn::{BatchNorm2dSync, BatchNormConfig, BatchNormState, Mode, SyncBnErr};

fn one_channel(values: &[f32]) -> Array4<f32> {
    Array4::from_shape_vec((values.len(), 1, 1, 1), values.to_vec()).unwrap()
}

fn sample_input() -> Array4<f32> {
    Array4::from_shape_fn((4, 3, 2, 2), |(n, c, h, w)| {
        ((n * 17 + c * 5 + h * 2 + w) as f32 * 0.613).sin()
    })
}

/// Straight-line single-device batch norm, written independently of the
/// library: f64 channel sums, biased variance, fused f32 scale/shift.
fn reference_batchnorm(x: &Array4<f32>, weight: &[f32], bias: &[f32], eps: f32) -> Array4<f32> {
    let (n, c, h, w) = x.dim();
    let m = (n * h * w) as f64;

    let mut y = Array4::<f32>::zeros(x.raw_dim());
    for ch in 0..c {
        let lane = x.index_axis(Axis(1), ch);
        let mut sum = 0.0f64;
        let mut sum_sq = 0.0f64;
        for &v in lane.iter() {
            let v = v as f64;
            sum += v;
            sum_sq += v * v;
        }
        let mu = sum / m;
        let mean = mu as f32;
        let var = (sum_sq / m - mu * mu).max(0.0) as f32;

        let scale = weight[ch] / (var + eps).sqrt();
        let shift = bias[ch] - mean * scale;
        let mut out = y.index_axis_mut(Axis(1), ch);
        for (o, &v) in out.iter_mut().zip(lane.iter()) {
            *o = v.mul_add(scale, shift);
        }
    }
    y
}

#[test]
fn single_device_training_is_bit_identical_to_reference() {
    let x = sample_input();
    let mut layer = BatchNorm2dSync::new(BatchNormConfig::new(3));
    layer.weight_mut().copy_from_slice(&[2.0, 0.5, 1.0]);
    layer.bias_mut().copy_from_slice(&[0.1, -0.3, 0.0]);

    let y = layer.forward(&x.view()).unwrap();
    let expected = reference_batchnorm(&x, layer.weight(), layer.bias(), 1e-5);

    // No synchronization is involved, so this holds exactly, not merely
    // within tolerance.
    assert_eq!(y, expected);
}

#[test]
fn inference_never_mutates_running_stats() {
    let mut layer = BatchNorm2dSync::new(BatchNormConfig::new(3));
    let x = sample_input();

    // Seed the running statistics with one training step.
    layer.forward(&x.view()).unwrap();
    let mean_before = layer.running_mean().to_vec();
    let var_before = layer.running_var().to_vec();
    assert_eq!(layer.steps_tracked(), 1);

    layer.train(false);
    assert_eq!(layer.mode(), Mode::Inference);
    for _ in 0..3 {
        layer.forward(&x.view()).unwrap();
    }

    assert_eq!(layer.running_mean(), &mean_before[..]);
    assert_eq!(layer.running_var(), &var_before[..]);
    assert_eq!(layer.steps_tracked(), 1);
}

#[test]
fn training_mutates_running_stats_exactly_once_per_call() {
    let mut layer = BatchNorm2dSync::new(BatchNormConfig::new(3));
    let x = sample_input();

    for step in 1..=4u64 {
        layer.forward(&x.view()).unwrap();
        assert_eq!(layer.steps_tracked(), step);
    }
}

#[test]
fn running_stats_follow_exponential_moving_average() {
    let mut layer = BatchNorm2dSync::new(BatchNormConfig::new(1));
    let momentum = layer.config().momentum;

    let batches = [
        vec![1.0f32, 2.0, 3.0, 4.0],
        vec![-2.0, 0.0, 2.0, 8.0],
        vec![5.0, 5.0, 5.0, 5.0],
    ];

    let mut expected_mean = 0.0f32;
    let mut expected_var = 1.0f32;
    for values in &batches {
        let x = one_channel(values);
        layer.forward(&x.view()).unwrap();

        // Mirror of the layer's update: biased batch moments in f64, then
        // the unbiased correction with the total count.
        let m = values.len() as f64;
        let mu = values.iter().map(|&v| v as f64).sum::<f64>() / m;
        let sum_sq = values.iter().map(|&v| (v as f64).powi(2)).sum::<f64>();
        let mean = mu as f32;
        let var = (sum_sq / m - mu * mu).max(0.0) as f32;
        let correction = values.len() as f32 / (values.len() as f32 - 1.0);

        expected_mean = (1.0 - momentum) * expected_mean + momentum * mean;
        expected_var = (1.0 - momentum) * expected_var + momentum * var * correction;

        assert_eq!(layer.running_mean(), &[expected_mean]);
        assert_eq!(layer.running_var(), &[expected_var]);
    }
}

#[test]
fn eval_without_tracking_still_computes_batch_stats() {
    let mut cfg = BatchNormConfig::new(1);
    cfg.track_running_stats = false;
    let mut layer = BatchNorm2dSync::new(cfg);
    layer.train(false);

    assert_eq!(layer.mode(), Mode::SingleDevice);

    let x = one_channel(&[1.0, 3.0]);
    let y = layer.forward(&x.view()).unwrap();

    // Normalized with the batch's own moments (mean 2, var 1), not the
    // (untracked) running values.
    let inv_std = 1.0f32 / (1.0f32 + 1e-5).sqrt();
    assert!((y[[0, 0, 0, 0]] + inv_std).abs() < 1e-6);
    assert!((y[[1, 0, 0, 0]] - inv_std).abs() < 1e-6);
    assert_eq!(layer.steps_tracked(), 0);
}

#[test]
fn channel_mismatch_fails_eagerly() {
    let mut layer = BatchNorm2dSync::new(BatchNormConfig::new(3));
    let x = Array4::<f32>::zeros((2, 4, 1, 1));

    let err = layer.forward(&x.view()).unwrap_err();
    assert_eq!(err, SyncBnErr::ChannelMismatch { got: 4, expected: 3 });
    assert_eq!(layer.steps_tracked(), 0);
}

#[test]
fn degenerate_batch_fails_the_step() {
    let mut layer = BatchNorm2dSync::new(BatchNormConfig::new(2));
    let x = Array4::<f32>::zeros((0, 2, 4, 4));

    let err = layer.forward(&x.view()).unwrap_err();
    assert_eq!(err, SyncBnErr::DegenerateBatch);
}

#[test]
fn backward_requires_a_cached_forward() {
    let mut layer = BatchNorm2dSync::new(BatchNormConfig::new(1));
    let x = one_channel(&[1.0, 2.0]);
    let dy = one_channel(&[0.5, 0.5]);

    let err = layer.backward(&x.view(), &dy.view()).unwrap_err();
    assert_eq!(err, SyncBnErr::MissingForwardContext);

    // One forward arms exactly one backward.
    layer.forward(&x.view()).unwrap();
    layer.backward(&x.view(), &dy.view()).unwrap();
    let err = layer.backward(&x.view(), &dy.view()).unwrap_err();
    assert_eq!(err, SyncBnErr::MissingForwardContext);
}

#[test]
fn inference_forward_disarms_a_stale_training_cache() {
    let mut layer = BatchNorm2dSync::new(BatchNormConfig::new(1));
    let x = one_channel(&[1.0, 2.0, 3.0, 4.0]);
    let dy = one_channel(&[0.1, 0.2, 0.3, 0.4]);

    // Train, then switch to eval without consuming the cached statistics.
    layer.forward(&x.view()).unwrap();
    layer.train(false);
    layer.forward(&x.view()).unwrap();

    // The eval forward must not leave the training step's moments armed.
    let err = layer.backward(&x.view(), &dy.view()).unwrap_err();
    assert_eq!(err, SyncBnErr::MissingForwardContext);
}

#[test]
fn backward_rejects_mismatched_gradient_shape() {
    let mut layer = BatchNorm2dSync::new(BatchNormConfig::new(1));
    let x = one_channel(&[1.0, 2.0, 3.0]);
    let dy = one_channel(&[0.5, 0.5]);

    layer.forward(&x.view()).unwrap();
    let err = layer.backward(&x.view(), &dy.view()).unwrap_err();
    assert!(matches!(err, SyncBnErr::ShapeMismatch { .. }));
}

#[test]
fn checkpoint_round_trips_through_json() {
    let mut layer = BatchNorm2dSync::new(BatchNormConfig::new(3));
    layer.weight_mut().copy_from_slice(&[1.5, 0.5, 2.0]);
    layer.forward(&sample_input().view()).unwrap();

    let state = layer.state();
    let json = serde_json::to_string(&state).unwrap();
    let restored: BatchNormState = serde_json::from_str(&json).unwrap();
    assert_eq!(restored, state);

    let mut fresh = BatchNorm2dSync::new(BatchNormConfig::new(3));
    fresh.load_state(restored).unwrap();
    assert_eq!(fresh.state(), state);
    assert_eq!(fresh.steps_tracked(), 1);
}

#[test]
fn load_state_rejects_bad_shapes_without_partial_mutation() {
    let mut layer = BatchNorm2dSync::new(BatchNormConfig::new(3));
    let before = layer.state();

    let bad = BatchNormState {
        running_mean: vec![0.0; 2],
        running_var: vec![1.0; 3],
        weight: Some(vec![1.0; 3]),
        bias: Some(vec![0.0; 3]),
        steps_tracked: 7,
    };
    assert!(matches!(
        layer.load_state(bad),
        Err(SyncBnErr::ShapeMismatch { .. })
    ));
    assert_eq!(layer.state(), before);

    let missing = BatchNormState {
        running_mean: vec![0.0; 3],
        running_var: vec![1.0; 3],
        weight: None,
        bias: None,
        steps_tracked: 7,
    };
    assert_eq!(
        layer.load_state(missing),
        Err(SyncBnErr::MissingParameter { name: "weight" })
    );
    assert_eq!(layer.state(), before);
}

#[test]
fn non_affine_state_omits_weight_and_bias() {
    let mut cfg = BatchNormConfig::new(2);
    cfg.affine = false;
    let layer = BatchNorm2dSync::new(cfg);

    let state = layer.state();
    assert!(state.weight.is_none());
    assert!(state.bias.is_none());
}
