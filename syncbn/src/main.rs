use std::thread;

use log::info;
use ndarray::Array4;
use ndarray_rand::{RandomExt, rand_distr::StandardNormal};
use syncbn::{
    BatchNorm2dSync, BatchNormConfig, DeviceRole, Result, SyncBnErr, SyncEndpoint, sync_group,
};

const DEVICES: usize = 4;
const CHANNELS: usize = 3;
const SHARD: usize = 8;
const STEPS: usize = 5;

/// Stand-in for the external multi-device launcher: one OS thread per
/// simulated device, each owning its own replica of the same layer.
fn main() -> Result<()> {
    env_logger::init();

    info!("simulating {DEVICES} devices over {STEPS} training steps");

    let mut handles = Vec::with_capacity(DEVICES);
    for (device, endpoint) in sync_group(DEVICES).into_iter().enumerate() {
        handles.push(thread::spawn(move || run_device(device, endpoint)));
    }

    for handle in handles {
        handle.join().map_err(|_| SyncBnErr::Disconnected)??;
    }

    info!("all devices finished");
    Ok(())
}

fn run_device(device: usize, endpoint: SyncEndpoint) -> Result<()> {
    let role = endpoint.role();
    let mut layer = BatchNorm2dSync::with_endpoint(BatchNormConfig::new(CHANNELS), endpoint);

    for step in 0..STEPS {
        let x: Array4<f32> = Array4::random((SHARD, CHANNELS, 4, 4), StandardNormal);
        let _y = layer.forward(&x.view())?;

        let dy: Array4<f32> = Array4::random(x.raw_dim(), StandardNormal);
        let grads = layer.backward(&x.view(), &dy.view())?;

        let dw_norm = grads.dweight.iter().map(|g| g * g).sum::<f32>().sqrt();
        info!("device {device} ({role:?}) step {step}: |dweight| = {dw_norm:.4}");
    }

    if role == DeviceRole::Coordinator {
        info!("running_mean = {:?}", layer.running_mean());
        info!("running_var = {:?}", layer.running_var());
    }

    Ok(())
}
