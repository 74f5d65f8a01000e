pub mod batch_norm;
pub mod error;
pub mod kernel;
pub mod metrics;
pub mod stats;
pub mod sync;

pub use batch_norm::{BatchNorm2dSync, BatchNormConfig, BatchNormState, Mode};
pub use error::{Result, SyncBnErr};
pub use kernel::BackwardOutput;
pub use metrics::SyncMetrics;
pub use stats::{GlobalStats, GradPartials, GradTotals, PartialStats};
pub use sync::{DeviceRole, SyncEndpoint, sync_group};
