//! Darkroom core: operations, wire messages, snapshot model, and the
//! pluggable transform capability.

pub mod messages;
pub mod snapshot;
pub mod transform;
pub mod types;

pub use messages::{Intake, SpawnAck, SpawnRequest, SystemEvent, Task, TaskOutcome};
pub use snapshot::{Metrics, PerOpMetrics, Snapshot, VariantMap};
pub use transform::{Transform, TransformError, TransformSet, VariantPathTransform};
pub use types::{worker_mailbox_name, ImageId, InstanceId, Operation, WorkerRegistration};
