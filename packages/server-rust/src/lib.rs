//! Darkroom server: job dispatch, per-operation workers, and status
//! aggregation for an image-transform factory.

pub mod aggregate;
pub mod config;
pub mod dispatch;
pub mod factory;
pub mod mailbox;
pub mod registry;
pub mod shutdown;
pub mod supervisor;
pub mod telemetry;
pub mod worker;

pub use aggregate::{SnapshotPublisher, Subscription};
pub use config::{DarkroomConfig, DeliveryPolicy, MailboxCapacities};
pub use factory::{Factory, FactoryHandle, SubmitError};
pub use mailbox::{LocalTransport, Mailbox, MailboxError, MailboxTransport};
pub use registry::{KeyValueStore, KvWorkerRegistry, MemoryKvStore, RegistryError, WorkerRegistry};
pub use shutdown::{RunState, ShutdownController};
pub use supervisor::ScaleReport;
pub use worker::{LocalSpawner, SpawnError, WorkerSpawner};
