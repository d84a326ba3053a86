//! Wire messages exchanged between the dispatcher, workers, supervisor and
//! aggregator.
//!
//! All payloads are schema-free named `MsgPack` maps (see [`codec`]) with
//! `snake_case` field names, so any transport that moves bytes can carry them.

pub mod codec;
pub mod control;
pub mod lifecycle;
pub mod task;

pub use codec::{decode, encode, CodecError};
pub use control::{SpawnAck, SpawnRequest};
pub use lifecycle::SystemEvent;
pub use task::{Intake, Task, TaskOutcome};

/// Fixed logical mailbox names shared by every component in a namespace.
pub mod mailbox_names {
    /// Job intake, owned by the dispatcher.
    pub const INTAKE: &str = "uploads";
    /// Shared channel for every worker's task outcome.
    pub const OUTCOMES: &str = "transform-updates";
    /// Shared channel for worker lifecycle and upload events.
    pub const LIFECYCLE: &str = "system-events";
    /// Spawn control, owned by the supervisor.
    pub const SUPERVISOR: &str = "supervisor";
}
