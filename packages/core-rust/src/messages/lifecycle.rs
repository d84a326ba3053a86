//! System events posted to the shared lifecycle mailbox.

use serde::{Deserialize, Serialize};

use crate::types::{ImageId, Operation, WorkerRegistration};

/// Event consumed by the aggregator from the lifecycle mailbox.
///
/// Serialized with an `event` tag, e.g.
/// `{"event": "worker_start", "name": .., "op": .., "mailbox": ..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SystemEvent {
    WorkerStart {
        name: String,
        op: Operation,
        mailbox: String,
    },
    WorkerStop {
        name: String,
        op: Operation,
        mailbox: String,
    },
    /// The dispatcher accepted an intake message.
    UploadAccepted { image_id: ImageId },
}

impl SystemEvent {
    #[must_use]
    pub fn worker_start(reg: &WorkerRegistration) -> Self {
        Self::WorkerStart {
            name: reg.instance.to_string(),
            op: reg.operation.clone(),
            mailbox: reg.mailbox.clone(),
        }
    }

    #[must_use]
    pub fn worker_stop(reg: &WorkerRegistration) -> Self {
        Self::WorkerStop {
            name: reg.instance.to_string(),
            op: reg.operation.clone(),
            mailbox: reg.mailbox.clone(),
        }
    }

    /// Short tag used in logs and metrics labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkerStart { .. } => "worker_start",
            Self::WorkerStop { .. } => "worker_stop",
            Self::UploadAccepted { .. } => "upload_accepted",
        }
    }
}
