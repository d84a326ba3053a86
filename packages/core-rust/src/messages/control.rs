//! Administrative control messages for the supervisor mailbox.

use serde::{Deserialize, Serialize};

use crate::types::Operation;

/// Ask the supervisor to start one more worker instance for `op`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub op: Operation,
}

/// Reply to a [`SpawnRequest`].
///
/// `Started` is only sent after the new instance bound its mailbox and began
/// executing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SpawnAck {
    Started { name: String, mailbox: String },
    Refused { reason: String },
}
