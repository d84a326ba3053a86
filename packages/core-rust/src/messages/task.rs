//! Job messages: intake, per-operation tasks, and task outcomes.

use serde::{Deserialize, Serialize};

use crate::types::{ImageId, Operation};

/// An accepted upload handed to the dispatcher through the intake mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intake {
    pub image_id: ImageId,
    /// Where the original payload lives (opaque to the core).
    pub source_ref: String,
}

/// One unit of work: apply `op` to the image at `source_ref`.
///
/// Created by the dispatcher per (upload, operation) pair and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub image_id: ImageId,
    pub op: Operation,
    pub source_ref: String,
}

impl Task {
    #[must_use]
    pub fn for_intake(intake: &Intake, op: Operation) -> Self {
        Self {
            image_id: intake.image_id.clone(),
            op,
            source_ref: intake.source_ref.clone(),
        }
    }
}

/// Result of one worker processing one task, reported win or lose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub image_id: ImageId,
    pub op: Operation,
    pub success: bool,
    /// Location of the produced variant. Empty when the transform failed.
    pub result_ref: String,
    /// Failure detail, for logs only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskOutcome {
    #[must_use]
    pub fn succeeded(task: &Task, result_ref: impl Into<String>) -> Self {
        Self {
            image_id: task.image_id.clone(),
            op: task.op.clone(),
            success: true,
            result_ref: result_ref.into(),
            error: None,
        }
    }

    #[must_use]
    pub fn failed(task: &Task, error: impl Into<String>) -> Self {
        Self {
            image_id: task.image_id.clone(),
            op: task.op.clone(),
            success: false,
            result_ref: String::new(),
            error: Some(error.into()),
        }
    }
}
