use std::fmt;

use serde::{Deserialize, Serialize};

/// Named transform kind applied to an uploaded image (e.g. `"thumbnail"`).
///
/// Operations are defined by configuration, never by runtime data. The set is
/// open: any string names an operation, and a `TransformSet` decides whether
/// it can actually be executed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Operation(String);

impl Operation {
    pub const THUMBNAIL: &'static str = "thumbnail";
    pub const GRAYSCALE: &'static str = "grayscale";
    pub const BLUR: &'static str = "blur";
    pub const ROTATE90: &'static str = "rotate90";

    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The four operations every deployment ships with, in dispatch order.
    #[must_use]
    pub fn builtins() -> Vec<Operation> {
        [Self::THUMBNAIL, Self::GRAYSCALE, Self::BLUR, Self::ROTATE90]
            .into_iter()
            .map(Operation::new)
            .collect()
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Operation {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Identifier of one uploaded image. Opaque to the core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(String);

impl ImageId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Allocates a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ImageId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Distinguishes concurrent worker instances registered for the same operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Allocates a fresh instance identifier (uuid v4, simple form).
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A worker's advertisement in the registry: which operation it serves and
/// where tasks for it should be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub operation: Operation,
    pub instance: InstanceId,
    pub mailbox: String,
}

impl WorkerRegistration {
    /// Builds a registration whose mailbox name is derived deterministically
    /// from the operation and instance, so two instances never share a queue.
    #[must_use]
    pub fn new(operation: Operation, instance: InstanceId) -> Self {
        let mailbox = worker_mailbox_name(&operation, &instance);
        Self {
            operation,
            instance,
            mailbox,
        }
    }
}

/// Mailbox name for one worker instance: `worker-<op>-<instance>`.
#[must_use]
pub fn worker_mailbox_name(operation: &Operation, instance: &InstanceId) -> String {
    format!("worker-{operation}-{instance}")
}
