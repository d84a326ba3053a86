//! Factory configuration.

use std::collections::HashSet;
use std::time::Duration;

use darkroom_core::Operation;

/// How many registered workers receive each task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DeliveryPolicy {
    /// Exactly one worker per task, chosen round-robin among those with
    /// free capacity.
    #[default]
    One,
    /// Every registered worker gets a copy; the aggregator counts only the
    /// first outcome per (image, operation).
    All,
}

/// Bounded queue sizes for every mailbox the factory binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxCapacities {
    pub intake: usize,
    pub worker: usize,
    pub outcomes: usize,
    pub lifecycle: usize,
    pub supervisor: usize,
}

impl Default for MailboxCapacities {
    fn default() -> Self {
        Self {
            intake: 100,
            worker: 100,
            outcomes: 200,
            lifecycle: 100,
            supervisor: 16,
        }
    }
}

/// Top-level configuration for one factory namespace.
#[derive(Debug, Clone)]
pub struct DarkroomConfig {
    /// Scopes registry keys so independent deployments never see each
    /// other's workers.
    pub namespace: String,
    /// Operations dispatched for every upload, in order.
    pub operations: Vec<Operation>,
    /// Upper bound on discovering and delivering one operation's task.
    pub dispatch_timeout: Duration,
    /// Uploads fanned out concurrently before intake starts queueing.
    pub max_concurrent_uploads: usize,
    pub delivery_policy: DeliveryPolicy,
    pub capacities: MailboxCapacities,
    /// Snapshots buffered per subscriber before updates are dropped.
    pub subscriber_buffer: usize,
    /// How long a spawn request waits for the new worker to bind.
    pub spawn_timeout: Duration,
    /// Upper bound on posting an outcome or lifecycle event.
    pub report_timeout: Duration,
    /// How long shutdown waits for outcome reports in transit.
    pub drain_timeout: Duration,
    /// Workers started per operation at boot.
    pub workers_per_operation: usize,
}

impl Default for DarkroomConfig {
    fn default() -> Self {
        Self {
            namespace: "imgsvc".to_string(),
            operations: Operation::builtins(),
            dispatch_timeout: Duration::from_secs(10),
            max_concurrent_uploads: 64,
            delivery_policy: DeliveryPolicy::One,
            capacities: MailboxCapacities::default(),
            subscriber_buffer: 16,
            spawn_timeout: Duration::from_secs(10),
            report_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(30),
            workers_per_operation: 0,
        }
    }
}

/// Rejected configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("namespace must be non-empty and must not contain '/'")]
    InvalidNamespace,
    #[error("invalid operation name: {0:?}")]
    InvalidOperation(String),
    #[error("operation listed twice: {0}")]
    DuplicateOperation(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

impl DarkroomConfig {
    /// Checks invariants the rest of the factory relies on.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.is_empty() || self.namespace.contains('/') {
            return Err(ConfigError::InvalidNamespace);
        }

        let mut seen = HashSet::new();
        for op in &self.operations {
            let name = op.as_str();
            if name.is_empty() || name.contains('/') || name.chars().any(char::is_whitespace) {
                return Err(ConfigError::InvalidOperation(name.to_string()));
            }
            if !seen.insert(name) {
                return Err(ConfigError::DuplicateOperation(name.to_string()));
            }
        }

        let caps = &self.capacities;
        for (field, value) in [
            ("capacities.intake", caps.intake),
            ("capacities.worker", caps.worker),
            ("capacities.outcomes", caps.outcomes),
            ("capacities.lifecycle", caps.lifecycle),
            ("capacities.supervisor", caps.supervisor),
            ("subscriber_buffer", self.subscriber_buffer),
            ("max_concurrent_uploads", self.max_concurrent_uploads),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(field));
            }
        }

        for (field, value) in [
            ("dispatch_timeout", self.dispatch_timeout),
            ("spawn_timeout", self.spawn_timeout),
            ("report_timeout", self.report_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Zero(field));
            }
        }
        Ok(())
    }
}
