//! The externally published view of aggregate state.
//!
//! A [`Snapshot`] is always recomputed wholesale by the aggregator and handed
//! out as an immutable copy. JSON is the publish format, matching what
//! observers (dashboards, SSE streams) consume:
//!
//! ```json
//! {"variants": {"img1": {"thumbnail": "/images/img1/thumbnail.jpg"}},
//!  "metrics": {"total_uploads": 1, "total_variants": 1, "failed_variants": 0,
//!              "worker_active": 4, "worker_started": 4,
//!              "per_op": {"active": {..}, "success": {..}, "failed": {..}}}}
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// image id -> operation -> result location.
///
/// `BTreeMap` keeps serialization order deterministic.
pub type VariantMap = BTreeMap<String, BTreeMap<String, String>>;

/// Public location of a produced variant: `/images/<image_id>/<file name>`.
///
/// Only the file name of `result_ref` is kept, so storage layout never leaks
/// to observers.
#[must_use]
pub fn public_location(image_id: &str, result_ref: &str) -> String {
    let file = std::path::Path::new(result_ref)
        .file_name()
        .map_or_else(|| result_ref.to_string(), |f| f.to_string_lossy().into_owned());
    format!("/images/{image_id}/{file}")
}

/// Per-operation counters keyed by operation name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerOpMetrics {
    #[serde(default)]
    pub active: BTreeMap<String, u64>,
    #[serde(default)]
    pub success: BTreeMap<String, u64>,
    #[serde(default)]
    pub failed: BTreeMap<String, u64>,
}

/// Aggregate counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    pub total_uploads: u64,
    /// Successful outcomes across all operations.
    pub total_variants: u64,
    pub failed_variants: u64,
    pub worker_active: u64,
    /// Lifetime count of `worker_start` events.
    pub worker_started: u64,
    pub per_op: PerOpMetrics,
}

/// Full aggregate status at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub variants: VariantMap,
    pub metrics: Metrics,
}

impl Snapshot {
    /// Location recorded for `(image_id, op)`, if any.
    #[must_use]
    pub fn location(&self, image_id: &str, op: &str) -> Option<&str> {
        self.variants
            .get(image_id)
            .and_then(|ops| ops.get(op))
            .map(String::as_str)
    }

    #[must_use]
    pub fn success_count(&self, op: &str) -> u64 {
        self.metrics.per_op.success.get(op).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn failed_count(&self, op: &str) -> u64 {
        self.metrics.per_op.failed.get(op).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn active_count(&self, op: &str) -> u64 {
        self.metrics.per_op.active.get(op).copied().unwrap_or(0)
    }

    /// Serializes the snapshot to its JSON publish format.
    ///
    /// # Errors
    ///
    /// Returns an error only if serialization itself fails, which cannot
    /// happen for string-keyed maps and integers.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parses a snapshot from its JSON publish format.
    ///
    /// # Errors
    ///
    /// Returns an error if `json` does not match the snapshot shape.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
