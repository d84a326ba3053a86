//! Pluggable transform capability keyed by operation name.
//!
//! The dispatcher and workers never know what a transform does; they only look
//! one up by [`Operation`] and run it. New operations are added by inserting a
//! new implementation into a [`TransformSet`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::messages::Task;
use crate::types::Operation;

/// Errors from running a transform. Every variant ends up as a failed
/// `TaskOutcome`; none is propagated further.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("unknown operation: {0}")]
    UnknownOperation(Operation),
    #[error("invalid source reference: {0}")]
    InvalidSource(String),
    #[error("transform failed: {0}")]
    Failed(#[from] anyhow::Error),
}

/// A transform applied to one task's source payload.
#[async_trait]
pub trait Transform: Send + Sync {
    /// The operation this transform implements.
    fn operation(&self) -> Operation;

    /// Runs the transform and returns the result reference (where the variant
    /// was written).
    async fn apply(&self, task: &Task) -> Result<String, TransformError>;
}

/// Registry of transforms indexed by operation.
#[derive(Clone, Default)]
pub struct TransformSet {
    transforms: HashMap<Operation, Arc<dyn Transform>>,
}

impl TransformSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A set holding a [`VariantPathTransform`] for every built-in operation.
    #[must_use]
    pub fn builtins() -> Self {
        let mut set = Self::new();
        for op in Operation::builtins() {
            set.insert(Arc::new(VariantPathTransform::new(op)));
        }
        set
    }

    /// Adds (or replaces) the transform for its operation.
    pub fn insert(&mut self, transform: Arc<dyn Transform>) {
        self.transforms.insert(transform.operation(), transform);
    }

    #[must_use]
    pub fn get(&self, op: &Operation) -> Option<Arc<dyn Transform>> {
        self.transforms.get(op).cloned()
    }

    #[must_use]
    pub fn supports(&self, op: &Operation) -> bool {
        self.transforms.contains_key(op)
    }

    /// Runs the transform registered for `task.op`.
    ///
    /// # Errors
    ///
    /// Returns `TransformError::UnknownOperation` if nothing is registered
    /// for the task's operation, or whatever the transform itself returns.
    pub async fn apply(&self, task: &Task) -> Result<String, TransformError> {
        let transform = self
            .get(&task.op)
            .ok_or_else(|| TransformError::UnknownOperation(task.op.clone()))?;
        transform.apply(task).await
    }

    #[must_use]
    pub fn operations(&self) -> Vec<Operation> {
        let mut ops: Vec<Operation> = self.transforms.keys().cloned().collect();
        ops.sort();
        ops
    }
}

impl std::fmt::Debug for TransformSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformSet")
            .field("operations", &self.operations())
            .finish()
    }
}

/// Resolves the variant location for an operation without touching pixels:
/// `<dir of source>/<op>.jpg`.
///
/// Pixel work is done by an external collaborator that watches those paths;
/// this keeps the dispatch pipeline runnable on its own.
#[derive(Debug, Clone)]
pub struct VariantPathTransform {
    op: Operation,
}

impl VariantPathTransform {
    #[must_use]
    pub fn new(op: Operation) -> Self {
        Self { op }
    }
}

#[async_trait]
impl Transform for VariantPathTransform {
    fn operation(&self) -> Operation {
        self.op.clone()
    }

    async fn apply(&self, task: &Task) -> Result<String, TransformError> {
        if task.source_ref.is_empty() {
            return Err(TransformError::InvalidSource(
                "empty source reference".to_string(),
            ));
        }
        let base = Path::new(&task.source_ref)
            .parent()
            .unwrap_or_else(|| Path::new(""));
        let variant = base.join(format!("{}.jpg", self.op));
        Ok(variant.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ImageId;

    fn task(op: &str, source: &str) -> Task {
        Task {
            image_id: ImageId::new("img1"),
            op: Operation::new(op),
            source_ref: source.to_string(),
        }
    }

    #[tokio::test]
    async fn variant_path_sits_next_to_source() {
        let set = TransformSet::builtins();
        let out = set
            .apply(&task("grayscale", "data/img1/original.png"))
            .await
            .unwrap();
        assert_eq!(out, "data/img1/grayscale.jpg");
    }

    #[tokio::test]
    async fn unknown_operation_is_an_error() {
        let set = TransformSet::builtins();
        let err = set.apply(&task("sepia", "data/x.png")).await.unwrap_err();
        assert!(matches!(err, TransformError::UnknownOperation(op) if op.as_str() == "sepia"));
    }

    #[tokio::test]
    async fn empty_source_is_rejected() {
        let set = TransformSet::builtins();
        let err = set.apply(&task("blur", "")).await.unwrap_err();
        assert!(matches!(err, TransformError::InvalidSource(_)));
    }

    #[test]
    fn builtins_cover_all_four_operations() {
        let set = TransformSet::builtins();
        assert_eq!(set.operations().len(), 4);
        assert!(set.supports(&Operation::new(Operation::ROTATE90)));
    }
}
