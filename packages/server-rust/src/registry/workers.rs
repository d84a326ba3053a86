//! Operation-scoped worker registry on top of a [`KeyValueStore`].
//!
//! Layout: one key per worker, `<namespace>/workers/<operation>/<mailbox>`,
//! with an empty value. Listing an operation is a prefix scan.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use darkroom_core::{worker_mailbox_name, InstanceId, Operation, WorkerRegistration};
use tracing::{debug, warn};

use super::{KeyValueStore, RegistryError};
use crate::telemetry::metric_names;

/// Discovery surface used by workers (register/deregister) and the
/// dispatcher (list).
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    /// Advertises `registration.mailbox` as serving `registration.operation`.
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError` if the backing store is unreachable.
    async fn register(&self, registration: &WorkerRegistration) -> Result<(), RegistryError>;

    /// Withdraws the instance's advertisement. Removing an absent entry is
    /// not an error.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError` if the backing store is unreachable.
    async fn deregister(
        &self,
        operation: &Operation,
        instance: &InstanceId,
    ) -> Result<(), RegistryError>;

    /// Mailbox names currently advertised for `operation`.
    ///
    /// Never fails: an unreachable store yields an empty set, which callers
    /// treat the same as "no workers".
    async fn list(&self, operation: &Operation) -> BTreeSet<String>;
}

/// [`WorkerRegistry`] storing one key per worker in a [`KeyValueStore`].
#[derive(Debug)]
pub struct KvWorkerRegistry<S> {
    store: Arc<S>,
    namespace: String,
}

impl<S: KeyValueStore> KvWorkerRegistry<S> {
    #[must_use]
    pub fn new(store: Arc<S>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn prefix(&self, operation: &Operation) -> String {
        format!("{}/workers/{operation}/", self.namespace)
    }

    fn key(&self, operation: &Operation, mailbox: &str) -> String {
        format!("{}{mailbox}", self.prefix(operation))
    }
}

#[async_trait]
impl<S: KeyValueStore + 'static> WorkerRegistry for KvWorkerRegistry<S> {
    async fn register(&self, registration: &WorkerRegistration) -> Result<(), RegistryError> {
        let key = self.key(&registration.operation, &registration.mailbox);
        self.store.put(&key, b"").await?;
        debug!(key = %key, "worker registered");
        Ok(())
    }

    async fn deregister(
        &self,
        operation: &Operation,
        instance: &InstanceId,
    ) -> Result<(), RegistryError> {
        let key = self.key(operation, &worker_mailbox_name(operation, instance));
        let removed = self.store.delete(&key).await?;
        debug!(key = %key, removed, "worker deregistered");
        Ok(())
    }

    async fn list(&self, operation: &Operation) -> BTreeSet<String> {
        let prefix = self.prefix(operation);
        match self.store.list_prefix(&prefix).await {
            Ok(keys) => keys
                .into_iter()
                .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
                .filter(|mailbox| !mailbox.is_empty())
                .collect(),
            Err(e) => {
                metrics::counter!(metric_names::REGISTRY_LIST_ERRORS, "op" => operation.to_string())
                    .increment(1);
                warn!(op = %operation, error = %e, "worker listing failed, treating as empty");
                BTreeSet::new()
            }
        }
    }
}
