//! Key-value store abstraction backing the worker registry.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::RegistryError;

/// Minimal key-value contract the registry needs: point writes, point
/// deletes, and ordered prefix listing.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Writes `value` under `key`, overwriting any previous value.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Unavailable` if the store cannot be reached.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), RegistryError>;

    /// Removes `key`. Returns whether it was present.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Unavailable` if the store cannot be reached.
    async fn delete(&self, key: &str) -> Result<bool, RegistryError>;

    /// Lists every key starting with `prefix`, in key order.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Unavailable` if the store cannot be reached.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, RegistryError>;
}

/// Ordered in-memory store.
///
/// Can be toggled unavailable to exercise the "store unreachable" paths.
#[derive(Debug)]
pub struct MemoryKvStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    available: AtomicBool,
}

impl MemoryKvStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Marks the store reachable or unreachable for every later call.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn check(&self) -> Result<(), RegistryError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RegistryError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ))
        }
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), RegistryError> {
        self.check()?;
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, RegistryError> {
        self.check()?;
        Ok(self.entries.write().remove(key).is_some())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, RegistryError> {
        self.check()?;
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prefix_listing_is_ordered_and_bounded() {
        let store = MemoryKvStore::new();
        for key in ["ns/workers/blur/b", "ns/workers/blur/a", "ns/workers/blurry/x", "ns/other"] {
            store.put(key, b"").await.unwrap();
        }

        let keys = store.list_prefix("ns/workers/blur/").await.unwrap();
        assert_eq!(keys, vec!["ns/workers/blur/a", "ns/workers/blur/b"]);
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let store = MemoryKvStore::new();
        store.put("k", b"v").await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = MemoryKvStore::new();
        store.set_available(false);
        assert!(store.put("k", b"v").await.is_err());
        assert!(store.delete("k").await.is_err());
        assert!(store.list_prefix("").await.is_err());

        store.set_available(true);
        store.put("k", b"v").await.unwrap();
        assert_eq!(store.len(), 1);
    }
}
