//! Explicit queue-name → storage registry.
//!
//! Multiple [`crate::queue::Queue`] and [`crate::worker::WorkerPool`]
//! instances referring to the same queue name must share one storage. Rather
//! than ambient global state, the registry is a value the caller constructs
//! and passes where needed, with an explicit lifecycle so tests can isolate
//! instances.
use std::sync::{Arc, Mutex};

use fxhash::FxHashMap;

use super::memory::InMemoryStorage;
use super::StorageError;

/// Maps queue names to shared [`InMemoryStorage`] instances.
pub struct StorageRegistry<T> {
    storages: Arc<Mutex<FxHashMap<String, InMemoryStorage<T>>>>,
}

impl<T> Clone for StorageRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            storages: Arc::clone(&self.storages),
        }
    }
}

impl<T> Default for StorageRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> StorageRegistry<T> {
    pub fn new() -> Self {
        Self {
            storages: Arc::new(Mutex::new(Default::default())),
        }
    }

    /// Returns the storage registered under `name`, creating it with the
    /// given capacity on first use. The capacity of an existing storage is
    /// left as it was.
    pub fn storage(&self, name: &str, capacity: usize) -> Result<InMemoryStorage<T>, StorageError> {
        let mut storages = self.storages.lock().map_err(|_| StorageError::BadState)?;
        Ok(storages
            .entry(name.to_owned())
            .or_insert_with(|| InMemoryStorage::new(capacity))
            .clone())
    }

    /// Drops every registered storage.
    pub fn clear(&self) -> Result<(), StorageError> {
        self.storages
            .lock()
            .map_err(|_| StorageError::BadState)?
            .clear();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::job::Job;
    use crate::storage::StorageAdapter;

    #[tokio::test]
    async fn same_name_shares_state() {
        let registry = StorageRegistry::new();
        let first = registry.storage("emails", 10).unwrap();
        let second = registry.storage("emails", 10).unwrap();

        first.enqueue(Job::new("hello".to_owned())).await.unwrap();
        assert_eq!(second.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn different_names_are_isolated() {
        let registry = StorageRegistry::new();
        let emails = registry.storage("emails", 10).unwrap();
        let reports = registry.storage("reports", 10).unwrap();

        emails.enqueue(Job::new("hello".to_owned())).await.unwrap();
        assert_eq!(reports.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn clear_detaches_existing_handles() {
        let registry = StorageRegistry::new();
        let before = registry.storage("emails", 10).unwrap();
        before.enqueue(Job::new("hello".to_owned())).await.unwrap();

        registry.clear().unwrap();
        let after = registry.storage("emails", 10).unwrap();
        assert_eq!(after.size().await.unwrap(), 0);
        // The old handle still works, it is just no longer registered.
        assert!(after.dequeue(Duration::ZERO).await.unwrap().is_none());
        assert_eq!(before.size().await.unwrap(), 1);
    }
}
