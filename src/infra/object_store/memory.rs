//! In-memory object store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::transport::ObjectStore;
use crate::core::BackendError;

/// Object store held in a mutex-guarded map.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    puts: AtomicU64,
    injected_failures: AtomicU32,
}

impl InMemoryObjectStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is stored.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().contains_key(key)
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    /// Successful `put` calls so far.
    #[must_use]
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// Sorted keys starting with `prefix`.
    #[must_use]
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Make the next `count` calls fail with a transient error.
    pub fn fail_next(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    fn injected_failure(&self) -> Result<(), BackendError> {
        let taken = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if taken.is_ok() {
            return Err(BackendError::Transient("object store unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BackendError> {
        self.injected_failure()?;
        self.objects.lock().insert(key.to_owned(), bytes);
        self.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BackendError> {
        self.injected_failure()?;
        self.objects
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(key.to_owned()))
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.injected_failure()?;
        self.objects.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete() {
        let store = InMemoryObjectStore::new();
        store.put("a/b", vec![1, 2, 3]).await.unwrap();
        assert_eq!(store.get("a/b").await.unwrap(), vec![1, 2, 3]);
        assert_eq!(store.keys_with_prefix("a/"), vec!["a/b".to_string()]);
        store.delete("a/b").await.unwrap();
        store.delete("a/b").await.unwrap();
        assert!(matches!(
            store.get("a/b").await.unwrap_err(),
            BackendError::NotFound(_)
        ));
    }
}
