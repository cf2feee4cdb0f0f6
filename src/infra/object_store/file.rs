//! Filesystem object store.
//!
//! Keys map to relative paths under a root directory. Writes go to a
//! temporary file first and are renamed into place, so readers never see a
//! partial blob.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::core::transport::ObjectStore;
use crate::core::BackendError;

/// Object store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileObjectStore {
    root: PathBuf,
}

impl FileObjectStore {
    /// Use `root` as the store directory, creating it if needed.
    ///
    /// # Errors
    ///
    /// `BackendError::Rejected` if the directory cannot be created.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, BackendError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| BackendError::Rejected(format!("{}: {e}", root.display())))?;
        Ok(Self { root })
    }

    /// Store directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, BackendError> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(BackendError::Rejected(format!("invalid object key `{key}`")));
        }
        Ok(self.root.join(relative))
    }
}

fn io_error(key: &str, err: &std::io::Error) -> BackendError {
    match err.kind() {
        ErrorKind::NotFound => BackendError::NotFound(key.to_owned()),
        ErrorKind::PermissionDenied | ErrorKind::InvalidInput => {
            BackendError::Rejected(format!("{key}: {err}"))
        }
        _ => BackendError::Transient(format!("{key}: {err}")),
    }
}

#[async_trait]
impl ObjectStore for FileObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BackendError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(key, &e))?;
        }
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| io_error(key, &e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(key, &e))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BackendError> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path).await.map_err(|e| io_error(key, &e))
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(key, &e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nested_keys_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileObjectStore::open(dir.path()).await.unwrap();
        store.put("results/k/attempt-1", b"ok".to_vec()).await.unwrap();
        assert_eq!(store.get("results/k/attempt-1").await.unwrap(), b"ok");
        store.delete("results/k/attempt-1").await.unwrap();
        store.delete("results/k/attempt-1").await.unwrap();
        assert!(matches!(
            store.get("results/k/attempt-1").await.unwrap_err(),
            BackendError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn escaping_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileObjectStore::open(dir.path()).await.unwrap();
        for key in ["../outside", "/abs", ""] {
            assert!(matches!(
                store.put(key, Vec::new()).await.unwrap_err(),
                BackendError::Rejected(_)
            ));
        }
    }
}
