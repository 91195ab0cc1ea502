//! Minimal blob interface the upload protocol depends on. Concrete object-store drivers
//! (S3, Swift, HDFS, GCS) are external collaborators; this crate ships a local-filesystem
//! implementation built on the `object_store` crate for development and an in-memory fake for
//! tests.

use async_trait::async_trait;
use object_store::{local::LocalFileSystem, path::Path as ObjectPath, ObjectStore, PutPayload};
use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
};

use crate::error::{Result, SecoriteError};

/// Uploads a local path to a remote URI; lists and deletes remote objects under a prefix.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, local_path: &Path, remote_uri: &str) -> Result<()>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    async fn delete(&self, remote_uri: &str) -> Result<()>;
}

fn transient(operation: &'static str, err: impl std::error::Error + Send + Sync + 'static) -> SecoriteError {
    SecoriteError::TransientIo {
        operation,
        source: err.into(),
    }
}

/// Object-store-backed [`BlobStore`], rooted at `root`. Any `object_store`-supported scheme
/// (`s3://`, `file://`, etc.) works here; only local filesystem roots are wired up directly, to
/// keep the crate's own dependency surface small — a deployment wanting S3 constructs the
/// `object_store` client itself and passes it in.
pub struct ObjectStoreBlobStore {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreBlobStore {
    pub fn local(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| transient("create local blob store root", e))?;
        let store = LocalFileSystem::new_with_prefix(root)
            .map_err(|e| transient("open local object store", e))?;
        Ok(Self { store: Arc::new(store) })
    }

    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    fn object_path(remote_uri: &str) -> ObjectPath {
        ObjectPath::from(remote_uri.trim_start_matches('/'))
    }
}

#[async_trait]
impl BlobStore for ObjectStoreBlobStore {
    async fn upload(&self, local_path: &Path, remote_uri: &str) -> Result<()> {
        let bytes = tokio::fs::read(local_path)
            .await
            .map_err(|e| transient("read local file for upload", e))?;

        self.store
            .put(&Self::object_path(remote_uri), PutPayload::from(bytes))
            .await
            .map_err(|e| transient("put object", e))?;

        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        use futures::StreamExt;

        let mut stream = self.store.list(Some(&Self::object_path(prefix)));
        let mut out = Vec::new();
        while let Some(meta) = stream.next().await {
            let meta = meta.map_err(|e| transient("list objects", e))?;
            out.push(meta.location.to_string());
        }
        Ok(out)
    }

    async fn delete(&self, remote_uri: &str) -> Result<()> {
        self.store
            .delete(&Self::object_path(remote_uri))
            .await
            .map_err(|e| transient("delete object", e))
    }
}

/// In-memory fake used in tests to assert on uploaded bytes and to simulate transient failures.
#[derive(Default, Clone)]
pub struct InMemoryBlobStore {
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, remote_uri: &str) -> Option<Vec<u8>> {
        self.objects.lock().expect("lock acquired").get(remote_uri).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().expect("lock acquired").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn upload(&self, local_path: &Path, remote_uri: &str) -> Result<()> {
        let bytes = tokio::fs::read(local_path)
            .await
            .map_err(|e| transient("read local file for upload", e))?;
        self.objects
            .lock()
            .expect("lock acquired")
            .insert(remote_uri.to_string(), bytes);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .lock()
            .expect("lock acquired")
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, remote_uri: &str) -> Result<()> {
        self.objects.lock().expect("lock acquired").remove(remote_uri);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn s4_idempotent_reupload_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let local_file = dir.path().join("0_3_00000000000000000100.log");
        tokio::fs::write(&local_file, b"record-bytes").await.unwrap();

        let store = InMemoryBlobStore::new();
        store.upload(&local_file, "t/dt=2024-01-02/0_3_00000000000000000100.log").await.unwrap();
        let first = store.get("t/dt=2024-01-02/0_3_00000000000000000100.log").unwrap();

        store.upload(&local_file, "t/dt=2024-01-02/0_3_00000000000000000100.log").await.unwrap();
        let second = store.get("t/dt=2024-01-02/0_3_00000000000000000100.log").unwrap();

        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
    }
}
