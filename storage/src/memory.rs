use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use storage_driver::{
    Driver, Metadata, Persisted, Reader, StorageError, StorageErrorKind, Writer,
};

const ENGINE: &str = "memory";

fn bucket_not_found(bucket: &str) -> StorageError {
    StorageError::builder(
        ENGINE,
        StorageErrorKind::NotFound,
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Bucket not found: {bucket}"),
        ),
    )
    .bucket(bucket)
    .context("bucket not found")
    .build()
}

fn path_not_found(bucket: &str, remote: &Utf8Path) -> StorageError {
    StorageError::builder(
        ENGINE,
        StorageErrorKind::NotFound,
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Path not found: {remote}"),
        ),
    )
    .bucket(bucket)
    .path(remote.as_str())
    .context("path not found")
    .build()
}

#[derive(Debug)]
struct MemoryFileItem {
    created: DateTime<Utc>,
    data: Vec<u8>,
}

impl From<Vec<u8>> for MemoryFileItem {
    fn from(data: Vec<u8>) -> Self {
        Self {
            created: Utc::now(),
            data,
        }
    }
}

impl From<&MemoryFileItem> for Metadata {
    fn from(value: &MemoryFileItem) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
        }
    }
}

/// Storage driver that stores objects in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    buckets: RwLock<HashMap<String, HashMap<Utf8PathBuf, MemoryFileItem>>>,
}

impl MemoryStorage {
    /// Create a new `MemoryStorage` instance, with no buckets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new `MemoryStorage` instance, with the given buckets.
    pub fn with_buckets(buckets: &[&str]) -> Self {
        let mut map = HashMap::new();
        for bucket in buckets {
            map.insert(bucket.to_string(), HashMap::new());
        }

        Self {
            buckets: RwLock::new(map),
        }
    }

    /// Create a new bucket in the storage.
    pub async fn create_bucket(&self, bucket: String) {
        let mut buckets = self.buckets.write().await;
        buckets.entry(bucket).or_default();
    }
}

async fn read_all(reader: &mut Reader<'_>) -> Result<Vec<u8>, StorageError> {
    let mut buf = Vec::new();
    tokio::io::copy_buf(reader, &mut buf)
        .await
        .map_err(|err| StorageError::io(ENGINE, err))?;
    Ok(buf)
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let buckets = self.buckets.read().await;
        let bucket_map = buckets.get(bucket).ok_or_else(|| bucket_not_found(bucket))?;
        Ok(bucket_map
            .get(remote)
            .ok_or_else(|| path_not_found(bucket, remote))?
            .into())
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let buf = read_all(local).await?;

        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets.entry(bucket.to_string()).or_default();
        bucket_map.insert(remote.to_owned(), buf.into());

        Ok(())
    }

    async fn append(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        // Read outside the lock, the reader may be slow.
        let buf = read_all(local).await?;
        let appended = buf.len() as u64;

        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets.entry(bucket.to_string()).or_default();
        match bucket_map.get_mut(remote) {
            Some(item) => item.data.extend_from_slice(&buf),
            None => {
                bucket_map.insert(remote.to_owned(), buf.into());
            }
        }

        Ok(appended)
    }

    async fn truncate(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        size: u64,
    ) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let item = buckets
            .get_mut(bucket)
            .ok_or_else(|| bucket_not_found(bucket))?
            .get_mut(remote)
            .ok_or_else(|| path_not_found(bucket, remote))?;
        item.data.truncate(size as usize);
        Ok(())
    }

    async fn persist(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<Persisted, StorageError> {
        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets
            .get_mut(bucket)
            .ok_or_else(|| bucket_not_found(bucket))?;

        let item = bucket_map
            .remove(from)
            .ok_or_else(|| path_not_found(bucket, from))?;

        if bucket_map.contains_key(to) {
            tracing::trace!(%from, %to, "destination exists, discarding source");
            return Ok(Persisted::Existing);
        }

        bucket_map.insert(to.to_owned(), item);
        Ok(Persisted::Created)
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        use tokio::io::AsyncWriteExt;

        let data = {
            let buckets = self.buckets.read().await;
            let bucket_map = buckets.get(bucket).ok_or_else(|| bucket_not_found(bucket))?;
            bucket_map
                .get(remote)
                .ok_or_else(|| path_not_found(bucket, remote))?
                .data
                .clone()
        };

        local
            .write_all(&data)
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;

        local
            .flush()
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;

        Ok(())
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets
            .get_mut(bucket)
            .ok_or_else(|| bucket_not_found(bucket))?;
        bucket_map.remove(remote);

        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        tracing::trace!(%bucket, ?prefix, "list memory bucket");

        let buckets = self.buckets.read().await;
        let bucket_map = buckets.get(bucket).ok_or_else(|| bucket_not_found(bucket))?;

        let mut paths: Vec<String> = bucket_map
            .keys()
            .filter(|path| prefix.is_none_or(|prefix| path.starts_with(prefix)))
            .map(|path| path.to_string())
            .collect();
        paths.sort();

        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn put(storage: &MemoryStorage, path: &str, data: &[u8]) {
        let mut reader = data;
        storage
            .upload("test", Utf8Path::new(path), &mut reader)
            .await
            .unwrap();
    }

    async fn get(storage: &MemoryStorage, path: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        storage
            .download("test", Utf8Path::new(path), &mut buf)
            .await
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn append_creates_then_extends() {
        let storage = MemoryStorage::with_buckets(&["test"]);

        let mut first: &[u8] = b"hello ";
        let n = storage
            .append("test", Utf8Path::new("uploads/a"), &mut first)
            .await
            .unwrap();
        assert_eq!(n, 6);

        let mut second: &[u8] = b"world";
        storage
            .append("test", Utf8Path::new("uploads/a"), &mut second)
            .await
            .unwrap();

        assert_eq!(get(&storage, "uploads/a").await, b"hello world");
    }

    #[tokio::test]
    async fn truncate_drops_the_tail() {
        let storage = MemoryStorage::with_buckets(&["test"]);
        put(&storage, "uploads/a", b"hello world").await;

        storage
            .truncate("test", Utf8Path::new("uploads/a"), 5)
            .await
            .unwrap();
        assert_eq!(get(&storage, "uploads/a").await, b"hello");

        let err = storage
            .truncate("test", Utf8Path::new("uploads/missing"), 0)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn persist_first_writer_wins() {
        let storage = MemoryStorage::with_buckets(&["test"]);
        put(&storage, "staging/1", b"first").await;
        put(&storage, "staging/2", b"second").await;

        let outcome = storage
            .persist("test", Utf8Path::new("staging/1"), Utf8Path::new("objects/x"))
            .await
            .unwrap();
        assert_eq!(outcome, Persisted::Created);

        let outcome = storage
            .persist("test", Utf8Path::new("staging/2"), Utf8Path::new("objects/x"))
            .await
            .unwrap();
        assert_eq!(outcome, Persisted::Existing);

        assert_eq!(get(&storage, "objects/x").await, b"first");
        let remaining = storage.list("test", None).await.unwrap();
        assert_eq!(remaining, vec!["objects/x".to_string()]);
    }

    #[tokio::test]
    async fn missing_objects_are_not_found() {
        let storage = MemoryStorage::with_buckets(&["test"]);
        let err = storage
            .metadata("test", Utf8Path::new("nope"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(!storage.exists("test", Utf8Path::new("nope")).await.unwrap());

        let err = storage
            .metadata("other", Utf8Path::new("nope"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let storage = MemoryStorage::with_buckets(&["test"]);
        put(&storage, "artifact/aa/1", b"1").await;
        put(&storage, "artifact/bb/2", b"2").await;
        put(&storage, "uploads/3", b"3").await;

        let listed = storage
            .list("test", Some(Utf8Path::new("artifact")))
            .await
            .unwrap();
        assert_eq!(listed, vec!["artifact/aa/1", "artifact/bb/2"]);
    }
}
