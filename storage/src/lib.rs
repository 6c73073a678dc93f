//! # Storage backends
//!
//! Configuration and unification for the byte store backends used by the
//! registry.

use std::sync::Arc;

use camino::Utf8Path;
#[cfg(feature = "local")]
use camino::Utf8PathBuf;
use serde::Deserialize;
use tokio::io;

#[cfg(feature = "local")]
pub(crate) mod local;

pub(crate) mod memory;
#[cfg(feature = "tmp")]
pub(crate) mod temp;

#[cfg(feature = "local")]
#[doc(inline)]
pub use local::LocalDriver;

#[doc(inline)]
pub use memory::MemoryStorage;

#[cfg(feature = "tmp")]
#[doc(inline)]
pub use temp::TempDriver;

#[doc(inline)]
pub use storage_driver::{Driver, Metadata, Persisted, StorageError, StorageErrorKind};

/// Selects and configures a byte store backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "driver")]
pub enum StorageConfig {
    /// Keep everything in process memory.
    Memory,

    /// Keep objects as files below `path`.
    #[cfg(feature = "local")]
    Local {
        /// Root directory for all buckets.
        path: Utf8PathBuf,
    },

    /// Keep objects in a temporary directory removed at shutdown.
    #[cfg(feature = "tmp")]
    Temp,
}

impl StorageConfig {
    /// Construct the configured backend.
    #[tracing::instrument]
    pub fn build(self) -> Result<Storage, StorageError> {
        let client: Storage = match self {
            StorageConfig::Memory => MemoryStorage::new().into(),
            #[cfg(feature = "local")]
            StorageConfig::Local { path } => LocalDriver::new(path).into(),
            #[cfg(feature = "tmp")]
            StorageConfig::Temp => TempDriver::new()
                .map_err(|err| StorageError::io("temp", err))?
                .into(),
        };
        Ok(client)
    }
}

pub(crate) type ArcDriver = Arc<dyn Driver + Send + Sync>;

/// A cloneable handle to a storage driver.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: ArcDriver,
}

impl<D> From<D> for Storage
where
    D: Driver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a driver.
    pub fn new<D: Driver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// The driver name.
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// A handle scoped to a single bucket.
    pub fn bucket<S: Into<String>>(&self, bucket: S) -> StorageBucket {
        StorageBucket {
            driver: self.driver.clone(),
            bucket: bucket.into(),
        }
    }
}

/// A storage handle bound to one bucket.
#[derive(Debug, Clone)]
pub struct StorageBucket {
    /// The bucket name.
    pub bucket: String,
    driver: ArcDriver,
}

impl StorageBucket {
    /// The driver name.
    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    /// Object metadata.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.metadata(&self.bucket, remote).await
    }

    /// Whether an object exists.
    pub async fn exists(&self, remote: &Utf8Path) -> Result<bool, StorageError> {
        self.driver.exists(&self.bucket, remote).await
    }

    /// Download an object into a writer.
    #[tracing::instrument(skip(self, writer), fields(driver=self.driver.name()))]
    pub async fn download<'d, W>(
        &'d self,
        remote: &Utf8Path,
        writer: &mut W,
    ) -> Result<(), StorageError>
    where
        W: io::AsyncWrite + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%remote, "Downloading from: {}/{remote}", self.bucket);
        self.driver.download(&self.bucket, remote, writer).await?;
        Ok(())
    }

    /// Read an object fully into memory.
    pub async fn read(&self, remote: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        let mut data = Vec::new();
        self.download(remote, &mut data).await?;
        Ok(data)
    }

    /// Write an object, replacing any existing one.
    #[tracing::instrument(skip(self, reader), fields(driver=self.driver.name(), bucket=%self.bucket))]
    pub async fn upload<'d, R>(
        &'d self,
        remote: &Utf8Path,
        reader: &mut R,
    ) -> Result<(), StorageError>
    where
        R: io::AsyncBufRead + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%remote, "Uploading to: {}/{remote}", self.bucket);
        self.driver.upload(&self.bucket, remote, reader).await?;
        Ok(())
    }

    /// Append to an object, creating it when missing.
    #[tracing::instrument(skip(self, reader), fields(driver=self.driver.name(), bucket=%self.bucket))]
    pub async fn append<'d, R>(&'d self, remote: &Utf8Path, reader: &mut R) -> Result<u64, StorageError>
    where
        R: io::AsyncBufRead + Unpin + Send + Sync + 'd,
    {
        self.driver.append(&self.bucket, remote, reader).await
    }

    /// Shorten an object to its first `size` bytes.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=%self.bucket))]
    pub async fn truncate(&self, remote: &Utf8Path, size: u64) -> Result<(), StorageError> {
        self.driver.truncate(&self.bucket, remote, size).await
    }

    /// Move `from` to `to` unless `to` is already occupied.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=%self.bucket))]
    pub async fn persist(&self, from: &Utf8Path, to: &Utf8Path) -> Result<Persisted, StorageError> {
        self.driver.persist(&self.bucket, from, to).await
    }

    /// List objects, optionally below a prefix.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=%self.bucket))]
    pub async fn list(&self, prefix: Option<&Utf8Path>) -> Result<Vec<String>, StorageError> {
        self.driver.list(&self.bucket, prefix).await
    }

    /// Delete an object.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=%self.bucket))]
    pub async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(&self.bucket, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_memory_config() {
        let config: StorageConfig = serde_json::from_str(r#"{"driver":"memory"}"#).unwrap();
        assert!(matches!(config, StorageConfig::Memory));
    }

    #[cfg(feature = "local")]
    #[test]
    fn parse_local_config() {
        let config: StorageConfig =
            serde_json::from_str(r#"{"driver":"local","path":"/srv/registry"}"#).unwrap();
        match config {
            StorageConfig::Local { path } => assert_eq!(path, "/srv/registry"),
            other => panic!("unexpected config: {other:?}"),
        }
    }

    #[tokio::test]
    async fn bucket_handle_scopes_operations() {
        let storage = StorageConfig::Memory.build().unwrap();
        let bucket = storage.bucket("registry");

        let mut data: &[u8] = b"layer";
        bucket
            .upload(Utf8Path::new("staging/1"), &mut data)
            .await
            .unwrap();
        let outcome = bucket
            .persist(Utf8Path::new("staging/1"), Utf8Path::new("artifact/ab/cd"))
            .await
            .unwrap();
        assert_eq!(outcome, Persisted::Created);
        assert_eq!(bucket.read(Utf8Path::new("artifact/ab/cd")).await.unwrap(), b"layer");
        assert_eq!(storage.name(), "memory");
    }
}
