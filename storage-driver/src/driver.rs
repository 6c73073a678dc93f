use std::{fmt, ops::Deref, sync::Arc};

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use tokio::io;

use crate::error::{StorageError, StorageErrorKind};

/// A reader stream for object contents.
pub type Reader<'r> = dyn io::AsyncBufRead + Unpin + Send + Sync + 'r;

/// A writer stream for object contents.
pub type Writer<'w> = dyn io::AsyncWrite + Unpin + Send + Sync + 'w;

/// Object metadata, which will be generically provided by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the object in bytes.
    pub size: u64,

    /// The creation timestamp of the object.
    pub created: DateTime<Utc>,
}

/// The outcome of [`Driver::persist`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persisted {
    /// The source object was moved into place.
    Created,

    /// An object already occupied the destination. The source object was
    /// discarded and the existing destination was left untouched.
    Existing,
}

/// A storage driver, which provides the ability to interact with a byte store.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug {
    /// The name of the driver.
    fn name(&self) -> &'static str;

    /// Get the metadata for an object, by path.
    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError>;

    /// Check whether an object exists.
    async fn exists(&self, bucket: &str, remote: &Utf8Path) -> Result<bool, StorageError> {
        match self.metadata(bucket, remote).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == StorageErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Write an object, replacing anything stored at the same path.
    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError>;

    /// Append the reader's contents to an object, creating it if needed.
    ///
    /// Returns the number of bytes appended.
    async fn append(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError>;

    /// Shorten an object to its first `size` bytes.
    ///
    /// Used to roll back a failed [`Driver::append`].
    async fn truncate(&self, bucket: &str, remote: &Utf8Path, size: u64)
    -> Result<(), StorageError>;

    /// Move the object at `from` to `to`, unless `to` already exists.
    ///
    /// The first object to arrive at `to` wins: when the destination is
    /// occupied the source is deleted and [`Persisted::Existing`] is returned.
    async fn persist(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<Persisted, StorageError>;

    /// Download an object from storage, into a writer stream.
    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError>;

    /// Delete an object from the storage, by path.
    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError>;

    /// List the objects in a bucket, optionally filtered by a prefix.
    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError>;
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.deref().metadata(bucket, remote).await
    }

    async fn exists(&self, bucket: &str, remote: &Utf8Path) -> Result<bool, StorageError> {
        self.deref().exists(bucket, remote).await
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        self.deref().upload(bucket, remote, reader).await
    }

    async fn append(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        self.deref().append(bucket, remote, reader).await
    }

    async fn truncate(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        size: u64,
    ) -> Result<(), StorageError> {
        self.deref().truncate(bucket, remote, size).await
    }

    async fn persist(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<Persisted, StorageError> {
        self.deref().persist(bucket, from, to).await
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        self.deref().download(bucket, remote, writer).await
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.deref().delete(bucket, remote).await
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        self.deref().list(bucket, prefix).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_obj_safe!(Driver);
}
