use std::io;

use camino::Utf8Path;
use tempfile::TempDir;

use crate::local::LocalDriver;
use storage_driver::{Driver, Metadata, Persisted, Reader, StorageError, Writer};

/// A storage driver that stores files in a temporary directory.
///
/// The directory is removed when the driver is dropped.
#[derive(Debug)]
pub struct TempDriver {
    #[allow(unused)]
    dir: TempDir,
    driver: LocalDriver,
}

impl TempDriver {
    /// Create a new `TempDriver` instance, storing files in a temporary directory.
    pub fn new() -> io::Result<Self> {
        let tmp = TempDir::new()?;
        let root = Utf8Path::from_path(tmp.path())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non utf-8 temp path"))?
            .to_owned();

        Ok(Self {
            dir: tmp,
            driver: LocalDriver::new(root),
        })
    }
}

#[async_trait::async_trait]
impl Driver for TempDriver {
    fn name(&self) -> &'static str {
        "temp"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.metadata(bucket, remote).await
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        self.driver.upload(bucket, remote, local).await
    }

    async fn append(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        self.driver.append(bucket, remote, local).await
    }

    async fn truncate(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        size: u64,
    ) -> Result<(), StorageError> {
        self.driver.truncate(bucket, remote, size).await
    }

    async fn persist(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<Persisted, StorageError> {
        self.driver.persist(bucket, from, to).await
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        self.driver.download(bucket, remote, local).await
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(bucket, remote).await
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        self.driver.list(bucket, prefix).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_roundtrip_through_temp_dir() {
        let driver = TempDriver::new().unwrap();

        let mut chunk: &[u8] = b"abc";
        driver
            .append("bucket", Utf8Path::new("uploads/u1"), &mut chunk)
            .await
            .unwrap();
        let mut chunk: &[u8] = b"def";
        driver
            .append("bucket", Utf8Path::new("uploads/u1"), &mut chunk)
            .await
            .unwrap();

        let outcome = driver
            .persist(
                "bucket",
                Utf8Path::new("uploads/u1"),
                Utf8Path::new("artifact/ab/cdef"),
            )
            .await
            .unwrap();
        assert_eq!(outcome, Persisted::Created);

        let mut out = Vec::new();
        driver
            .download("bucket", Utf8Path::new("artifact/ab/cdef"), &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"abcdef");

        let listed = driver.list("bucket", None).await.unwrap();
        assert_eq!(listed, vec!["artifact/ab/cdef".to_string()]);
    }

    #[tokio::test]
    async fn local_truncate_rolls_back_append() {
        let driver = TempDriver::new().unwrap();

        let mut chunk: &[u8] = b"keep-discard";
        driver
            .append("bucket", Utf8Path::new("uploads/u2"), &mut chunk)
            .await
            .unwrap();
        driver
            .truncate("bucket", Utf8Path::new("uploads/u2"), 4)
            .await
            .unwrap();

        let mut out = Vec::new();
        driver
            .download("bucket", Utf8Path::new("uploads/u2"), &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"keep");
    }

    #[tokio::test]
    async fn local_persist_keeps_existing() {
        let driver = TempDriver::new().unwrap();

        let mut first: &[u8] = b"first";
        driver
            .upload("bucket", Utf8Path::new("artifact/x"), &mut first)
            .await
            .unwrap();
        let mut second: &[u8] = b"second";
        driver
            .upload("bucket", Utf8Path::new("staging/y"), &mut second)
            .await
            .unwrap();

        let outcome = driver
            .persist("bucket", Utf8Path::new("staging/y"), Utf8Path::new("artifact/x"))
            .await
            .unwrap();
        assert_eq!(outcome, Persisted::Existing);
        assert!(!driver.exists("bucket", Utf8Path::new("staging/y")).await.unwrap());

        let mut out = Vec::new();
        driver
            .download("bucket", Utf8Path::new("artifact/x"), &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"first");
    }
}
