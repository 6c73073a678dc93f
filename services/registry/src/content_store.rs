//! Content-addressed artifact storage.

use std::sync::Arc;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use storage::{Persisted, StorageBucket};

use crate::content::{Artifact, ArtifactId, ContentArtifact, ContentId};
use crate::db::Database;
use crate::digest::{Digest, DigestSet};
use crate::error::{RegistryError, RegistryResult};

/// Stores each distinct byte sequence once, keyed by its sha256 digest.
///
/// Bytes are staged under a unique key and then promoted to
/// `artifact/<hex[0..2]>/<hex[2..]>`. Promotion keeps whichever copy landed
/// first, so concurrent writers of the same bytes end up sharing one object
/// and one [`Artifact`] row.
#[derive(Debug, Clone)]
pub struct ContentStore {
    bucket: StorageBucket,
    db: Arc<dyn Database>,
}

impl ContentStore {
    /// Store artifacts in `bucket` and record them in `db`.
    pub fn new(bucket: StorageBucket, db: Arc<dyn Database>) -> Self {
        Self { bucket, db }
    }

    /// The byte store handle.
    pub fn bucket(&self) -> &StorageBucket {
        &self.bucket
    }

    /// Store `data`, returning the existing artifact when the bytes are already known.
    #[tracing::instrument(skip_all, fields(size = data.len()))]
    pub async fn put(&self, data: Bytes) -> RegistryResult<Artifact> {
        let digests = DigestSet::of(&data);
        let staged = Utf8PathBuf::from(format!("staging/{}", uuid::Uuid::new_v4()));

        let mut reader: &[u8] = &data;
        self.bucket.upload(&staged, &mut reader).await?;
        self.adopt(&staged, digests, data.len() as u64).await
    }

    /// Promote bytes already written to `staged` into the artifact store.
    ///
    /// The staged object is consumed either way. A `staged` object that is
    /// already gone is accepted when the artifact bytes are in place, so a
    /// caller that failed after promotion can adopt again.
    #[tracing::instrument(skip(self, digests), fields(digest = %digests.sha256))]
    pub async fn adopt(
        &self,
        staged: &Utf8Path,
        digests: DigestSet,
        size: u64,
    ) -> RegistryResult<Artifact> {
        let path = digests.sha256.artifact_path();
        let persisted = match self.bucket.persist(staged, &path).await {
            Ok(persisted) => persisted,
            Err(error) if error.is_not_found() && self.bucket.exists(&path).await? => {
                tracing::debug!(%staged, "staged bytes were already promoted");
                Persisted::Existing
            }
            Err(error) => return Err(error.into()),
        };
        match persisted {
            Persisted::Created => tracing::trace!(%path, "stored new artifact"),
            Persisted::Existing => tracing::debug!(%path, "artifact bytes already stored"),
        }

        let digest = digests.sha256.clone();
        let artifact = Artifact {
            id: ArtifactId::new(),
            digests,
            size,
            path,
            created: Utc::now(),
        };

        match self.db.insert_artifact(artifact).await {
            Ok(artifact) => Ok(artifact),
            Err(error) if error.is_duplicate() => {
                tracing::debug!("reusing existing artifact row");
                Ok(self.db.artifact_by_sha256(&digest).await?)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// The artifact row for `digest`.
    pub async fn artifact(&self, digest: &Digest) -> RegistryResult<Artifact> {
        self.db
            .artifact_by_sha256(digest)
            .await
            .map_err(|error| match error {
                error if error.is_not_found() => RegistryError::BlobNotFound(digest.to_string()),
                error => error.into(),
            })
    }

    /// The bytes stored for `digest`.
    #[tracing::instrument(skip(self), fields(%digest))]
    pub async fn get(&self, digest: &Digest) -> RegistryResult<Bytes> {
        let artifact = self.artifact(digest).await?;
        let data = self
            .bucket
            .read(&artifact.path)
            .await
            .map_err(|error| match error {
                error if error.is_not_found() => RegistryError::BlobNotFound(digest.to_string()),
                error => error.into(),
            })?;
        Ok(Bytes::from(data))
    }

    /// Record that `content` is backed by `artifact`. Existing links are kept.
    pub async fn link(&self, content: ContentId, artifact: &Artifact) -> RegistryResult<()> {
        let link = ContentArtifact {
            content,
            artifact: artifact.id,
            relative_path: artifact.digest().to_string(),
        };
        match self.db.insert_content_artifact(link).await {
            Ok(()) => Ok(()),
            Err(error) if error.is_duplicate() => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use storage::MemoryStorage;

    use super::*;
    use crate::db::MemoryDatabase;

    fn store() -> ContentStore {
        let storage = storage::Storage::new(MemoryStorage::with_buckets(&["test"]));
        ContentStore::new(storage.bucket("test"), Arc::new(MemoryDatabase::new()))
    }

    #[tokio::test]
    async fn duplicate_puts_share_one_copy() {
        let store = store();
        let data = Bytes::from_static(b"a layer of bytes");

        let first = store.put(data.clone()).await.unwrap();
        let second = store.put(data.clone()).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.size, data.len() as u64);

        let objects = store.bucket().list(None).await.unwrap();
        assert_eq!(objects, vec![first.path.to_string()]);
        assert_eq!(store.get(first.digest()).await.unwrap(), data);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_puts_converge() {
        let store = store();
        let data = Bytes::from_static(b"contended bytes");

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let data = data.clone();
                tokio::spawn(async move { store.put(data).await.unwrap() })
            })
            .collect();

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.bucket().list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn adopt_again_after_promotion() {
        let store = store();
        let data = b"promoted once";
        let staged = Utf8Path::new("uploads/retry");
        let mut reader: &[u8] = data;
        store.bucket().upload(staged, &mut reader).await.unwrap();

        let first = store
            .adopt(staged, DigestSet::of(data), data.len() as u64)
            .await
            .unwrap();
        assert!(!store.bucket().exists(staged).await.unwrap());

        let second = store
            .adopt(staged, DigestSet::of(data), data.len() as u64)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);

        let err = store
            .adopt(
                Utf8Path::new("uploads/never-written"),
                DigestSet::of(b"other"),
                5,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Storage(_)));
    }

    #[tokio::test]
    async fn missing_digest_is_blob_not_found() {
        let store = store();
        let err = store.get(&Digest::of(b"nothing")).await.unwrap_err();
        assert!(matches!(err, RegistryError::BlobNotFound(_)));
    }
}
