//! Chunked blob uploads.
//!
//! An upload starts empty, receives contiguous chunks, and is finalized into
//! a [`Blob`] once the client asserts the digest of the whole stream. Bytes
//! accumulate in the byte store at `uploads/<id>`; digests are computed
//! incrementally as chunks arrive.

use std::sync::Arc;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use storage::StorageError;

use crate::content::{Blob, ContentId, Repository, RepositoryId, UploadId};
use crate::content_store::ContentStore;
use crate::db::Database;
use crate::digest::{Digest, Hashers, media_type};
use crate::error::{RegistryError, RegistryResult};
use crate::reservation::{Reservations, Resource};
use crate::version::Versions;

/// An in-progress blob upload.
#[derive(Debug, Clone)]
pub struct Upload {
    /// Session identifier, also the `Docker-Upload-UUID`.
    pub id: UploadId,
    /// Repository the upload was started in.
    pub repository: RepositoryId,
    /// Bytes received so far.
    pub offset: u64,
    /// Running digests over the received bytes.
    pub hashers: Hashers,
    /// When the session was opened.
    pub created: DateTime<Utc>,
}

impl Upload {
    fn new(repository: RepositoryId) -> Self {
        Self {
            id: UploadId::new(),
            repository,
            offset: 0,
            hashers: Hashers::default(),
            created: Utc::now(),
        }
    }

    /// Byte store key of the partial stream.
    pub fn path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("uploads/{}", self.id))
    }

    /// Value for the `Range` header.
    pub fn range(&self) -> String {
        format!("0-{}", self.offset)
    }
}

/// Drives uploads from creation to a published blob.
#[derive(Debug, Clone)]
pub struct UploadSessions {
    db: Arc<dyn Database>,
    store: ContentStore,
    versions: Versions,
    reservations: Reservations,
}

impl UploadSessions {
    /// Upload sessions backed by `store`, publishing through `versions`.
    pub fn new(
        db: Arc<dyn Database>,
        store: ContentStore,
        versions: Versions,
        reservations: Reservations,
    ) -> Self {
        Self {
            db,
            store,
            versions,
            reservations,
        }
    }

    async fn fetch(&self, repository: &Repository, id: UploadId) -> RegistryResult<Upload> {
        let upload = self.db.upload(id).await?;
        if upload.repository != repository.id {
            return Err(RegistryError::UploadNotFound(id.to_string()));
        }
        Ok(upload)
    }

    /// Begin a new, empty upload.
    #[tracing::instrument(skip_all, fields(repository = %repository.name))]
    pub async fn start(&self, repository: &Repository) -> RegistryResult<Upload> {
        let upload = Upload::new(repository.id);
        let mut empty: &[u8] = &[];
        self.store.bucket().upload(&upload.path(), &mut empty).await?;

        let upload = self.db.insert_upload(upload).await?;
        tracing::debug!(upload = %upload.id, "started upload");
        Ok(upload)
    }

    /// Current progress of an upload.
    pub async fn status(&self, repository: &Repository, id: UploadId) -> RegistryResult<Upload> {
        self.fetch(repository, id).await
    }

    /// Append `chunk`, which the client says begins at byte `start`.
    ///
    /// Chunks must be contiguous: a `start` other than the current offset is
    /// rejected and leaves the upload untouched. If the write or the offset
    /// update fails, the stored bytes are cut back to `start`.
    #[tracing::instrument(skip(self, repository, chunk), fields(repository = %repository.name, %id, size = chunk.len()))]
    pub async fn append(
        &self,
        repository: &Repository,
        id: UploadId,
        chunk: Bytes,
        start: u64,
    ) -> RegistryResult<Upload> {
        let _reservation = self.reservations.acquire(Resource::Upload(id)).await;
        let mut upload = self.fetch(repository, id).await?;

        if upload.offset != start {
            return Err(RegistryError::OffsetMismatch {
                expected: upload.offset,
                actual: start,
            });
        }

        let path = upload.path();
        let mut reader: &[u8] = &chunk;
        let written = match self.store.bucket().append(&path, &mut reader).await {
            Ok(written) if written == chunk.len() as u64 => written,
            Ok(written) => {
                self.rollback(&path, start).await;
                let short = std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    format!("appended {written} of {} bytes", chunk.len()),
                );
                return Err(StorageError::io(self.store.bucket().driver_name(), short).into());
            }
            Err(error) => {
                self.rollback(&path, start).await;
                return Err(error.into());
            }
        };

        upload.hashers.update(&chunk);
        upload.offset += written;
        match self.db.update_upload(upload, start).await {
            Ok(upload) => {
                tracing::trace!(offset = upload.offset, "appended chunk");
                Ok(upload)
            }
            Err(error) => {
                self.rollback(&path, start).await;
                Err(error.into())
            }
        }
    }

    /// Cut a partial stream back to `offset` after a failed append.
    async fn rollback(&self, path: &Utf8Path, offset: u64) {
        if let Err(error) = self.store.bucket().truncate(path, offset).await {
            tracing::error!(%path, offset, %error, "failed to roll back upload bytes");
        }
    }

    /// Turn a complete upload into a blob, if `digest` matches what was received.
    ///
    /// On a mismatch nothing is created and the upload stays open. The upload
    /// row is removed only once the blob is published, so a finalize that
    /// fails part way can be retried.
    #[tracing::instrument(skip(self, repository), fields(repository = %repository.name, %id, %digest))]
    pub async fn finalize(
        &self,
        repository: &Repository,
        id: UploadId,
        digest: &Digest,
    ) -> RegistryResult<Blob> {
        let _reservation = self.reservations.acquire(Resource::Upload(id)).await;
        let upload = self.fetch(repository, id).await?;

        let computed = upload.hashers.primary();
        if computed != *digest {
            return Err(RegistryError::DigestMismatch {
                expected: digest.to_string(),
                actual: computed.to_string(),
            });
        }

        let path = upload.path();
        let artifact = self
            .store
            .adopt(&path, upload.hashers.finish(), upload.offset)
            .await?;

        let blob = Blob {
            id: ContentId::new(),
            digest: digest.clone(),
            media_type: media_type::REGULAR_BLOB.to_owned(),
        };
        let blob = match self.db.insert_blob(blob).await {
            Ok(blob) => blob,
            Err(error) if error.is_duplicate() => self.db.blob_by_digest(digest).await?,
            Err(error) => return Err(error.into()),
        };
        self.store.link(blob.id, &artifact).await?;

        let mut version = self.versions.new_version(repository).await?;
        version.add_content([blob.id]);
        version.commit().await?;

        self.db.delete_upload(id).await?;
        tracing::debug!("upload finalized");
        Ok(blob)
    }

    /// Upload a whole blob in one request.
    pub async fn monolithic(
        &self,
        repository: &Repository,
        id: UploadId,
        body: Bytes,
        digest: &Digest,
    ) -> RegistryResult<Blob> {
        self.append(repository, id, body, 0).await?;
        self.finalize(repository, id, digest).await
    }

    /// Cancel an upload, discarding received bytes.
    #[tracing::instrument(skip(self, repository), fields(repository = %repository.name, %id))]
    pub async fn abandon(&self, repository: &Repository, id: UploadId) -> RegistryResult<()> {
        let _reservation = self.reservations.acquire(Resource::Upload(id)).await;
        let upload = self.fetch(repository, id).await?;
        self.store.bucket().delete(&upload.path()).await?;
        self.db.delete_upload(id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use storage::MemoryStorage;

    use super::*;
    use crate::db::MemoryDatabase;
    use crate::db::testing::FlakyDatabase;

    struct Harness {
        db: Arc<dyn Database>,
        store: ContentStore,
        uploads: UploadSessions,
        repo: Repository,
    }

    async fn harness() -> Harness {
        harness_with(Arc::new(MemoryDatabase::new())).await
    }

    async fn harness_with(db: Arc<dyn Database>) -> Harness {
        let storage = storage::Storage::new(MemoryStorage::with_buckets(&["test"]));
        let store = ContentStore::new(storage.bucket("test"), db.clone());
        let reservations = Reservations::new();
        let versions = Versions::new(db.clone(), reservations.clone());
        let uploads = UploadSessions::new(db.clone(), store.clone(), versions, reservations);
        let repo = db
            .insert_repository(Repository {
                id: RepositoryId::new(),
                name: "app".into(),
                created: Utc::now(),
            })
            .await
            .unwrap();
        Harness {
            db,
            store,
            uploads,
            repo,
        }
    }

    #[tokio::test]
    async fn chunks_finalize_to_concatenation() {
        let h = harness().await;
        let upload = h.uploads.start(&h.repo).await.unwrap();

        let chunks: [&[u8]; 3] = [b"first-", b"second-", b"third"];
        let mut offset = 0;
        for chunk in chunks {
            let updated = h
                .uploads
                .append(&h.repo, upload.id, Bytes::from_static(chunk), offset)
                .await
                .unwrap();
            offset += chunk.len() as u64;
            assert_eq!(updated.offset, offset);
        }

        let digest = Digest::of(b"first-second-third");
        let blob = h.uploads.finalize(&h.repo, upload.id, &digest).await.unwrap();
        assert_eq!(blob.digest, digest);
        assert_eq!(blob.media_type, media_type::REGULAR_BLOB);

        assert_eq!(
            h.store.get(&digest).await.unwrap(),
            Bytes::from_static(b"first-second-third")
        );
        let latest = h.db.latest_version(h.repo.id).await.unwrap();
        assert!(latest.contains(&blob.id));
        assert!(h.db.upload(upload.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn out_of_order_chunk_is_rejected() {
        let h = harness().await;
        let upload = h.uploads.start(&h.repo).await.unwrap();
        h.uploads
            .append(&h.repo, upload.id, Bytes::from_static(b"0123456789"), 0)
            .await
            .unwrap();

        let err = h
            .uploads
            .append(&h.repo, upload.id, Bytes::from_static(b"xyz"), 4)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::OffsetMismatch {
                expected: 10,
                actual: 4
            }
        ));

        let status = h.uploads.status(&h.repo, upload.id).await.unwrap();
        assert_eq!(status.offset, 10);
        assert_eq!(
            h.store.bucket().read(&upload.path()).await.unwrap(),
            b"0123456789"
        );
    }

    #[tokio::test]
    async fn digest_mismatch_creates_nothing() {
        let h = harness().await;
        let upload = h.uploads.start(&h.repo).await.unwrap();
        h.uploads
            .append(&h.repo, upload.id, Bytes::from_static(b"payload"), 0)
            .await
            .unwrap();

        let wrong = Digest::of(b"something else");
        let err = h
            .uploads
            .finalize(&h.repo, upload.id, &wrong)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DigestMismatch { .. }));

        assert!(h.db.blob_by_digest(&wrong).await.is_err());
        assert!(h.db.artifact_by_sha256(&Digest::of(b"payload")).await.is_err());
        assert_eq!(h.db.latest_version(h.repo.id).await.unwrap().number, 0);
        assert_eq!(
            h.uploads.status(&h.repo, upload.id).await.unwrap().offset,
            7
        );
    }

    #[tokio::test]
    async fn repeated_uploads_reuse_blob() {
        let h = harness().await;
        let digest = Digest::of(b"same bytes");

        let first = h.uploads.start(&h.repo).await.unwrap();
        let a = h
            .uploads
            .monolithic(&h.repo, first.id, Bytes::from_static(b"same bytes"), &digest)
            .await
            .unwrap();

        let second = h.uploads.start(&h.repo).await.unwrap();
        let b = h
            .uploads
            .monolithic(&h.repo, second.id, Bytes::from_static(b"same bytes"), &digest)
            .await
            .unwrap();

        assert_eq!(a.id, b.id);
        let artifacts = h.store.bucket().list(Some(camino::Utf8Path::new("artifact"))).await.unwrap();
        assert_eq!(artifacts.len(), 1);
        // The second push changed nothing, so no extra version.
        assert_eq!(h.db.latest_version(h.repo.id).await.unwrap().number, 1);
    }

    #[tokio::test]
    async fn finalize_retries_after_failed_publish() {
        let flaky = Arc::new(FlakyDatabase::new());
        let h = harness_with(flaky.clone()).await;
        let upload = h.uploads.start(&h.repo).await.unwrap();
        h.uploads
            .append(&h.repo, upload.id, Bytes::from_static(b"layer bytes"), 0)
            .await
            .unwrap();
        let digest = Digest::of(b"layer bytes");

        flaky.fail_next_publish();
        let err = h
            .uploads
            .finalize(&h.repo, upload.id, &digest)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_)));
        assert_eq!(h.db.upload(upload.id).await.unwrap().offset, 11);
        assert_eq!(h.db.latest_version(h.repo.id).await.unwrap().number, 0);

        let blob = h.uploads.finalize(&h.repo, upload.id, &digest).await.unwrap();
        let latest = h.db.latest_version(h.repo.id).await.unwrap();
        assert_eq!(latest.number, 1);
        assert!(latest.contains(&blob.id));
        assert_eq!(
            h.store.get(&digest).await.unwrap(),
            Bytes::from_static(b"layer bytes")
        );
        assert!(h.db.upload(upload.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn failed_offset_update_rolls_back_bytes() {
        let flaky = Arc::new(FlakyDatabase::new());
        let h = harness_with(flaky.clone()).await;
        let upload = h.uploads.start(&h.repo).await.unwrap();
        h.uploads
            .append(&h.repo, upload.id, Bytes::from_static(b"head-"), 0)
            .await
            .unwrap();

        flaky.fail_next_update_upload();
        let err = h
            .uploads
            .append(&h.repo, upload.id, Bytes::from_static(b"tail"), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_)));
        assert_eq!(h.uploads.status(&h.repo, upload.id).await.unwrap().offset, 5);
        assert_eq!(h.store.bucket().read(&upload.path()).await.unwrap(), b"head-");

        h.uploads
            .append(&h.repo, upload.id, Bytes::from_static(b"tail"), 5)
            .await
            .unwrap();
        let digest = Digest::of(b"head-tail");
        h.uploads.finalize(&h.repo, upload.id, &digest).await.unwrap();
        assert_eq!(
            h.store.get(&digest).await.unwrap(),
            Bytes::from_static(b"head-tail")
        );
    }

    #[tokio::test]
    async fn abandoned_upload_is_gone() {
        let h = harness().await;
        let upload = h.uploads.start(&h.repo).await.unwrap();
        h.uploads
            .append(&h.repo, upload.id, Bytes::from_static(b"partial"), 0)
            .await
            .unwrap();

        h.uploads.abandon(&h.repo, upload.id).await.unwrap();
        assert!(matches!(
            h.uploads.status(&h.repo, upload.id).await,
            Err(RegistryError::UploadNotFound(_))
        ));
        assert!(!h.store.bucket().exists(&upload.path()).await.unwrap());
    }
}
