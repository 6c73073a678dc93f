//! Metadata store interface.
//!
//! Every method is a single atomic operation. Inserts enforce the natural
//! unique keys of each entity and report collisions as
//! [`DbError::DuplicateKey`]; callers that race to create the same identity
//! recover by fetching the existing row.

use std::collections::BTreeSet;
use std::fmt;

use crate::content::{
    Artifact, Blob, BlobManifest, Content, ContentArtifact, ContentId, Manifest, Repository,
    RepositoryId, RepositoryVersion, Tag, UploadId,
};
use crate::digest::Digest;
use crate::upload::Upload;

mod memory;

pub use memory::MemoryDatabase;

/// Result alias for metadata store operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors reported by a metadata store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DbError {
    /// A row with the same unique key already exists.
    #[error("duplicate {entity}: {key}")]
    DuplicateKey {
        /// Entity name.
        entity: &'static str,
        /// Offending key.
        key: String,
    },

    /// No row matches the key.
    #[error("{entity} not found: {key}")]
    NotFound {
        /// Entity name.
        entity: &'static str,
        /// Requested key.
        key: String,
    },

    /// A compare-and-set precondition failed.
    #[error("conflicting update to {entity}: {key}")]
    Conflict {
        /// Entity name.
        entity: &'static str,
        /// Contested key.
        key: String,
    },
}

impl DbError {
    pub(crate) fn duplicate(entity: &'static str, key: impl fmt::Display) -> Self {
        DbError::DuplicateKey {
            entity,
            key: key.to_string(),
        }
    }

    pub(crate) fn not_found(entity: &'static str, key: impl fmt::Display) -> Self {
        DbError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub(crate) fn conflict(entity: &'static str, key: impl fmt::Display) -> Self {
        DbError::Conflict {
            entity,
            key: key.to_string(),
        }
    }

    /// Whether this is a unique key collision.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, DbError::DuplicateKey { .. })
    }

    /// Whether the row was missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound { .. })
    }
}

/// Transactional metadata store for registry content.
#[async_trait::async_trait]
pub trait Database: fmt::Debug + Send + Sync {
    /// Insert an artifact, unique on its sha256 digest.
    async fn insert_artifact(&self, artifact: Artifact) -> DbResult<Artifact>;

    /// Look up an artifact by sha256 digest.
    async fn artifact_by_sha256(&self, digest: &Digest) -> DbResult<Artifact>;

    /// Link content to an artifact, unique on `(content, relative_path)`.
    async fn insert_content_artifact(&self, link: ContentArtifact) -> DbResult<()>;

    /// The artifact link for a content unit.
    async fn content_artifact(&self, content: ContentId) -> DbResult<ContentArtifact>;

    /// Insert a blob, unique on digest.
    async fn insert_blob(&self, blob: Blob) -> DbResult<Blob>;

    /// Look up a blob by digest.
    async fn blob_by_digest(&self, digest: &Digest) -> DbResult<Blob>;

    /// All blobs whose digest is listed. Missing digests are skipped.
    async fn blobs_by_digests(&self, digests: &[Digest]) -> DbResult<Vec<Blob>>;

    /// Insert a manifest, unique on digest.
    async fn insert_manifest(&self, manifest: Manifest) -> DbResult<Manifest>;

    /// Look up a manifest by digest.
    async fn manifest_by_digest(&self, digest: &Digest) -> DbResult<Manifest>;

    /// Link manifests to blobs, skipping links that already exist.
    async fn insert_blob_manifests(&self, links: &[BlobManifest]) -> DbResult<()>;

    /// Blobs linked to a manifest.
    async fn manifest_blobs(&self, manifest: ContentId) -> DbResult<Vec<ContentId>>;

    /// Insert a tag, unique on `(name, tagged_manifest)`.
    async fn insert_tag(&self, tag: Tag) -> DbResult<Tag>;

    /// Look up a tag by its unique key.
    async fn tag_by_name_and_manifest(&self, name: &str, manifest: ContentId) -> DbResult<Tag>;

    /// Materialize the listed content units. Unknown ids are skipped.
    async fn content(&self, ids: &BTreeSet<ContentId>) -> DbResult<Vec<Content>>;

    /// Insert a repository, unique on name, together with its empty version 0.
    async fn insert_repository(&self, repository: Repository) -> DbResult<Repository>;

    /// Look up a repository by name.
    async fn repository_by_name(&self, name: &str) -> DbResult<Repository>;

    /// All repositories, ordered by name.
    async fn repositories(&self) -> DbResult<Vec<Repository>>;

    /// The highest published version of a repository.
    async fn latest_version(&self, repository: RepositoryId) -> DbResult<RepositoryVersion>;

    /// A specific published version.
    async fn version(&self, repository: RepositoryId, number: u64)
    -> DbResult<RepositoryVersion>;

    /// Every published version, oldest first.
    async fn versions(&self, repository: RepositoryId) -> DbResult<Vec<RepositoryVersion>>;

    /// Publish a version whose number must be exactly one past the latest.
    ///
    /// Any other number is a [`DbError::Conflict`].
    async fn publish_version(&self, version: RepositoryVersion) -> DbResult<RepositoryVersion>;

    /// Insert a new upload session.
    async fn insert_upload(&self, upload: Upload) -> DbResult<Upload>;

    /// Look up an upload session.
    async fn upload(&self, id: UploadId) -> DbResult<Upload>;

    /// Replace an upload whose stored offset is still `expected_offset`.
    async fn update_upload(&self, upload: Upload, expected_offset: u64) -> DbResult<Upload>;

    /// Delete an upload session. Missing uploads are ignored.
    async fn delete_upload(&self, id: UploadId) -> DbResult<()>;
}
