use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::Mutex;

use super::{Database, DbError, DbResult};
use crate::content::{
    Artifact, Blob, BlobManifest, Content, ContentArtifact, ContentId, Manifest, Repository,
    RepositoryId, RepositoryVersion, Tag, UploadId,
};
use crate::digest::Digest;
use crate::upload::Upload;

#[derive(Debug, Default)]
struct Tables {
    artifacts: HashMap<Digest, Artifact>,
    content_artifacts: HashMap<(ContentId, String), ContentArtifact>,
    blobs: HashMap<Digest, ContentId>,
    manifests: HashMap<Digest, ContentId>,
    tags: HashMap<(String, ContentId), ContentId>,
    units: HashMap<ContentId, Content>,
    blob_manifests: BTreeSet<BlobManifest>,
    repositories: BTreeMap<String, Repository>,
    versions: HashMap<RepositoryId, Vec<RepositoryVersion>>,
    uploads: HashMap<UploadId, Upload>,
}

impl Tables {
    fn unit(&self, id: &ContentId) -> Option<&Content> {
        self.units.get(id)
    }

    fn history(&self, repository: RepositoryId) -> DbResult<&Vec<RepositoryVersion>> {
        self.versions
            .get(&repository)
            .ok_or_else(|| DbError::not_found("repository", repository))
    }
}

/// In-process metadata store.
///
/// Each trait method takes the table lock once, so every operation is atomic
/// with respect to the others.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    tables: Mutex<Tables>,
}

impl MemoryDatabase {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Database for MemoryDatabase {
    async fn insert_artifact(&self, artifact: Artifact) -> DbResult<Artifact> {
        let mut tables = self.tables.lock();
        let digest = artifact.digest().clone();
        if tables.artifacts.contains_key(&digest) {
            return Err(DbError::duplicate("artifact", digest));
        }
        tables.artifacts.insert(digest, artifact.clone());
        Ok(artifact)
    }

    async fn artifact_by_sha256(&self, digest: &Digest) -> DbResult<Artifact> {
        self.tables
            .lock()
            .artifacts
            .get(digest)
            .cloned()
            .ok_or_else(|| DbError::not_found("artifact", digest))
    }

    async fn insert_content_artifact(&self, link: ContentArtifact) -> DbResult<()> {
        let mut tables = self.tables.lock();
        let key = (link.content, link.relative_path.clone());
        if tables.content_artifacts.contains_key(&key) {
            return Err(DbError::duplicate(
                "content artifact",
                format!("{}/{}", link.content, link.relative_path),
            ));
        }
        tables.content_artifacts.insert(key, link);
        Ok(())
    }

    async fn content_artifact(&self, content: ContentId) -> DbResult<ContentArtifact> {
        self.tables
            .lock()
            .content_artifacts
            .values()
            .find(|link| link.content == content)
            .cloned()
            .ok_or_else(|| DbError::not_found("content artifact", content))
    }

    async fn insert_blob(&self, blob: Blob) -> DbResult<Blob> {
        let mut tables = self.tables.lock();
        if tables.blobs.contains_key(&blob.digest) {
            return Err(DbError::duplicate("blob", &blob.digest));
        }
        tables.blobs.insert(blob.digest.clone(), blob.id);
        tables.units.insert(blob.id, blob.clone().into());
        Ok(blob)
    }

    async fn blob_by_digest(&self, digest: &Digest) -> DbResult<Blob> {
        let tables = self.tables.lock();
        tables
            .blobs
            .get(digest)
            .and_then(|id| tables.unit(id))
            .and_then(|unit| match unit {
                Content::Blob(blob) => Some(blob.clone()),
                _ => None,
            })
            .ok_or_else(|| DbError::not_found("blob", digest))
    }

    async fn blobs_by_digests(&self, digests: &[Digest]) -> DbResult<Vec<Blob>> {
        let tables = self.tables.lock();
        Ok(digests
            .iter()
            .filter_map(|digest| tables.blobs.get(digest))
            .filter_map(|id| match tables.unit(id) {
                Some(Content::Blob(blob)) => Some(blob.clone()),
                _ => None,
            })
            .collect())
    }

    async fn insert_manifest(&self, manifest: Manifest) -> DbResult<Manifest> {
        let mut tables = self.tables.lock();
        if tables.manifests.contains_key(&manifest.digest) {
            return Err(DbError::duplicate("manifest", &manifest.digest));
        }
        tables.manifests.insert(manifest.digest.clone(), manifest.id);
        tables.units.insert(manifest.id, manifest.clone().into());
        Ok(manifest)
    }

    async fn manifest_by_digest(&self, digest: &Digest) -> DbResult<Manifest> {
        let tables = self.tables.lock();
        tables
            .manifests
            .get(digest)
            .and_then(|id| tables.unit(id))
            .and_then(Content::as_manifest)
            .cloned()
            .ok_or_else(|| DbError::not_found("manifest", digest))
    }

    async fn insert_blob_manifests(&self, links: &[BlobManifest]) -> DbResult<()> {
        let mut tables = self.tables.lock();
        tables.blob_manifests.extend(links.iter().copied());
        Ok(())
    }

    async fn manifest_blobs(&self, manifest: ContentId) -> DbResult<Vec<ContentId>> {
        Ok(self
            .tables
            .lock()
            .blob_manifests
            .iter()
            .filter(|link| link.manifest == manifest)
            .map(|link| link.blob)
            .collect())
    }

    async fn insert_tag(&self, tag: Tag) -> DbResult<Tag> {
        let mut tables = self.tables.lock();
        let key = (tag.name.clone(), tag.tagged_manifest);
        if tables.tags.contains_key(&key) {
            return Err(DbError::duplicate(
                "tag",
                format!("{}@{}", tag.name, tag.tagged_manifest),
            ));
        }
        tables.tags.insert(key, tag.id);
        tables.units.insert(tag.id, tag.clone().into());
        Ok(tag)
    }

    async fn tag_by_name_and_manifest(&self, name: &str, manifest: ContentId) -> DbResult<Tag> {
        let tables = self.tables.lock();
        tables
            .tags
            .get(&(name.to_owned(), manifest))
            .and_then(|id| tables.unit(id))
            .and_then(Content::as_tag)
            .cloned()
            .ok_or_else(|| DbError::not_found("tag", format!("{name}@{manifest}")))
    }

    async fn content(&self, ids: &BTreeSet<ContentId>) -> DbResult<Vec<Content>> {
        let tables = self.tables.lock();
        Ok(ids
            .iter()
            .filter_map(|id| tables.unit(id).cloned())
            .collect())
    }

    async fn insert_repository(&self, repository: Repository) -> DbResult<Repository> {
        let mut tables = self.tables.lock();
        if tables.repositories.contains_key(&repository.name) {
            return Err(DbError::duplicate("repository", &repository.name));
        }
        tables
            .versions
            .insert(repository.id, vec![RepositoryVersion::initial(repository.id)]);
        tables
            .repositories
            .insert(repository.name.clone(), repository.clone());
        Ok(repository)
    }

    async fn repository_by_name(&self, name: &str) -> DbResult<Repository> {
        self.tables
            .lock()
            .repositories
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::not_found("repository", name))
    }

    async fn repositories(&self) -> DbResult<Vec<Repository>> {
        Ok(self.tables.lock().repositories.values().cloned().collect())
    }

    async fn latest_version(&self, repository: RepositoryId) -> DbResult<RepositoryVersion> {
        let tables = self.tables.lock();
        tables
            .history(repository)?
            .last()
            .cloned()
            .ok_or_else(|| DbError::not_found("repository version", repository))
    }

    async fn version(
        &self,
        repository: RepositoryId,
        number: u64,
    ) -> DbResult<RepositoryVersion> {
        let tables = self.tables.lock();
        tables
            .history(repository)?
            .iter()
            .find(|version| version.number == number)
            .cloned()
            .ok_or_else(|| DbError::not_found("repository version", format!("{repository}/{number}")))
    }

    async fn versions(&self, repository: RepositoryId) -> DbResult<Vec<RepositoryVersion>> {
        Ok(self.tables.lock().history(repository)?.clone())
    }

    async fn publish_version(&self, version: RepositoryVersion) -> DbResult<RepositoryVersion> {
        let mut tables = self.tables.lock();
        let history = tables
            .versions
            .get_mut(&version.repository)
            .ok_or_else(|| DbError::not_found("repository", version.repository))?;

        let next = history.last().map_or(0, |latest| latest.number + 1);
        if version.number != next {
            return Err(DbError::conflict(
                "repository version",
                format!("{}/{}", version.repository, version.number),
            ));
        }
        history.push(version.clone());
        Ok(version)
    }

    async fn insert_upload(&self, upload: Upload) -> DbResult<Upload> {
        let mut tables = self.tables.lock();
        if tables.uploads.contains_key(&upload.id) {
            return Err(DbError::duplicate("upload", upload.id));
        }
        tables.uploads.insert(upload.id, upload.clone());
        Ok(upload)
    }

    async fn upload(&self, id: UploadId) -> DbResult<Upload> {
        self.tables
            .lock()
            .uploads
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::not_found("upload", id))
    }

    async fn update_upload(&self, upload: Upload, expected_offset: u64) -> DbResult<Upload> {
        let mut tables = self.tables.lock();
        let stored = tables
            .uploads
            .get_mut(&upload.id)
            .ok_or_else(|| DbError::not_found("upload", upload.id))?;
        if stored.offset != expected_offset {
            return Err(DbError::conflict("upload", upload.id));
        }
        *stored = upload.clone();
        Ok(upload)
    }

    async fn delete_upload(&self, id: UploadId) -> DbResult<()> {
        self.tables.lock().uploads.remove(&id);
        Ok(())
    }
}
