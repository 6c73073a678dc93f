//! The registry facade tying the engine components together.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::RegistryConfig;
use crate::content::{Manifest, Repository, RepositoryId, RepositoryVersion};
use crate::content_store::ContentStore;
use crate::db::Database;
use crate::digest::{Digest, EMPTY_BLOB_BYTES};
use crate::error::{RegistryError, RegistryResult};
use crate::ingest::ManifestProcessor;
use crate::resolver::{Reference, TagResolver, validate_tag};
use crate::tasks::Dispatcher;
use crate::upload::UploadSessions;
use crate::version::{Removal, Versions};

static NAME_COMPONENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*$")
        .expect("to create a regex from pattern")
});

/// Validate a repository name: `/`-separated lowercase components.
pub fn validate_repository_name(name: &str) -> RegistryResult<()> {
    if !name.is_empty() && name.split('/').all(|part| NAME_COMPONENT_RE.is_match(part)) {
        Ok(())
    } else {
        Err(RegistryError::InvalidRepository(name.to_owned()))
    }
}

/// Size and digest of a blob, for `HEAD` responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    /// The blob digest.
    pub digest: Digest,
    /// Length in bytes.
    pub size: u64,
}

/// The container registry.
///
/// Cheap to clone; every clone shares the same stores.
#[derive(Debug, Clone)]
pub struct Registry {
    config: Arc<RegistryConfig>,
    db: Arc<dyn Database>,
    store: ContentStore,
    versions: Versions,
    uploads: UploadSessions,
    processor: ManifestProcessor,
    resolver: TagResolver,
    dispatcher: Option<Dispatcher>,
}

impl Registry {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        config: RegistryConfig,
        db: Arc<dyn Database>,
        store: ContentStore,
        versions: Versions,
        uploads: UploadSessions,
        processor: ManifestProcessor,
        resolver: TagResolver,
        dispatcher: Option<Dispatcher>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            db,
            store,
            versions,
            uploads,
            processor,
            resolver,
            dispatcher,
        }
    }

    /// Registry settings.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// The content-addressed artifact store.
    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    /// Upload session management.
    pub fn uploads(&self) -> &UploadSessions {
        &self.uploads
    }

    /// Task dispatch, when a task queue was configured.
    pub fn dispatcher(&self) -> RegistryResult<&Dispatcher> {
        self.dispatcher
            .as_ref()
            .ok_or_else(|| RegistryError::TaskQueue("no task queue configured".into()))
    }

    /// Create a new, empty repository.
    #[tracing::instrument(skip(self))]
    pub async fn create_repository(&self, name: &str) -> RegistryResult<Repository> {
        validate_repository_name(name)?;
        let repository = Repository {
            id: RepositoryId::new(),
            name: name.to_owned(),
            created: Utc::now(),
        };
        match self.db.insert_repository(repository).await {
            Ok(repository) => {
                tracing::info!(repository = %repository.name, "created repository");
                Ok(repository)
            }
            Err(error) if error.is_duplicate() => Err(RegistryError::Conflict(format!(
                "repository {name} already exists"
            ))),
            Err(error) => Err(error.into()),
        }
    }

    /// Look up a repository by name.
    pub async fn repository(&self, name: &str) -> RegistryResult<Repository> {
        validate_repository_name(name)?;
        Ok(self.db.repository_by_name(name).await?)
    }

    /// Look up a repository, creating it on first push.
    #[tracing::instrument(skip(self))]
    pub async fn repository_for_push(&self, name: &str) -> RegistryResult<Repository> {
        match self.repository(name).await {
            Ok(repository) => return Ok(repository),
            Err(RegistryError::RepositoryNotFound(_)) => {}
            Err(error) => return Err(error),
        }

        match self.create_repository(name).await {
            Ok(repository) => Ok(repository),
            // Lost a creation race; the winner's row is the repository.
            Err(RegistryError::Conflict(_)) => Ok(self.db.repository_by_name(name).await?),
            Err(error) => Err(error),
        }
    }

    /// Names of all repositories, sorted.
    pub async fn catalog(&self) -> RegistryResult<Vec<String>> {
        let mut names: Vec<String> = self
            .db
            .repositories()
            .await?
            .into_iter()
            .map(|repository| repository.name)
            .collect();
        names.sort();
        Ok(names)
    }

    /// The latest published version of a repository.
    pub async fn latest(&self, name: &str) -> RegistryResult<(Repository, RepositoryVersion)> {
        let repository = self.repository(name).await?;
        let version = self.db.latest_version(repository.id).await?;
        Ok((repository, version))
    }

    /// Published version history, oldest first.
    pub async fn versions(&self, name: &str) -> RegistryResult<Vec<RepositoryVersion>> {
        let repository = self.repository(name).await?;
        Ok(self.db.versions(repository.id).await?)
    }

    /// Tag names in the latest version.
    pub async fn tags(&self, name: &str) -> RegistryResult<Vec<String>> {
        let (_, version) = self.latest(name).await?;
        self.resolver.tags(&version).await
    }

    /// The manifest `reference` names in the latest version.
    pub async fn manifest(&self, name: &str, reference: &Reference) -> RegistryResult<Manifest> {
        let (_, version) = self.latest(name).await?;
        self.resolver.resolve(&version, reference).await
    }

    /// The bytes of a blob in the latest version.
    #[tracing::instrument(skip(self))]
    pub async fn blob(&self, name: &str, digest: &Digest) -> RegistryResult<Bytes> {
        if digest.is_empty_blob() {
            return Ok(Bytes::from_static(&EMPTY_BLOB_BYTES));
        }
        let (_, version) = self.latest(name).await?;
        let blob = self.resolver.blob(&version, digest).await?;
        self.store.get(&blob.digest).await
    }

    /// Digest and size of a blob in the latest version.
    pub async fn blob_artifact(&self, name: &str, digest: &Digest) -> RegistryResult<BlobInfo> {
        if digest.is_empty_blob() {
            return Ok(BlobInfo {
                digest: digest.clone(),
                size: EMPTY_BLOB_BYTES.len() as u64,
            });
        }
        let (_, version) = self.latest(name).await?;
        let blob = self.resolver.blob(&version, digest).await?;
        let artifact = self.store.artifact(&blob.digest).await?;
        Ok(BlobInfo {
            digest: blob.digest,
            size: artifact.size,
        })
    }

    /// Ingest a pushed manifest, creating the repository if needed.
    pub async fn push_manifest(
        &self,
        name: &str,
        reference: &Reference,
        body: Bytes,
        content_type: &str,
    ) -> RegistryResult<Manifest> {
        let repository = self.repository_for_push(name).await?;
        self.processor
            .ingest(&repository, reference, body, content_type)
            .await
    }

    /// Point `tag` at the manifest `digest`, which must be in the latest version.
    #[tracing::instrument(skip(self))]
    pub async fn tag(
        &self,
        name: &str,
        tag: &str,
        digest: &Digest,
    ) -> RegistryResult<RepositoryVersion> {
        validate_tag(tag)?;
        let repository = self.repository(name).await?;

        let mut version = self.versions.new_version(&repository).await?;
        let manifest = self
            .resolver
            .resolve(version.base(), &Reference::Digest(digest.clone()))
            .await?;
        let row = self.processor.tag_row(tag, manifest.id).await?;

        let previous = version.tags_named(tag).await?;
        version.remove_content(Removal::Units(previous));
        version.add_content([row.id]);
        version.commit().await
    }

    /// Remove `tag` from the latest version.
    #[tracing::instrument(skip(self))]
    pub async fn untag(&self, name: &str, tag: &str) -> RegistryResult<RepositoryVersion> {
        let repository = self.repository(name).await?;

        let mut version = self.versions.new_version(&repository).await?;
        let existing = version.tags_named(tag).await?;
        if existing.is_empty() {
            return Err(RegistryError::TagNotFound(tag.to_owned()));
        }
        version.remove_content(Removal::Units(existing));
        version.commit().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RegistryBuilder;
    use crate::digest::{EMPTY_BLOB, media_type};
    use crate::tasks::{ChannelQueue, TaskKind};

    #[test]
    fn repository_names() {
        for good in ["app", "library/busybox", "my-org/sub.name/img_1", "a__b", "x--y"] {
            assert!(validate_repository_name(good).is_ok(), "{good}");
        }
        for bad in ["", "App", "/app", "app/", "a//b", "-app", "app-", "a..b"] {
            assert!(validate_repository_name(bad).is_err(), "{bad}");
        }
    }

    async fn push_image(registry: &Registry, name: &str, tag: &str) -> Manifest {
        let repository = registry.repository_for_push(name).await.unwrap();
        let config = Bytes::from_static(b"{\"architecture\":\"amd64\"}");
        let digest = Digest::of(&config);
        let upload = registry.uploads().start(&repository).await.unwrap();
        registry
            .uploads()
            .monolithic(&repository, upload.id, config, &digest)
            .await
            .unwrap();

        let body = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_type::MANIFEST_OCI,
            "config": {"digest": digest.to_string(), "size": 25},
            "layers": [{"digest": EMPTY_BLOB, "size": 32}],
        });
        registry
            .push_manifest(
                name,
                &Reference::Tag(tag.into()),
                Bytes::from(serde_json::to_vec(&body).unwrap()),
                media_type::MANIFEST_OCI,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn push_then_pull_by_tag_and_digest() {
        let registry = RegistryBuilder::new().build();
        let pushed = push_image(&registry, "team/app", "v1").await;

        let by_tag = registry
            .manifest("team/app", &Reference::Tag("v1".into()))
            .await
            .unwrap();
        let by_digest = registry
            .manifest("team/app", &Reference::Digest(pushed.digest.clone()))
            .await
            .unwrap();
        assert_eq!(by_tag, pushed);
        assert_eq!(by_digest, pushed);
        assert_eq!(registry.catalog().await.unwrap(), vec!["team/app"]);
        assert_eq!(registry.tags("team/app").await.unwrap(), vec!["v1"]);
    }

    #[tokio::test]
    async fn empty_blob_is_always_available() {
        let registry = RegistryBuilder::new().build();
        registry.create_repository("app").await.unwrap();
        let digest: Digest = EMPTY_BLOB.parse().unwrap();

        let data = registry.blob("app", &digest).await.unwrap();
        assert_eq!(&data[..], &EMPTY_BLOB_BYTES[..]);
        assert_eq!(registry.blob_artifact("app", &digest).await.unwrap().size, 32);
    }

    #[tokio::test]
    async fn tag_and_untag() {
        let registry = RegistryBuilder::new().build();
        let manifest = push_image(&registry, "app", "v1").await;

        registry.tag("app", "stable", &manifest.digest).await.unwrap();
        assert_eq!(registry.tags("app").await.unwrap(), vec!["stable", "v1"]);

        registry.untag("app", "v1").await.unwrap();
        assert_eq!(registry.tags("app").await.unwrap(), vec!["stable"]);

        assert!(matches!(
            registry.untag("app", "v1").await,
            Err(RegistryError::TagNotFound(_))
        ));
        assert!(matches!(
            registry.tag("app", "other", &Digest::of(b"nope")).await,
            Err(RegistryError::ManifestNotFound(_))
        ));

        let history = registry.versions("app").await.unwrap();
        assert_eq!(history.last().unwrap().number, history.len() as u64 - 1);
    }

    #[tokio::test]
    async fn duplicate_create_is_a_conflict() {
        let registry = RegistryBuilder::new().build();
        registry.create_repository("app").await.unwrap();
        assert!(matches!(
            registry.create_repository("app").await,
            Err(RegistryError::Conflict(_))
        ));
        assert!(registry.repository_for_push("app").await.is_ok());
        assert!(matches!(
            registry.repository("Bad Name").await,
            Err(RegistryError::InvalidRepository(_))
        ));
    }

    #[tokio::test]
    async fn dispatch_requires_a_queue() {
        let registry = RegistryBuilder::new().build();
        assert!(matches!(
            registry.dispatcher(),
            Err(RegistryError::TaskQueue(_))
        ));
    }

    #[tokio::test]
    async fn dispatch_through_configured_queue() {
        let (queue, mut tasks) = ChannelQueue::new();
        let registry = RegistryBuilder::new().task_queue(Arc::new(queue)).build();
        let repository = registry.create_repository("app").await.unwrap();

        let handle = registry
            .dispatcher()
            .unwrap()
            .remove(&repository, &["*".to_owned()])
            .await
            .unwrap();

        let request = tasks.recv().await.unwrap();
        assert_eq!(request.id, handle.task);
        assert_eq!(request.kind, TaskKind::RecursiveRemove);
        assert_eq!(request.kwargs["content_units"], serde_json::json!(["*"]));
    }
}
