//! Preparation and hand-off of long-running repository operations.
//!
//! The registry never runs these operations itself. It validates the request,
//! works out which resources the task must hold exclusively, and hands a
//! [`TaskRequest`] to a [`TaskQueue`] whose worker lives elsewhere.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::content::{Content, ContentId, Repository, RepositoryVersion};
use crate::content_store::ContentStore;
use crate::db::Database;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::reservation::Resource;
use crate::resolver::validate_tag;
use crate::version::{REMOVE_ALL, Removal};

/// Identifies an enqueued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The operation a worker should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Mirror or merge content from a remote.
    Synchronize,
    /// Add units and everything they reference.
    RecursiveAdd,
    /// Remove units and everything only they reference.
    RecursiveRemove,
    /// Build an image from a containerfile.
    BuildImage,
}

/// A prepared task.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    /// Task identifier, echoed in the handle.
    pub id: TaskId,
    /// What the worker should do.
    pub kind: TaskKind,
    /// Resources the worker must reserve before running.
    pub reservations: Vec<Resource>,
    /// Task arguments.
    pub kwargs: serde_json::Value,
}

impl TaskRequest {
    fn new(kind: TaskKind, reservations: Vec<Resource>, kwargs: serde_json::Value) -> Self {
        Self {
            id: TaskId(Uuid::new_v4()),
            kind,
            reservations,
            kwargs,
        }
    }
}

/// Receipt for an enqueued task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskHandle {
    /// The enqueued task.
    pub task: TaskId,
    /// Its kind.
    pub kind: TaskKind,
}

/// Somewhere to send prepared tasks.
#[async_trait::async_trait]
pub trait TaskQueue: fmt::Debug + Send + Sync {
    /// Accept a task for later execution.
    async fn enqueue(&self, request: TaskRequest) -> RegistryResult<TaskHandle>;
}

/// A queue backed by an in-process channel.
#[derive(Debug, Clone)]
pub struct ChannelQueue {
    sender: mpsc::UnboundedSender<TaskRequest>,
}

impl ChannelQueue {
    /// A queue and the receiver a worker should drain.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TaskRequest>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait::async_trait]
impl TaskQueue for ChannelQueue {
    async fn enqueue(&self, request: TaskRequest) -> RegistryResult<TaskHandle> {
        let handle = TaskHandle {
            task: request.id,
            kind: request.kind,
        };
        self.sender
            .send(request)
            .map_err(|_| RegistryError::TaskQueue("no worker is receiving tasks".into()))?;
        Ok(handle)
    }
}

fn parse_units(units: &[String]) -> RegistryResult<Vec<ContentId>> {
    units
        .iter()
        .map(|unit| {
            unit.parse()
                .map_err(|_| RegistryError::InvalidRequest(format!("not a content id: {unit}")))
        })
        .collect()
}

/// Validates and enqueues repository tasks.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    db: Arc<dyn Database>,
    store: ContentStore,
    queue: Arc<dyn TaskQueue>,
}

impl Dispatcher {
    /// Dispatch into `queue`.
    pub fn new(db: Arc<dyn Database>, store: ContentStore, queue: Arc<dyn TaskQueue>) -> Self {
        Self { db, store, queue }
    }

    async fn submit(&self, request: TaskRequest) -> RegistryResult<TaskHandle> {
        tracing::debug!(task = %request.id, kind = ?request.kind, "enqueueing task");
        self.queue.enqueue(request).await
    }

    /// Sync `repository` from `remote`.
    #[tracing::instrument(skip(self, repository), fields(repository = %repository.name))]
    pub async fn sync(
        &self,
        repository: &Repository,
        remote: &str,
        mirror: bool,
    ) -> RegistryResult<TaskHandle> {
        self.submit(TaskRequest::new(
            TaskKind::Synchronize,
            vec![
                Resource::Repository(repository.id),
                Resource::Remote(remote.to_owned()),
            ],
            json!({
                "repository": repository.id,
                "remote": remote,
                "mirror": mirror,
            }),
        ))
        .await
    }

    /// Recursively add `units` to `repository`.
    #[tracing::instrument(skip(self, repository), fields(repository = %repository.name))]
    pub async fn add(&self, repository: &Repository, units: &[String]) -> RegistryResult<TaskHandle> {
        let units = parse_units(units)?;
        self.enqueue_add(repository, units).await
    }

    async fn enqueue_add(
        &self,
        repository: &Repository,
        units: Vec<ContentId>,
    ) -> RegistryResult<TaskHandle> {
        self.submit(TaskRequest::new(
            TaskKind::RecursiveAdd,
            vec![Resource::Repository(repository.id)],
            json!({
                "repository": repository.id,
                "content_units": units,
            }),
        ))
        .await
    }

    /// Recursively remove `units`, or everything when `units` is `["*"]`.
    #[tracing::instrument(skip(self, repository), fields(repository = %repository.name))]
    pub async fn remove(
        &self,
        repository: &Repository,
        units: &[String],
    ) -> RegistryResult<TaskHandle> {
        let units = match Removal::parse(units)? {
            Removal::All => json!([REMOVE_ALL]),
            Removal::Units(ids) => json!(ids),
        };
        self.submit(TaskRequest::new(
            TaskKind::RecursiveRemove,
            vec![Resource::Repository(repository.id)],
            json!({
                "repository": repository.id,
                "content_units": units,
            }),
        ))
        .await
    }

    async fn units_in(&self, version: &RepositoryVersion) -> RegistryResult<Vec<Content>> {
        Ok(self.db.content(&version.content).await?)
    }

    /// Copy tags from `source` into `destination`, all of them when `names` is `None`.
    #[tracing::instrument(skip_all, fields(destination = %destination.name, source = source.number))]
    pub async fn copy_tags(
        &self,
        destination: &Repository,
        source: &RepositoryVersion,
        names: Option<&[String]>,
    ) -> RegistryResult<TaskHandle> {
        let units = self
            .units_in(source)
            .await?
            .iter()
            .filter_map(Content::as_tag)
            .filter(|tag| names.is_none_or(|names| names.contains(&tag.name)))
            .map(|tag| tag.id)
            .collect();
        self.enqueue_add(destination, units).await
    }

    /// Copy manifests from `source` into `destination`, filtered by digest and media type.
    #[tracing::instrument(skip_all, fields(destination = %destination.name, source = source.number))]
    pub async fn copy_manifests(
        &self,
        destination: &Repository,
        source: &RepositoryVersion,
        digests: Option<&[Digest]>,
        media_types: Option<&[String]>,
    ) -> RegistryResult<TaskHandle> {
        let units = self
            .units_in(source)
            .await?
            .iter()
            .filter_map(Content::as_manifest)
            .filter(|manifest| digests.is_none_or(|digests| digests.contains(&manifest.digest)))
            .filter(|manifest| {
                media_types.is_none_or(|types| types.contains(&manifest.media_type))
            })
            .map(|manifest| manifest.id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        self.enqueue_add(destination, units).await
    }

    /// Store `containerfile` and enqueue a build tagged `tag`.
    #[tracing::instrument(skip(self, repository, containerfile), fields(repository = %repository.name))]
    pub async fn build_image(
        &self,
        repository: &Repository,
        containerfile: Bytes,
        tag: &str,
    ) -> RegistryResult<TaskHandle> {
        validate_tag(tag)?;
        let artifact = self.store.put(containerfile).await?;
        self.submit(TaskRequest::new(
            TaskKind::BuildImage,
            vec![Resource::Repository(repository.id)],
            json!({
                "repository": repository.id,
                "containerfile": artifact.digest(),
                "tag": tag,
            }),
        ))
        .await
    }
}
