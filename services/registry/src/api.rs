//! API server builder and router

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::{DefaultBodyLimit, FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::Json;
use axum::routing::{MethodRouter, get};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::config::RegistryConfig;
use crate::content_store::ContentStore;
use crate::db::{Database, MemoryDatabase};
use crate::error::{RegistryError, RegistryResult};
use crate::ingest::ManifestProcessor;
use crate::registry::Registry;
use crate::reservation::Reservations;
use crate::resolver::TagResolver;
use crate::tasks::{Dispatcher, TaskQueue};
use crate::upload::UploadSessions;
use crate::version::Versions;

pub(crate) const DOCKER_CONTENT_DIGEST: HeaderName =
    HeaderName::from_static("docker-content-digest");
pub(crate) const DOCKER_UPLOAD_UUID: HeaderName = HeaderName::from_static("docker-upload-uuid");
const DOCKER_DISTRIBUTION_API_VERSION: HeaderName =
    HeaderName::from_static("docker-distribution-api-version");

/// Registry builder for configuring and creating the OCI registry service
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    config: RegistryConfig,
    storage: Option<storage::Storage>,
    database: Option<Arc<dyn Database>>,
    queue: Option<Arc<dyn TaskQueue>>,
}

impl RegistryBuilder {
    /// Create a new registry builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all registry settings
    pub fn config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the storage backend
    ///
    /// Defaults to an in-memory store.
    pub fn storage(mut self, storage: storage::Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the bucket name for storage
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.config.bucket = bucket.into();
        self
    }

    /// Set the metadata store
    ///
    /// Defaults to [`MemoryDatabase`].
    pub fn database(mut self, database: Arc<dyn Database>) -> Self {
        self.database = Some(database);
        self
    }

    /// Enable task dispatch through `queue`
    pub fn task_queue(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Build the registry
    pub fn build(self) -> Registry {
        let config = self.config;
        let storage = self.storage.unwrap_or_else(|| {
            storage::MemoryStorage::with_buckets(&[config.bucket.as_str()]).into()
        });
        let db = self
            .database
            .unwrap_or_else(|| Arc::new(MemoryDatabase::new()));

        let reservations = Reservations::new();
        let store = ContentStore::new(storage.bucket(config.bucket.clone()), db.clone());
        let versions = Versions::new(db.clone(), reservations.clone());
        let uploads = UploadSessions::new(
            db.clone(),
            store.clone(),
            versions.clone(),
            reservations,
        );
        let processor = ManifestProcessor::new(db.clone(), store.clone(), versions.clone());
        let resolver = TagResolver::new(db.clone());
        let dispatcher = self
            .queue
            .map(|queue| Dispatcher::new(db.clone(), store.clone(), queue));

        tracing::debug!(bucket = %config.bucket, driver = storage.name(), "built registry");
        Registry::from_parts(
            config, db, store, versions, uploads, processor, resolver, dispatcher,
        )
    }
}

impl Registry {
    /// The HTTP API for this registry
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub fn router(&self) -> Router {
        router(self.clone())
    }
}

/// The distribution API routes, serving `registry`.
pub fn router(registry: Registry) -> Router {
    let limit = registry.config().max_body_size;

    Router::new()
        .route("/v2/", get(api_version_check))
        .route("/v2/_catalog", get(catalog))
        .merge(crate::blob::router())
        .merge(crate::manifest::router())
        .layer(DefaultBodyLimit::max(limit))
        .layer(SetResponseHeaderLayer::overriding(
            DOCKER_DISTRIBUTION_API_VERSION,
            HeaderValue::from_static("registry/2.0"),
        ))
        .with_state(registry)
}

/// Register `route` under both single and two component repository names.
///
/// `suffix` follows the repository name, e.g. `blobs/{digest}`.
pub(crate) fn repository_route(
    router: Router<Registry>,
    suffix: &str,
    route: MethodRouter<Registry>,
) -> Router<Registry> {
    router
        .route(&format!("/v2/{{repo}}/{suffix}"), route.clone())
        .route(&format!("/v2/{{repo}}/{{image}}/{suffix}"), route)
}

/// Path parameters of a repository-scoped route, with the name reassembled.
#[derive(Debug)]
pub(crate) struct RepositoryPath {
    pub name: String,
    params: HashMap<String, String>,
}

impl RepositoryPath {
    /// A parameter following the repository name.
    pub fn param(&self, key: &str) -> RegistryResult<&str> {
        self.params
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| RegistryError::InvalidRequest(format!("missing path parameter {key}")))
    }
}

impl<S> FromRequestParts<S> for RepositoryPath
where
    S: Send + Sync,
{
    type Rejection = RegistryError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(mut params) = Path::<HashMap<String, String>>::from_request_parts(parts, state)
            .await
            .map_err(|rejection| RegistryError::InvalidRequest(rejection.body_text()))?;

        let repo = params
            .remove("repo")
            .ok_or_else(|| RegistryError::InvalidRequest("missing repository name".into()))?;
        let name = match params.remove("image") {
            Some(image) => format!("{repo}/{image}"),
            None => repo,
        };

        Ok(Self { name, params })
    }
}

/// `n` and `last` pagination parameters for listings.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct Pagination {
    n: Option<usize>,
    last: Option<String>,
}

impl Pagination {
    /// The page of sorted `names` this request asks for.
    pub fn apply(&self, names: Vec<String>) -> Vec<String> {
        let start = match &self.last {
            Some(last) => names.partition_point(|name| name <= last),
            None => 0,
        };
        let names = names.into_iter().skip(start);
        match self.n {
            Some(n) => names.take(n).collect(),
            None => names.collect(),
        }
    }
}

/// API version check endpoint
///
/// Returns 200 OK to indicate the registry is available
async fn api_version_check() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({})))
}

#[derive(Debug, Serialize)]
struct Catalog {
    repositories: Vec<String>,
}

async fn catalog(
    State(registry): State<Registry>,
    Query(page): Query<Pagination>,
) -> RegistryResult<Json<Catalog>> {
    let repositories = page.apply(registry.catalog().await?);
    Ok(Json(Catalog { repositories }))
}
