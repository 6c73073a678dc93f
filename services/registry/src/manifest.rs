//! Manifest operations for the registry

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;

use crate::api::{DOCKER_CONTENT_DIGEST, Pagination, RepositoryPath, repository_route};
use crate::content::Manifest;
use crate::digest::media_type;
use crate::error::{RegistryError, RegistryResult};
use crate::registry::Registry;
use crate::resolver::Reference;

/// Router for manifest operations
pub fn router() -> Router<Registry> {
    let router = repository_route(
        Router::new(),
        "manifests/{reference}",
        get(get_manifest).head(head_manifest).put(put_manifest),
    );
    repository_route(router, "tags/list", get(list_tags))
}

fn manifest_headers(manifest: &Manifest) -> [(header::HeaderName, String); 3] {
    [
        (header::CONTENT_TYPE, manifest.media_type.clone()),
        (DOCKER_CONTENT_DIGEST, manifest.digest.to_string()),
        (header::CONTENT_LENGTH, manifest.data.len().to_string()),
    ]
}

/// Served to clients that send no `Accept` header.
const DEFAULT_ACCEPT: &[&str] = &[
    media_type::MANIFEST_V1,
    media_type::MANIFEST_V1_SIGNED,
    media_type::MANIFEST_V2,
    media_type::MANIFEST_LIST,
];

/// Manifest media types a client will take, from its `Accept` headers.
#[derive(Debug, PartialEq, Eq)]
enum Accepted {
    Any,
    Types(Vec<String>),
}

impl Accepted {
    fn from_headers(headers: &HeaderMap) -> Self {
        let types: Vec<String> = headers
            .get_all(header::ACCEPT)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .filter_map(|item| item.split(';').next())
            .map(str::trim)
            .filter(|essence| !essence.is_empty())
            .map(str::to_owned)
            .collect();

        if types.is_empty() {
            Accepted::Types(DEFAULT_ACCEPT.iter().map(|t| (*t).to_owned()).collect())
        } else if types.iter().any(|essence| essence == "*/*") {
            Accepted::Any
        } else {
            Accepted::Types(types)
        }
    }

    fn allows(&self, media_type: &str) -> bool {
        match self {
            Accepted::Any => true,
            Accepted::Types(types) => types.iter().any(|t| t == media_type),
        }
    }
}

/// Resolve the manifest a request names.
///
/// Tags only resolve to manifests of a type the client accepts; digests
/// always resolve.
async fn lookup(
    registry: &Registry,
    path: &RepositoryPath,
    headers: &HeaderMap,
) -> RegistryResult<Manifest> {
    let reference: Reference = path.param("reference")?.parse()?;
    let manifest = registry.manifest(&path.name, &reference).await?;

    let accepted = Accepted::from_headers(headers);
    if matches!(reference, Reference::Tag(_)) && !accepted.allows(&manifest.media_type) {
        tracing::warn!(
            %reference,
            media_type = %manifest.media_type,
            ?accepted,
            "client does not accept the manifest type"
        );
        return Err(RegistryError::ManifestNotFound(reference.to_string()));
    }
    Ok(manifest)
}

/// Get a manifest
async fn get_manifest(
    State(registry): State<Registry>,
    path: RepositoryPath,
    headers: HeaderMap,
) -> RegistryResult<Response> {
    let manifest = lookup(&registry, &path, &headers).await?;
    let headers = manifest_headers(&manifest);
    Ok((StatusCode::OK, headers, manifest.data).into_response())
}

/// Check if a manifest exists
async fn head_manifest(
    State(registry): State<Registry>,
    path: RepositoryPath,
    headers: HeaderMap,
) -> RegistryResult<Response> {
    let manifest = lookup(&registry, &path, &headers).await?;
    Ok((StatusCode::OK, manifest_headers(&manifest)).into_response())
}

/// Put a manifest
async fn put_manifest(
    State(registry): State<Registry>,
    path: RepositoryPath,
    headers: HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    let reference: Reference = path.param("reference")?.parse()?;
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| RegistryError::UnsupportedManifestType("missing content type".into()))?;

    let manifest = registry
        .push_manifest(&path.name, &reference, body, content_type)
        .await?;

    let location = registry.config().location(&format!(
        "/v2/{}/manifests/{}",
        path.name, manifest.digest
    ));

    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, location),
            (DOCKER_CONTENT_DIGEST, manifest.digest.to_string()),
            (header::CONTENT_LENGTH, "0".to_string()),
        ],
    )
        .into_response())
}

/// List tags for a repository
async fn list_tags(
    State(registry): State<Registry>,
    path: RepositoryPath,
    Query(page): Query<Pagination>,
) -> RegistryResult<Json<TagList>> {
    let tags = page.apply(registry.tags(&path.name).await?);
    Ok(Json(TagList {
        name: path.name,
        tags,
    }))
}

/// Tag list response
#[derive(Debug, serde::Serialize)]
struct TagList {
    name: String,
    tags: Vec<String>,
}
