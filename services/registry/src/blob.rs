//! Blob operations for the registry

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::api::{DOCKER_CONTENT_DIGEST, DOCKER_UPLOAD_UUID, RepositoryPath, repository_route};
use crate::content::{Repository, UploadId};
use crate::digest::{Digest, media_type};
use crate::error::{RegistryError, RegistryResult};
use crate::registry::Registry;
use crate::upload::Upload;

static CONTENT_RANGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)-(\d+)$").expect("to create a regex from pattern"));

/// Router for blob operations
pub fn router() -> Router<Registry> {
    let router = Router::new();
    let router = repository_route(router, "blobs/{digest}", get(get_blob).head(head_blob));
    let router = repository_route(router, "blobs/uploads/", post(start_blob_upload));
    repository_route(
        router,
        "blobs/uploads/{uuid}",
        get(upload_status)
            .patch(upload_chunk)
            .put(complete_blob_upload)
            .delete(cancel_blob_upload),
    )
}

#[derive(Debug, Default, Deserialize)]
struct DigestQuery {
    digest: Option<String>,
}

impl DigestQuery {
    fn digest(&self) -> RegistryResult<Option<Digest>> {
        self.digest.as_deref().map(str::parse::<Digest>).transpose()
    }
}

fn blob_location(registry: &Registry, name: &str, digest: &Digest) -> String {
    registry
        .config()
        .location(&format!("/v2/{name}/blobs/{digest}"))
}

/// `202 Accepted` (or `204` for status) describing an open upload.
fn upload_response(registry: &Registry, name: &str, upload: &Upload, status: StatusCode) -> Response {
    let location = registry
        .config()
        .location(&format!("/v2/{name}/blobs/uploads/{}", upload.id));
    (
        status,
        [
            (header::LOCATION, location),
            (header::RANGE, upload.range()),
            (DOCKER_UPLOAD_UUID, upload.id.to_string()),
            (header::CONTENT_LENGTH, "0".to_string()),
        ],
    )
        .into_response()
}

fn created_response(registry: &Registry, name: &str, digest: &Digest) -> Response {
    (
        StatusCode::CREATED,
        [
            (header::LOCATION, blob_location(registry, name, digest)),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
            (header::CONTENT_LENGTH, "0".to_string()),
        ],
    )
        .into_response()
}

/// The inclusive byte range named by a `Content-Range: <start>-<end>` header.
fn content_range(headers: &HeaderMap) -> RegistryResult<Option<(u64, u64)>> {
    let Some(value) = headers.get(header::CONTENT_RANGE) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| RegistryError::InvalidRequest("content-range is not ascii".into()))?;
    let captures = CONTENT_RANGE_RE
        .captures(value)
        .ok_or_else(|| RegistryError::InvalidRequest(format!("invalid content-range {value}")))?;
    let bound = |index: usize| {
        captures[index]
            .parse::<u64>()
            .map_err(|_| RegistryError::InvalidRequest(format!("invalid content-range {value}")))
    };
    Ok(Some((bound(1)?, bound(2)?)))
}

fn upload_id(path: &RepositoryPath) -> RegistryResult<UploadId> {
    let uuid = path.param("uuid")?;
    uuid.parse::<UploadId>()
        .map_err(|_| RegistryError::UploadNotFound(uuid.to_owned()))
}

/// Append `body` at the offset named by the request, or the current end.
///
/// A `Content-Range` must span exactly the body.
async fn append_request(
    registry: &Registry,
    repository: &Repository,
    id: UploadId,
    headers: &HeaderMap,
    body: Bytes,
) -> RegistryResult<Upload> {
    let start = match content_range(headers)? {
        Some((start, end)) => {
            let last = start
                .checked_add(body.len() as u64)
                .and_then(|next| next.checked_sub(1));
            if last != Some(end) {
                return Err(RegistryError::OffsetMismatch {
                    expected: last.unwrap_or(start),
                    actual: end,
                });
            }
            start
        }
        None => registry.uploads().status(repository, id).await?.offset,
    };
    registry.uploads().append(repository, id, body, start).await
}

/// Get a blob
async fn get_blob(State(registry): State<Registry>, path: RepositoryPath) -> RegistryResult<Response> {
    let digest: Digest = path.param("digest")?.parse()?;
    let data = registry.blob(&path.name, &digest).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, media_type::BLOB_CONTENT_TYPE.to_string()),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
        data,
    )
        .into_response())
}

/// Check if a blob exists
async fn head_blob(State(registry): State<Registry>, path: RepositoryPath) -> RegistryResult<Response> {
    let digest: Digest = path.param("digest")?.parse()?;
    let info = registry.blob_artifact(&path.name, &digest).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, media_type::BLOB_CONTENT_TYPE.to_string()),
            (DOCKER_CONTENT_DIGEST, info.digest.to_string()),
            (header::CONTENT_LENGTH, info.size.to_string()),
        ],
    )
        .into_response())
}

/// Start a blob upload session, or upload a whole blob when `digest` is given
async fn start_blob_upload(
    State(registry): State<Registry>,
    path: RepositoryPath,
    Query(query): Query<DigestQuery>,
    body: Bytes,
) -> RegistryResult<Response> {
    let digest = query.digest()?;
    let repository = registry.repository_for_push(&path.name).await?;
    let upload = registry.uploads().start(&repository).await?;

    match digest {
        Some(digest) => {
            registry
                .uploads()
                .monolithic(&repository, upload.id, body, &digest)
                .await?;
            Ok(created_response(&registry, &path.name, &digest))
        }
        None => Ok(upload_response(
            &registry,
            &path.name,
            &upload,
            StatusCode::ACCEPTED,
        )),
    }
}

/// Report upload progress
async fn upload_status(
    State(registry): State<Registry>,
    path: RepositoryPath,
) -> RegistryResult<Response> {
    let id = upload_id(&path)?;
    let repository = registry.repository(&path.name).await?;
    let upload = registry.uploads().status(&repository, id).await?;
    Ok(upload_response(
        &registry,
        &path.name,
        &upload,
        StatusCode::NO_CONTENT,
    ))
}

/// Append a chunk to an upload
async fn upload_chunk(
    State(registry): State<Registry>,
    path: RepositoryPath,
    headers: HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    let id = upload_id(&path)?;
    let repository = registry.repository(&path.name).await?;
    let upload = append_request(&registry, &repository, id, &headers, body).await?;
    Ok(upload_response(
        &registry,
        &path.name,
        &upload,
        StatusCode::ACCEPTED,
    ))
}

/// Complete a blob upload, appending any final chunk in the body
async fn complete_blob_upload(
    State(registry): State<Registry>,
    path: RepositoryPath,
    Query(query): Query<DigestQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    let id = upload_id(&path)?;
    let digest = query
        .digest()?
        .ok_or_else(|| RegistryError::InvalidDigest("missing digest".into()))?;
    let repository = registry.repository(&path.name).await?;

    if !body.is_empty() {
        append_request(&registry, &repository, id, &headers, body).await?;
    }
    registry.uploads().finalize(&repository, id, &digest).await?;

    Ok(created_response(&registry, &path.name, &digest))
}

/// Cancel a blob upload
async fn cancel_blob_upload(
    State(registry): State<Registry>,
    path: RepositoryPath,
) -> RegistryResult<StatusCode> {
    let id = upload_id(&path)?;
    let repository = registry.repository(&path.name).await?;
    registry.uploads().abandon(&repository, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn parse_content_range() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_range(&headers).unwrap(), None);

        headers.insert(header::CONTENT_RANGE, HeaderValue::from_static("1024-2047"));
        assert_eq!(content_range(&headers).unwrap(), Some((1024, 2047)));

        headers.insert(header::CONTENT_RANGE, HeaderValue::from_static("bytes 0-10/*"));
        assert!(matches!(
            content_range(&headers),
            Err(RegistryError::InvalidRequest(_))
        ));
    }

    #[test]
    fn digest_query() {
        let query = DigestQuery::default();
        assert!(query.digest().unwrap().is_none());

        let digest = Digest::of(b"blob");
        let query = DigestQuery {
            digest: Some(digest.to_string()),
        };
        assert_eq!(query.digest().unwrap(), Some(digest));

        let query = DigestQuery {
            digest: Some("md5:abc".into()),
        };
        assert!(query.digest().is_err());
    }
}
