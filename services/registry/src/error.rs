//! Error types for the registry

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::db::DbError;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Blob not found
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    /// Manifest not found
    #[error("manifest not found: {0}")]
    ManifestNotFound(String),

    /// Repository not found
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    /// Upload session not found
    #[error("upload not found: {0}")]
    UploadNotFound(String),

    /// Tag not found
    #[error("tag not found: {0}")]
    TagNotFound(String),

    /// A chunk did not line up with the upload or with its own length
    #[error("upload offset mismatch: expected {expected}, got {actual}")]
    OffsetMismatch {
        /// Offset the registry expected
        expected: u64,
        /// Offset the client named
        actual: u64,
    },

    /// Digest mismatch
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Expected digest
        expected: String,
        /// Actual digest
        actual: String,
    },

    /// A manifest refers to a blob the registry does not have
    #[error("unresolved reference: {0}")]
    UnresolvedReference(String),

    /// A concurrent writer published first
    #[error("conflict: {0}")]
    Conflict(String),

    /// Invalid digest format
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Invalid tag or reference
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// Invalid manifest
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Unsupported manifest media type
    #[error("unsupported manifest type: {0}")]
    UnsupportedManifestType(String),

    /// Invalid repository name
    #[error("invalid repository name: {0}")]
    InvalidRepository(String),

    /// Malformed request parameters
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The task queue stopped accepting work
    #[error("task queue unavailable: {0}")]
    TaskQueue(String),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// Metadata store error
    #[error("database error: {0}")]
    Database(#[source] DbError),
}

impl From<DbError> for RegistryError {
    fn from(error: DbError) -> Self {
        match error {
            DbError::NotFound { entity, key } => match entity {
                "blob" | "artifact" => RegistryError::BlobNotFound(key),
                "manifest" => RegistryError::ManifestNotFound(key),
                "repository" => RegistryError::RepositoryNotFound(key),
                "upload" => RegistryError::UploadNotFound(key),
                "tag" => RegistryError::TagNotFound(key),
                _ => RegistryError::Database(DbError::NotFound { entity, key }),
            },
            DbError::Conflict { entity, key } => {
                RegistryError::Conflict(format!("{entity} {key}"))
            }
            error => RegistryError::Database(error),
        }
    }
}

impl RegistryError {
    /// Whether the error means the requested thing does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            RegistryError::BlobNotFound(_)
            | RegistryError::ManifestNotFound(_)
            | RegistryError::RepositoryNotFound(_)
            | RegistryError::UploadNotFound(_)
            | RegistryError::TagNotFound(_) => true,
            RegistryError::Storage(error) => error.is_not_found(),
            _ => false,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            _ if self.is_not_found() => StatusCode::NOT_FOUND,
            RegistryError::InvalidDigest(_)
            | RegistryError::InvalidReference(_)
            | RegistryError::InvalidManifest(_)
            | RegistryError::InvalidRepository(_)
            | RegistryError::InvalidRequest(_)
            | RegistryError::DigestMismatch { .. }
            | RegistryError::UnresolvedReference(_) => StatusCode::BAD_REQUEST,
            RegistryError::OffsetMismatch { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            RegistryError::UnsupportedManifestType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            RegistryError::Conflict(_) => StatusCode::CONFLICT,
            RegistryError::TaskQueue(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for OCI error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::BlobNotFound(_) => "BLOB_UNKNOWN",
            RegistryError::ManifestNotFound(_) | RegistryError::TagNotFound(_) => {
                "MANIFEST_UNKNOWN"
            }
            RegistryError::RepositoryNotFound(_) => "NAME_UNKNOWN",
            RegistryError::UploadNotFound(_) => "BLOB_UPLOAD_UNKNOWN",
            RegistryError::OffsetMismatch { .. } => "BLOB_UPLOAD_INVALID",
            RegistryError::DigestMismatch { .. } | RegistryError::InvalidDigest(_) => {
                "DIGEST_INVALID"
            }
            RegistryError::UnresolvedReference(_) => "MANIFEST_BLOB_UNKNOWN",
            RegistryError::InvalidReference(_) => "TAG_INVALID",
            RegistryError::InvalidManifest(_) | RegistryError::UnsupportedManifestType(_) => {
                "MANIFEST_INVALID"
            }
            RegistryError::InvalidRepository(_) => "NAME_INVALID",
            RegistryError::InvalidRequest(_) => "UNSUPPORTED",
            RegistryError::Storage(error) if error.is_not_found() => "BLOB_UNKNOWN",
            RegistryError::Conflict(_)
            | RegistryError::TaskQueue(_)
            | RegistryError::Storage(_)
            | RegistryError::Database(_) => "UNKNOWN",
        }
    }
}

/// OCI error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }

        let body = ErrorResponse {
            errors: vec![ErrorDetail {
                code: self.error_code(),
                message: self.to_string(),
            }],
        };

        (status, axum::Json(body)).into_response()
    }
}
