use std::error::Error as StdError;
use std::fmt;

use tracing_error::SpanTrace;

/// Categorizes storage errors by their semantic meaning, independent of
/// the underlying storage backend implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// The requested object or bucket was not found.
    NotFound,

    /// The destination object already exists.
    ///
    /// Content-addressed writers treat this as success: the bytes at that
    /// path are, by construction, the bytes they were about to write.
    AlreadyExists,

    /// The caller lacks permission to perform the requested operation.
    PermissionDenied,

    /// The operation failed due to I/O errors (disk, network, etc.).
    Io,

    /// The request was invalid (bad path, bad parameters, etc.).
    InvalidRequest,

    /// An unexpected or uncategorized error occurred.
    Other,
}

impl StorageErrorKind {
    /// Classify a standard I/O error.
    pub fn from_io(kind: std::io::ErrorKind) -> Self {
        match kind {
            std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            std::io::ErrorKind::AlreadyExists => StorageErrorKind::AlreadyExists,
            std::io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            std::io::ErrorKind::InvalidInput => StorageErrorKind::InvalidRequest,
            _ => StorageErrorKind::Io,
        }
    }

    /// Returns whether this error kind typically indicates a retryable condition.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageErrorKind::Io)
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageErrorKind::NotFound => write!(f, "not found"),
            StorageErrorKind::AlreadyExists => write!(f, "already exists"),
            StorageErrorKind::PermissionDenied => write!(f, "permission denied"),
            StorageErrorKind::Io => write!(f, "I/O error"),
            StorageErrorKind::InvalidRequest => write!(f, "invalid request"),
            StorageErrorKind::Other => write!(f, "other error"),
        }
    }
}

/// Storage error with the operation context that produced it.
///
/// Carries the semantic [`StorageErrorKind`], the engine name, the bucket and
/// path when known, and a [`SpanTrace`] captured where the error was built so
/// that async call stacks survive into logs.
///
/// # Example
///
/// ```rust
/// use storage_driver::{StorageError, StorageErrorKind};
///
/// let error = StorageError::builder(
///     "memory",
///     StorageErrorKind::NotFound,
///     std::io::Error::new(std::io::ErrorKind::NotFound, "object not found"),
/// )
/// .bucket("registry")
/// .path("artifact/ab/cdef")
/// .build();
///
/// assert_eq!(error.kind(), StorageErrorKind::NotFound);
/// ```
#[derive(Debug)]
pub struct StorageError {
    kind: StorageErrorKind,
    engine: &'static str,
    bucket: Option<String>,
    path: Option<String>,
    context: Option<String>,
    source: Box<dyn StdError + Send + Sync + 'static>,
    span_trace: Box<SpanTrace>,
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl StorageError {
    /// Create a new storage error with the minimum required information.
    pub fn new<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self::builder(engine, kind, error).build()
    }

    /// Create a storage error from an I/O error, classifying it by its kind.
    pub fn io(engine: &'static str, error: std::io::Error) -> Self {
        Self::new(engine, StorageErrorKind::from_io(error.kind()), error)
    }

    /// Create a builder for constructing a storage error with full context.
    pub fn builder<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> StorageErrorBuilder
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        StorageErrorBuilder {
            engine,
            kind,
            source: error.into(),
            bucket: None,
            path: None,
            context: None,
        }
    }

    /// Returns a boxed closure that creates a storage error from a downstream error.
    ///
    /// This is useful with `.map_err()` for simple error conversion.
    pub fn with<E>(
        engine: &'static str,
        kind: StorageErrorKind,
    ) -> Box<dyn FnOnce(E) -> StorageError + Send + Sync>
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Box::new(move |error: E| StorageError::new(engine, kind, error))
    }

    /// Returns the error kind.
    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    /// Returns whether the object (or bucket) was missing.
    pub fn is_not_found(&self) -> bool {
        self.kind == StorageErrorKind::NotFound
    }

    /// Returns the storage engine name.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// Returns the bucket name, if available.
    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    /// Returns the object path, if available.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Returns additional context, if available.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Returns whether this error is likely retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Returns the span trace captured when this error was created.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.span_trace
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Storage error [{}] from {}", self.kind, self.engine)?;

        if let Some(bucket) = &self.bucket {
            write!(f, " (bucket: {})", bucket)?;
        }

        if let Some(path) = &self.path {
            write!(f, " (path: {})", path)?;
        }

        if let Some(context) = &self.context {
            write!(f, " ({})", context)?;
        }

        write!(f, ": {}", self.source)
    }
}

/// Builder for constructing [`StorageError`] with optional context fields.
#[derive(Debug)]
pub struct StorageErrorBuilder {
    kind: StorageErrorKind,
    engine: &'static str,
    source: Box<dyn StdError + Send + Sync + 'static>,
    bucket: Option<String>,
    path: Option<String>,
    context: Option<String>,
}

impl StorageErrorBuilder {
    /// Set the bucket name.
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Set the object path.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set additional context.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Build the `StorageError`, capturing the current span trace.
    pub fn build(self) -> StorageError {
        StorageError {
            kind: self.kind,
            engine: self.engine,
            bucket: self.bucket,
            path: self.path,
            context: self.context,
            source: self.source,
            span_trace: Box::new(SpanTrace::capture()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let error = StorageError::builder(
            "memory",
            StorageErrorKind::NotFound,
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        )
        .bucket("registry")
        .path("uploads/1234")
        .context("append")
        .build();

        assert_eq!(
            error.to_string(),
            "Storage error [not found] from memory (bucket: registry) (path: uploads/1234) (append): gone"
        );
        assert!(error.is_not_found());
        assert!(!error.is_retryable());
    }

    #[test]
    fn io_errors_are_classified() {
        let error = StorageError::io(
            "local",
            std::io::Error::new(std::io::ErrorKind::AlreadyExists, "exists"),
        );
        assert_eq!(error.kind(), StorageErrorKind::AlreadyExists);

        let error = StorageError::io("local", std::io::Error::other("disk on fire"));
        assert_eq!(error.kind(), StorageErrorKind::Io);
        assert!(error.is_retryable());
    }
}
