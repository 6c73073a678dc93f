//! # Versioned Container Registry
//!
//! This crate implements an OCI container registry whose repositories are
//! immutable, numbered versions over a shared, content-addressed store,
//! served through the
//! [OCI Distribution Specification](https://github.com/opencontainers/distribution-spec)
//! API.
//!
//! ## Features
//!
//! - Deduplicated artifact storage keyed by sha256
//! - Chunked and monolithic blob uploads
//! - Docker v2 and OCI image manifest ingestion
//! - Repository versions with tag resolution
//! - Task dispatch for sync, copy, and build requests
//! - Pluggable storage backend via the `storage` crate
//!
//! ## Example
//!
//! ```no_run
//! use registry::RegistryBuilder;
//! use storage::MemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = MemoryStorage::with_buckets(&["registry"]);
//! let registry = RegistryBuilder::new()
//!     .storage(storage.into())
//!     .bucket("registry")
//!     .build();
//!
//! registry.create_repository("library/busybox").await?;
//!
//! // Serve the API with axum or any tower-compatible server
//! let _router = registry.router();
//! # Ok(())
//! # }
//! ```

mod api;
mod blob;
pub mod config;
pub mod content;
pub mod content_store;
pub mod db;
pub mod digest;
mod error;
pub mod ingest;
mod manifest;
mod registry;
pub mod reservation;
pub mod resolver;
pub mod tasks;
pub mod upload;
pub mod version;

pub use api::{RegistryBuilder, router};
pub use config::{RegistryConfig, ServerConfig};
pub use digest::Digest;
pub use error::{RegistryError, RegistryResult};
pub use registry::{BlobInfo, Registry, validate_repository_name};
pub use resolver::Reference;
