//! Registry configuration.

use serde::Deserialize;
use storage::StorageConfig;

const DEFAULT_BUCKET: &str = "registry";
const DEFAULT_MAX_BODY_SIZE: usize = 512 * 1024 * 1024;

/// Settings for the registry service.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RegistryConfig {
    /// Storage bucket holding uploads and artifacts.
    pub bucket: String,

    /// Origin prepended to `Location` headers, e.g. `https://registry.example.com`.
    ///
    /// Locations are relative when unset.
    pub content_origin: Option<String>,

    /// Largest request body accepted, in bytes.
    pub max_body_size: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            bucket: DEFAULT_BUCKET.to_owned(),
            content_origin: None,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl RegistryConfig {
    /// `path` as a client-facing location.
    pub fn location(&self, path: &str) -> String {
        match &self.content_origin {
            Some(origin) => format!("{}{path}", origin.trim_end_matches('/')),
            None => path.to_owned(),
        }
    }
}

fn default_storage() -> StorageConfig {
    StorageConfig::Memory
}

/// Top-level configuration file for the registry server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    /// Registry settings.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Byte store backend.
    #[serde(default = "default_storage")]
    pub storage: StorageConfig,

    /// Address to listen on when not given on the command line.
    #[serde(default)]
    pub listen: Option<std::net::SocketAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            storage: default_storage(),
            listen: None,
        }
    }
}
