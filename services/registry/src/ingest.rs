//! Manifest ingestion.
//!
//! A pushed manifest is checked, cross-referenced against blobs the registry
//! already holds, stored, and then published together with its tag in a
//! single new repository version. Rows written before that publication are
//! unreachable from pulls, so a failure at any step leaves the previously
//! published version as the visible state.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;

use crate::content::{BlobManifest, ContentId, Manifest, Repository, Tag};
use crate::content_store::ContentStore;
use crate::db::Database;
use crate::digest::{Digest, media_type};
use crate::error::{RegistryError, RegistryResult};
use crate::resolver::Reference;
use crate::version::{Removal, Versions};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageManifest {
    schema_version: u32,
    #[serde(default)]
    media_type: Option<String>,
    config: Descriptor,
    #[serde(default)]
    layers: Vec<Descriptor>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    digest: String,
}

fn parse_digest(raw: &str) -> RegistryResult<Digest> {
    raw.parse()
        .map_err(|_| RegistryError::InvalidManifest(format!("invalid descriptor digest: {raw}")))
}

/// Media type without parameters such as `charset`.
fn essence(content_type: &str) -> &str {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
}

/// Turns pushed manifest bytes into published registry content.
#[derive(Debug, Clone)]
pub struct ManifestProcessor {
    db: Arc<dyn Database>,
    store: ContentStore,
    versions: Versions,
}

impl ManifestProcessor {
    /// A processor writing through `store` and publishing through `versions`.
    pub fn new(db: Arc<dyn Database>, store: ContentStore, versions: Versions) -> Self {
        Self {
            db,
            store,
            versions,
        }
    }

    /// Ingest `raw` as the manifest named `reference` in `repository`.
    #[tracing::instrument(skip(self, repository, raw), fields(repository = %repository.name, %reference, size = raw.len()))]
    pub async fn ingest(
        &self,
        repository: &Repository,
        reference: &Reference,
        raw: Bytes,
        content_type: &str,
    ) -> RegistryResult<Manifest> {
        let content_type = essence(content_type);
        if !media_type::INGESTIBLE.contains(&content_type) {
            return Err(RegistryError::UnsupportedManifestType(
                content_type.to_owned(),
            ));
        }

        let digest = Digest::of(&raw);
        if let Reference::Digest(expected) = reference {
            if *expected != digest {
                return Err(RegistryError::DigestMismatch {
                    expected: expected.to_string(),
                    actual: digest.to_string(),
                });
            }
        }

        let parsed: ImageManifest = serde_json::from_slice(&raw)
            .map_err(|error| RegistryError::InvalidManifest(error.to_string()))?;
        if parsed.schema_version != 2 {
            return Err(RegistryError::InvalidManifest(format!(
                "unsupported schema version {}",
                parsed.schema_version
            )));
        }
        if let Some(declared) = &parsed.media_type {
            if declared != content_type {
                return Err(RegistryError::InvalidManifest(format!(
                    "mediaType {declared} does not match content type {content_type}"
                )));
            }
        }

        let config_digest = parse_digest(&parsed.config.digest)?;
        let config = match self.db.blob_by_digest(&config_digest).await {
            Ok(blob) => blob,
            Err(error) if error.is_not_found() => {
                return Err(RegistryError::UnresolvedReference(config_digest.to_string()));
            }
            Err(error) => return Err(error.into()),
        };

        let layer_digests = parsed
            .layers
            .iter()
            .map(|layer| parse_digest(&layer.digest))
            .collect::<RegistryResult<Vec<_>>>()?;
        let layers = self.db.blobs_by_digests(&layer_digests).await?;
        for missing in layer_digests
            .iter()
            .filter(|digest| !layers.iter().any(|blob| &blob.digest == *digest))
        {
            tracing::debug!(layer = %missing, "skipping unresolved layer");
        }

        let mut compressed_size = 0;
        for layer in &layers {
            compressed_size += self.store.artifact(&layer.digest).await?.size;
        }

        let data = String::from_utf8(raw.to_vec())
            .map_err(|error| RegistryError::InvalidManifest(error.to_string()))?;
        let artifact = self.store.put(raw).await?;

        let manifest = Manifest {
            id: ContentId::new(),
            digest: digest.clone(),
            media_type: content_type.to_owned(),
            schema_version: parsed.schema_version,
            config_blob: Some(config.id),
            data,
            annotations: parsed.annotations,
            compressed_image_size: Some(compressed_size),
        };
        let manifest = match self.db.insert_manifest(manifest).await {
            Ok(manifest) => manifest,
            Err(error) if error.is_duplicate() => self.db.manifest_by_digest(&digest).await?,
            Err(error) => return Err(error.into()),
        };
        self.store.link(manifest.id, &artifact).await?;

        let links: Vec<BlobManifest> = layers
            .iter()
            .map(|blob| BlobManifest {
                manifest: manifest.id,
                blob: blob.id,
            })
            .collect();
        self.db.insert_blob_manifests(&links).await?;

        let tag = match reference {
            Reference::Tag(name) => Some(self.tag_row(name, manifest.id).await?),
            Reference::Digest(_) => None,
        };

        let mut version = self.versions.new_version(repository).await?;
        version.add_content([manifest.id]);
        if let Some(tag) = &tag {
            let previous = version.tags_named(&tag.name).await?;
            version.remove_content(Removal::Units(previous));
            version.add_content([tag.id]);
        }
        let published = version.commit().await?;
        tracing::debug!(version = published.number, %digest, "manifest ingested");

        Ok(manifest)
    }

    /// The tag row `(name, manifest)`, created if missing.
    pub(crate) async fn tag_row(&self, name: &str, manifest: ContentId) -> RegistryResult<Tag> {
        let tag = Tag {
            id: ContentId::new(),
            name: name.to_owned(),
            tagged_manifest: manifest,
        };
        match self.db.insert_tag(tag).await {
            Ok(tag) => Ok(tag),
            Err(error) if error.is_duplicate() => {
                Ok(self.db.tag_by_name_and_manifest(name, manifest).await?)
            }
            Err(error) => Err(error.into()),
        }
    }
}
