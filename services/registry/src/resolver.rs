//! Reference lookup within a repository version.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::content::{Blob, Content, Manifest, RepositoryVersion, Tag};
use crate::db::Database;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};

static REFERENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^/^&*%!~@#+=?]+$").expect("to create a regex from pattern"));

static TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("to create a regex from pattern")
});

/// Validate a tag name for creation.
pub fn validate_tag(name: &str) -> RegistryResult<()> {
    if TAG_RE.is_match(name) {
        Ok(())
    } else {
        Err(RegistryError::InvalidReference(name.to_owned()))
    }
}

/// How a client names a manifest: by digest or by tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    /// `sha256:<hex>`
    Digest(Digest),
    /// Any other path segment.
    Tag(String),
}

impl FromStr for Reference {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with("sha256:") {
            return s.parse().map(Reference::Digest);
        }
        if REFERENCE_RE.is_match(s) {
            Ok(Reference::Tag(s.to_owned()))
        } else {
            Err(RegistryError::InvalidReference(s.to_owned()))
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Digest(digest) => digest.fmt(f),
            Reference::Tag(name) => f.write_str(name),
        }
    }
}

/// Finds manifests, blobs and tags that belong to a version.
#[derive(Debug, Clone)]
pub struct TagResolver {
    db: Arc<dyn Database>,
}

impl TagResolver {
    /// Resolve against `db`.
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    async fn tags_in(&self, version: &RepositoryVersion) -> RegistryResult<Vec<Tag>> {
        Ok(self
            .db
            .content(&version.content)
            .await?
            .into_iter()
            .filter_map(|unit| match unit {
                Content::Tag(tag) => Some(tag),
                _ => None,
            })
            .collect())
    }

    /// The manifest `reference` names in `version`.
    #[tracing::instrument(skip(self, version), fields(version = version.number, %reference))]
    pub async fn resolve(
        &self,
        version: &RepositoryVersion,
        reference: &Reference,
    ) -> RegistryResult<Manifest> {
        match reference {
            Reference::Digest(digest) => {
                let manifest = self.db.manifest_by_digest(digest).await?;
                if !version.contains(&manifest.id) {
                    return Err(RegistryError::ManifestNotFound(digest.to_string()));
                }
                Ok(manifest)
            }
            Reference::Tag(name) => {
                let tag = self.tag(version, name).await?;
                self.db
                    .content(&BTreeSet::from([tag.tagged_manifest]))
                    .await?
                    .into_iter()
                    .find_map(|unit| match unit {
                        Content::Manifest(manifest) => Some(manifest),
                        _ => None,
                    })
                    .ok_or_else(|| RegistryError::ManifestNotFound(name.clone()))
            }
        }
    }

    /// The tag named `name` in `version`.
    pub async fn tag(&self, version: &RepositoryVersion, name: &str) -> RegistryResult<Tag> {
        self.tags_in(version)
            .await?
            .into_iter()
            .find(|tag| tag.name == name)
            .ok_or_else(|| RegistryError::TagNotFound(name.to_owned()))
    }

    /// The blob with `digest` in `version`.
    pub async fn blob(&self, version: &RepositoryVersion, digest: &Digest) -> RegistryResult<Blob> {
        let blob = self.db.blob_by_digest(digest).await?;
        if !version.contains(&blob.id) {
            return Err(RegistryError::BlobNotFound(digest.to_string()));
        }
        Ok(blob)
    }

    /// Sorted, de-duplicated tag names in `version`.
    pub async fn tags(&self, version: &RepositoryVersion) -> RegistryResult<Vec<String>> {
        let mut names: Vec<String> = self
            .tags_in(version)
            .await?
            .into_iter()
            .map(|tag| tag.name)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{ContentId, RepositoryId};
    use crate::db::MemoryDatabase;

    #[test]
    fn parse_references() {
        let digest = Digest::of(b"manifest");
        assert_eq!(
            digest.to_string().parse::<Reference>().unwrap(),
            Reference::Digest(digest)
        );
        assert_eq!(
            "v1.0".parse::<Reference>().unwrap(),
            Reference::Tag("v1.0".into())
        );
        assert!(matches!(
            "sha256:short".parse::<Reference>(),
            Err(RegistryError::InvalidDigest(_))
        ));
        for bad in ["a/b", "tag@x", "what?", "50%"] {
            assert!(
                matches!(bad.parse::<Reference>(), Err(RegistryError::InvalidReference(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn tag_names() {
        assert!(validate_tag("latest").is_ok());
        assert!(validate_tag("1.0_rc-2").is_ok());
        assert!(validate_tag(".hidden").is_err());
        assert!(validate_tag("").is_err());
    }

    fn manifest(data: &str) -> Manifest {
        Manifest {
            id: ContentId::new(),
            digest: Digest::of(data.as_bytes()),
            media_type: crate::digest::media_type::MANIFEST_V2.into(),
            schema_version: 2,
            config_blob: None,
            data: data.into(),
            annotations: Default::default(),
            compressed_image_size: None,
        }
    }

    #[tokio::test]
    async fn resolves_only_within_version() {
        let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
        let inside = db.insert_manifest(manifest("{\"a\":1}")).await.unwrap();
        let outside = db.insert_manifest(manifest("{\"b\":2}")).await.unwrap();
        let tag = db
            .insert_tag(Tag {
                id: ContentId::new(),
                name: "latest".into(),
                tagged_manifest: inside.id,
            })
            .await
            .unwrap();

        let mut version = RepositoryVersion::initial(RepositoryId::new());
        version.content = [inside.id, tag.id].into();

        let resolver = TagResolver::new(db);
        let by_tag = resolver
            .resolve(&version, &Reference::Tag("latest".into()))
            .await
            .unwrap();
        assert_eq!(by_tag, inside);

        let by_digest = resolver
            .resolve(&version, &Reference::Digest(inside.digest.clone()))
            .await
            .unwrap();
        assert_eq!(by_digest.id, inside.id);

        assert!(matches!(
            resolver
                .resolve(&version, &Reference::Digest(outside.digest.clone()))
                .await,
            Err(RegistryError::ManifestNotFound(_))
        ));
        assert!(matches!(
            resolver
                .resolve(&version, &Reference::Tag("missing".into()))
                .await,
            Err(RegistryError::TagNotFound(_))
        ));
        assert_eq!(resolver.tags(&version).await.unwrap(), vec!["latest"]);
    }
}
