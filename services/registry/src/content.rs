//! Registry data model: artifacts, content units, repositories and versions.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::digest::{Digest, DigestSet};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// A fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

id_type!(
    /// Identifies a content unit of any kind.
    ContentId
);
id_type!(
    /// Identifies an artifact.
    ArtifactId
);
id_type!(
    /// Identifies a repository.
    RepositoryId
);
id_type!(
    /// Identifies an upload session.
    UploadId
);

/// A stored byte sequence, identified by its sha256 digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Row identifier.
    pub id: ArtifactId,
    /// Digests computed over the bytes; sha256 is unique.
    pub digests: DigestSet,
    /// Length in bytes.
    pub size: u64,
    /// Key of the bytes in the byte store.
    pub path: Utf8PathBuf,
    /// When the bytes were first stored.
    pub created: DateTime<Utc>,
}

impl Artifact {
    /// The identifying digest.
    pub fn digest(&self) -> &Digest {
        &self.digests.sha256
    }
}

/// An image layer or config object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    /// Content identifier.
    pub id: ContentId,
    /// Digest of the blob bytes, unique per blob.
    pub digest: Digest,
    /// Media type recorded for the blob.
    pub media_type: String,
}

/// An image manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Content identifier.
    pub id: ContentId,
    /// Digest of the manifest JSON.
    pub digest: Digest,
    /// Manifest media type, e.g. docker v2 or OCI.
    pub media_type: String,
    /// The `schemaVersion` field.
    pub schema_version: u32,
    /// The config blob, when the manifest names one.
    pub config_blob: Option<ContentId>,
    /// The manifest JSON exactly as pushed.
    pub data: String,
    /// The manifest's `annotations` object.
    pub annotations: BTreeMap<String, String>,
    /// Sum of the sizes of the resolved layers.
    pub compressed_image_size: Option<u64>,
}

/// Links a manifest to a layer blob it lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobManifest {
    /// The listing manifest.
    pub manifest: ContentId,
    /// The listed layer.
    pub blob: ContentId,
}

/// Links a content unit to the artifact holding its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentArtifact {
    /// The content unit.
    pub content: ContentId,
    /// The artifact holding its bytes.
    pub artifact: ArtifactId,
    /// Name of the bytes within the unit, the digest string for blobs.
    pub relative_path: String,
}

/// A name pointing at one manifest.
///
/// Rows are immutable; retagging creates a new row and changes which row a
/// repository version contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    /// Content identifier.
    pub id: ContentId,
    /// Tag name, e.g. `latest`.
    pub name: String,
    /// The manifest this tag points at.
    pub tagged_manifest: ContentId,
}

/// The kind of a content unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentKind {
    /// A [`Blob`].
    Blob,
    /// A [`Manifest`].
    Manifest,
    /// A [`Tag`].
    Tag,
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentKind::Blob => f.write_str("blob"),
            ContentKind::Manifest => f.write_str("manifest"),
            ContentKind::Tag => f.write_str("tag"),
        }
    }
}

/// Any content unit a repository version can hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    /// A layer or config blob.
    Blob(Blob),
    /// An image manifest.
    Manifest(Manifest),
    /// A tag.
    Tag(Tag),
}

impl Content {
    /// The unit's content identifier.
    pub fn id(&self) -> ContentId {
        match self {
            Content::Blob(blob) => blob.id,
            Content::Manifest(manifest) => manifest.id,
            Content::Tag(tag) => tag.id,
        }
    }

    /// Which kind of unit this is.
    pub fn kind(&self) -> ContentKind {
        match self {
            Content::Blob(_) => ContentKind::Blob,
            Content::Manifest(_) => ContentKind::Manifest,
            Content::Tag(_) => ContentKind::Tag,
        }
    }

    /// The tag, if this unit is one.
    pub fn as_tag(&self) -> Option<&Tag> {
        match self {
            Content::Tag(tag) => Some(tag),
            _ => None,
        }
    }

    /// The manifest, if this unit is one.
    pub fn as_manifest(&self) -> Option<&Manifest> {
        match self {
            Content::Manifest(manifest) => Some(manifest),
            _ => None,
        }
    }
}

impl From<Blob> for Content {
    fn from(value: Blob) -> Self {
        Content::Blob(value)
    }
}

impl From<Manifest> for Content {
    fn from(value: Manifest) -> Self {
        Content::Manifest(value)
    }
}

impl From<Tag> for Content {
    fn from(value: Tag) -> Self {
        Content::Tag(value)
    }
}

/// A named collection of versioned content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Repository {
    /// Row identifier.
    pub id: RepositoryId,
    /// Unique name, e.g. `library/busybox`.
    pub name: String,
    /// When the repository was created.
    pub created: DateTime<Utc>,
}

/// An immutable snapshot of a repository's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryVersion {
    /// The owning repository.
    pub repository: RepositoryId,
    /// Version number, starting at 0 and increasing by one per publish.
    pub number: u64,
    /// Every unit in this version.
    pub content: BTreeSet<ContentId>,
    /// Units present here but not in the previous version.
    pub added: BTreeSet<ContentId>,
    /// Units present in the previous version but not here.
    pub removed: BTreeSet<ContentId>,
    /// When the version was published.
    pub created: DateTime<Utc>,
}

impl RepositoryVersion {
    /// The empty version every repository starts with.
    pub fn initial(repository: RepositoryId) -> Self {
        Self {
            repository,
            number: 0,
            content: BTreeSet::new(),
            added: BTreeSet::new(),
            removed: BTreeSet::new(),
            created: Utc::now(),
        }
    }

    /// Whether this version holds `id`.
    pub fn contains(&self, id: &ContentId) -> bool {
        self.content.contains(id)
    }
}
