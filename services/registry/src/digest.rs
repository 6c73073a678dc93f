//! Content digests and the media types the registry understands.

use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use sha2::Digest as _;

use crate::error::RegistryError;

/// Media type constants from the Docker and OCI distribution protocols.
pub mod media_type {
    /// Docker image manifest, schema 1.
    pub const MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";

    /// Docker image manifest, schema 1, signed.
    pub const MANIFEST_V1_SIGNED: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws";

    /// Docker image manifest, schema 2.
    pub const MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";

    /// Docker manifest list.
    pub const MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

    /// OCI image manifest.
    pub const MANIFEST_OCI: &str = "application/vnd.oci.image.manifest.v1+json";

    /// OCI image index.
    pub const INDEX_OCI: &str = "application/vnd.oci.image.index.v1+json";

    /// A compressed filesystem layer.
    pub const REGULAR_BLOB: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

    /// Content type used when serving blobs.
    pub const BLOB_CONTENT_TYPE: &str = "application/octet-stream";

    /// Every manifest media type the registry recognizes.
    pub const MANIFEST_TYPES: &[&str] = &[
        MANIFEST_V1,
        MANIFEST_V1_SIGNED,
        MANIFEST_V2,
        MANIFEST_LIST,
        MANIFEST_OCI,
        INDEX_OCI,
    ];

    /// Manifest media types accepted on push.
    pub const INGESTIBLE: &[&str] = &[MANIFEST_V2, MANIFEST_OCI];
}

const ALGORITHM: &str = "sha256";

/// The empty gzip'd tar layer that schema 1 images reference for empty layers.
pub const EMPTY_BLOB: &str =
    "sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4";

/// Bytes of [`EMPTY_BLOB`].
pub const EMPTY_BLOB_BYTES: [u8; 32] = [
    31, 139, 8, 0, 0, 9, 110, 136, 0, 255, 98, 24, 5, 163, 96, 20, 140, 88, 0, 8, 0, 0, 255, 255,
    46, 175, 181, 239, 0, 4, 0, 0,
];

/// A sha256 content digest, written `sha256:<64 lowercase hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    hex: String,
}

impl Digest {
    /// Digest of a complete byte string.
    pub fn of(data: &[u8]) -> Self {
        Self {
            hex: hex::encode(sha2::Sha256::digest(data)),
        }
    }

    /// The hex portion of the digest.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Byte store key for an artifact with this digest.
    pub fn artifact_path(&self) -> Utf8PathBuf {
        let (head, tail) = self.hex.split_at(2);
        Utf8PathBuf::from(format!("artifact/{head}/{tail}"))
    }

    /// Whether this is the well-known empty layer.
    pub fn is_empty_blob(&self) -> bool {
        self.to_string() == EMPTY_BLOB
    }

    fn from_hex(hex: &str) -> Option<Self> {
        (hex.len() == 64 && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))).then(
            || Self {
                hex: hex.to_owned(),
            },
        )
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ALGORITHM}:{}", self.hex)
    }
}

impl FromStr for Digest {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix("sha256:")
            .and_then(Digest::from_hex)
            .ok_or_else(|| RegistryError::InvalidDigest(s.to_owned()))
    }
}

impl TryFrom<String> for Digest {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.to_string()
    }
}

/// Hex digests of the same bytes under every supported algorithm.
///
/// Only `sha256` identifies content; the rest are kept for cross-checking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestSet {
    /// sha1 hex digest.
    pub sha1: String,
    /// sha256 digest, the content identity.
    pub sha256: Digest,
    /// sha384 hex digest.
    pub sha384: String,
    /// sha512 hex digest.
    pub sha512: String,
}

impl DigestSet {
    /// Hash a complete byte string.
    pub fn of(data: &[u8]) -> Self {
        let mut hashers = Hashers::default();
        hashers.update(data);
        hashers.finish()
    }
}

/// Running hashers for all supported algorithms.
#[derive(Debug, Clone, Default)]
pub struct Hashers {
    sha1: sha1::Sha1,
    sha256: sha2::Sha256,
    sha384: sha2::Sha384,
    sha512: sha2::Sha512,
}

impl Hashers {
    /// Feed more bytes.
    pub fn update(&mut self, data: &[u8]) {
        self.sha1.update(data);
        self.sha256.update(data);
        self.sha384.update(data);
        self.sha512.update(data);
    }

    /// The sha256 digest of everything fed so far, without consuming the hashers.
    pub fn primary(&self) -> Digest {
        Digest {
            hex: hex::encode(self.sha256.clone().finalize()),
        }
    }

    /// Finish all hashers.
    pub fn finish(self) -> DigestSet {
        DigestSet {
            sha1: hex::encode(self.sha1.finalize()),
            sha256: Digest {
                hex: hex::encode(self.sha256.finalize()),
            },
            sha384: hex::encode(self.sha384.finalize()),
            sha512: hex::encode(self.sha512.finalize()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let raw = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        let digest: Digest = raw.parse().unwrap();
        assert_eq!(digest.to_string(), raw);
        assert_eq!(digest, Digest::of(b""));
        assert_eq!(
            digest.artifact_path(),
            "artifact/e3/b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn rejects_malformed_digests() {
        for raw in [
            "sha256:abc",
            "md5:d41d8cd98f00b204e9800998ecf8427e",
            "sha256:E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855",
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
        ] {
            assert!(
                matches!(raw.parse::<Digest>(), Err(RegistryError::InvalidDigest(_))),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn incremental_hashing_matches_whole() {
        let mut hashers = Hashers::default();
        hashers.update(b"hello ");
        assert_eq!(hashers.primary(), Digest::of(b"hello "));
        hashers.update(b"world");
        let set = hashers.finish();
        assert_eq!(set, DigestSet::of(b"hello world"));
        assert_eq!(set.sha1, "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");
    }

    #[test]
    fn empty_blob_constant() {
        assert_eq!(Digest::of(&EMPTY_BLOB_BYTES).to_string(), EMPTY_BLOB);
        assert!(EMPTY_BLOB.parse::<Digest>().unwrap().is_empty_blob());
    }
}
