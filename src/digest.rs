//! Content digests.
//!
//! Published digests (fingerprints, integrity attributes) use the
//! environment's configured algorithm; internal cache keys always use blake3.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512};

/// Hash algorithm used for published asset digests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    #[default]
    Sha256,
    Sha512,
    Blake3,
}

impl DigestAlgorithm {
    /// Name used in integrity attributes and manifests.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
            Self::Blake3 => "blake3",
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
            Self::Blake3 => blake3::hash(data).as_bytes().to_vec(),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Hex-encoded blake3 of `data`, used for cache keys.
#[inline]
pub fn key_digest<T: AsRef<[u8]> + ?Sized>(data: &T) -> String {
    blake3::hash(data.as_ref()).to_hex().to_string()
}

/// Hex-encoded blake3 over several parts, each length-prefixed.
pub fn key_digest_parts<I, T>(parts: I) -> String
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        let part = part.as_ref();
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hasher.finalize().to_hex().to_string()
}

/// `<algorithm>-<base64 digest>`, suitable for subresource integrity.
pub fn integrity(name: &str, digest: &[u8]) -> String {
    format!("{name}-{}", STANDARD.encode(digest))
}

/// Insert `-<hexdigest>` before the final extension of `filename`.
///
/// `app.js` becomes `app-<hex>.js`; a name without an extension gets the
/// digest appended.
pub fn fingerprint_path(filename: &str, hexdigest: &str) -> String {
    let start = filename.rfind('/').map_or(0, |i| i + 1);
    match filename[start..].rfind('.') {
        Some(dot) if dot > 0 => {
            let (stem, ext) = filename.split_at(start + dot);
            format!("{stem}-{hexdigest}{ext}")
        }
        _ => format!("{filename}-{hexdigest}"),
    }
}

/// Serde adapter storing bytes as base64 text.
pub(crate) mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
