//! Content addressing for attached blobs.
//!
//! A blob's identity is the first four bytes of its SHA-256 digest, rendered
//! as eight lowercase hex characters. Identical bytes always map to the same
//! [`ContentId`], which is what makes re-attaching an image idempotent and
//! retried uploads safe.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of digest bytes kept in a content id.
pub const CONTENT_ID_BYTES: usize = 4;

/// Short, deterministic identifier of a blob (`/blob/<id>` in document text).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentId(String);

impl ContentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The in-text reference path for this blob.
    pub fn blob_path(&self) -> String {
        format!("/blob/{}", self.0)
    }
}

/// Derive the content id of a byte slice.
pub fn address_of(bytes: &[u8]) -> ContentId {
    let digest = Sha256::digest(bytes);
    ContentId(hex::encode(&digest[..CONTENT_ID_BYTES]))
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = hex::decode(s)
            .map_err(|e| anyhow::anyhow!("invalid content id '{}': {}", s, e))?;
        if decoded.len() != CONTENT_ID_BYTES {
            anyhow::bail!(
                "invalid content id '{}': expected {} hex characters",
                s,
                CONTENT_ID_BYTES * 2
            );
        }
        Ok(ContentId(hex::encode(decoded)))
    }
}

impl TryFrom<String> for ContentId {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContentId> for String {
    fn from(id: ContentId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_is_deterministic() {
        let bytes = b"the same picture, twice";
        assert_eq!(address_of(bytes), address_of(bytes));
    }

    #[test]
    fn test_address_shape() {
        let id = address_of(b"hello");
        assert_eq!(id.as_str().len(), 8);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        // sha256("hello") = 2cf24dba...
        assert_eq!(id.as_str(), "2cf24dba");
        assert_eq!(id.blob_path(), "/blob/2cf24dba");
    }

    #[test]
    fn test_different_bytes_differ() {
        assert_ne!(address_of(b"a"), address_of(b"b"));
    }

    #[test]
    fn test_parse_normalizes_case() {
        let id: ContentId = "DEADBEEF".parse().unwrap();
        assert_eq!(id.as_str(), "deadbeef");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!("xyz".parse::<ContentId>().is_err());
        assert!("deadbeefaa".parse::<ContentId>().is_err());
        assert!("".parse::<ContentId>().is_err());
    }

    #[test]
    fn test_serde_transparent() {
        let id = address_of(b"x");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let back: ContentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
