//! Core data models used throughout Folio.
//!
//! These types represent committed documents, their media and structured
//! extensions as the client sees them: a read-only projection of what the
//! external document service owns.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::content_id::ContentId;
use crate::history::PatchStack;

/// Opaque document identifier assigned by the document service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub String);

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        DocumentId(s.to_string())
    }
}

/// Community a document is posted into.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RealmId(pub String);

impl fmt::Display for RealmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RealmId {
    fn from(s: &str) -> Self {
        RealmId(s.to_string())
    }
}

/// Where a committed blob lives: a bucket plus a byte range inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobLocator {
    pub bucket: String,
    pub offset: u64,
    pub len: u64,
}

/// A poll attached to a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poll {
    pub options: Vec<String>,
    /// Voting window in hours.
    pub deadline_hours: u64,
}

/// Structured extension carried alongside a document body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Extension {
    #[default]
    None,
    Poll(Poll),
    Repost(DocumentId),
    Proposal(u64),
    Feature,
}

impl Extension {
    pub fn is_poll(&self) -> bool {
        matches!(self, Extension::Poll(_))
    }
}

/// A committed document as returned by the document service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub body: String,
    #[serde(default)]
    pub patches: PatchStack,
    #[serde(default)]
    pub media_map: BTreeMap<ContentId, BlobLocator>,
    #[serde(default)]
    pub extension: Extension,
    #[serde(default)]
    pub parent: Option<DocumentId>,
    #[serde(default)]
    pub children: Vec<DocumentId>,
    #[serde(default)]
    pub realm: Option<RealmId>,
    /// Creation time, unix seconds.
    #[serde(default)]
    pub timestamp: i64,
}

impl Document {
    /// A freshly created document with no edit history.
    pub fn new(id: DocumentId, body: impl Into<String>) -> Self {
        Self {
            id,
            body: body.into(),
            patches: PatchStack::default(),
            media_map: BTreeMap::new(),
            extension: Extension::None,
            parent: None,
            children: Vec::new(),
            realm: None,
            timestamp: 0,
        }
    }

    /// Index of the current version (equal to the number of edits).
    pub fn latest_version(&self) -> usize {
        self.patches.len()
    }
}
