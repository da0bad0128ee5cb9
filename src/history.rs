//! Version reconstruction over an undo log.
//!
//! Every edit pushes the patch that undoes it. `patches[k]` turns the body
//! produced by edit `k + 1` back into the body right after edit `k`, so
//! version `v` of a document is obtained by popping the stack from the top
//! down to index `v`. [`PatchStack`] only offers push and top-down
//! iteration, which keeps that direction out of caller code.

use serde::{Deserialize, Serialize};

use crate::models::Document;
use crate::patch::{self, Patch};

/// One stored edit: when it happened and how to undo it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchEntry {
    /// Edit time, unix seconds.
    pub timestamp: i64,
    pub patch: Patch,
}

/// Undo log of a document, oldest edit at the bottom.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatchStack(Vec<PatchEntry>);

impl PatchStack {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Record an edit by its undo patch.
    pub fn push(&mut self, timestamp: i64, patch: Patch) {
        self.0.push(PatchEntry { timestamp, patch });
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries from the most recent edit down to `version`, each paired
    /// with its index.
    pub fn undo_down_to(&self, version: usize) -> impl Iterator<Item = (usize, &PatchEntry)> + '_ {
        self.0.iter().enumerate().skip(version).rev()
    }

    /// Edit timestamps, oldest first.
    pub fn timestamps(&self) -> impl Iterator<Item = i64> + '_ {
        self.0.iter().map(|e| e.timestamp)
    }
}

/// Result of [`reconstruct`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconstruction {
    pub body: String,
    /// `false` when an undo patch drifted and reconstruction stopped early.
    pub clean: bool,
    /// Number of undo patches applied.
    pub applied: usize,
}

/// Rebuild the body of `doc` as it was at `version`.
///
/// `version >= doc.patches.len()` yields the current body. On drift the
/// partial result reached so far is returned with `clean = false`.
pub fn reconstruct(doc: &Document, version: usize) -> Reconstruction {
    let mut body = doc.body.clone();
    let mut applied = 0;

    for (index, entry) in doc.patches.undo_down_to(version) {
        let result = patch::apply(&entry.patch, &body);
        body = result.text;
        applied += 1;
        if !result.clean {
            tracing::warn!(
                document = %doc.id,
                patch = index,
                target = version,
                "undo patch drifted, stopping reconstruction"
            );
            return Reconstruction {
                body,
                clean: false,
                applied,
            };
        }
    }

    Reconstruction {
        body,
        clean: true,
        applied,
    }
}

/// A version of a document as listed by [`versions`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub version: usize,
    /// When this version came into existence, unix seconds.
    pub timestamp: i64,
    pub latest: bool,
}

/// List all versions of a document, oldest first.
///
/// Version 0 dates from the document's creation; version `k + 1` from the
/// `k`-th edit.
pub fn versions(doc: &Document) -> Vec<VersionInfo> {
    let latest = doc.latest_version();
    std::iter::once(doc.timestamp)
        .chain(doc.patches.timestamps())
        .enumerate()
        .map(|(version, timestamp)| VersionInfo {
            version,
            timestamp,
            latest: version == latest,
        })
        .collect()
}

/// Apply an edit to a document: push its undo patch and replace the body.
pub fn record_edit(doc: &mut Document, new_body: &str, timestamp: i64) {
    let undo = patch::diff(new_body, &doc.body);
    doc.patches.push(timestamp, undo);
    doc.body = new_body.to_string();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentId;

    fn edited(bodies: &[&str]) -> Document {
        let mut doc = Document::new(DocumentId::from("7"), bodies[0]);
        doc.timestamp = 100;
        for (i, body) in bodies.iter().enumerate().skip(1) {
            record_edit(&mut doc, body, 100 + i as i64);
        }
        doc
    }

    #[test]
    fn test_latest_version_is_body() {
        let doc = edited(&["v0", "v1 text", "v2 text here"]);
        let r = reconstruct(&doc, doc.latest_version());
        assert_eq!(r.body, doc.body);
        assert!(r.clean);
        assert_eq!(r.applied, 0);
    }

    #[test]
    fn test_undo_chain() {
        let v0 = "First draft of the post.";
        let v1 = "First draft of the post, now with #tags.";
        let v2 = "Second take: the post, now with #tags and @mentions.";
        let doc = edited(&[v0, v1, v2]);
        assert_eq!(doc.patches.len(), 2);
        assert_eq!(reconstruct(&doc, 2).body, v2);
        assert_eq!(reconstruct(&doc, 1).body, v1);
        assert_eq!(reconstruct(&doc, 0).body, v0);
    }

    #[test]
    fn test_version_beyond_latest_is_current() {
        let doc = edited(&["a", "b"]);
        assert_eq!(reconstruct(&doc, 10).body, "b");
    }

    #[test]
    fn test_drift_stops_early() {
        let mut doc = edited(&[
            "the original opening line of the text",
            "the edited opening line of the text",
            "the edited opening line of the text, extended at the end",
        ]);
        // Corrupt the body so the older undo patch no longer locates.
        doc.body = "completely unrelated, extended at the end".to_string();
        let r = reconstruct(&doc, 0);
        assert!(!r.clean);
        assert!(r.applied >= 1);
    }

    #[test]
    fn test_versions_listing() {
        let doc = edited(&["a", "b", "c"]);
        let list = versions(&doc);
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].timestamp, 100);
        assert_eq!(list[2].timestamp, 102);
        assert!(list[2].latest);
        assert!(!list[0].latest);
    }

    #[test]
    fn test_stack_iterates_top_down() {
        let doc = edited(&["a", "b", "c", "d"]);
        let order: Vec<usize> = doc.patches.undo_down_to(1).map(|(i, _)| i).collect();
        assert_eq!(order, vec![2, 1]);
    }
}
