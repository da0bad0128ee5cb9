//! In-progress authoring state for one document.
//!
//! A [`Draft`] holds the working text, the caret, the blobs attached so far
//! (keyed by content id) and the structured extension. It is a plain value:
//! the autosave session in [`crate::recovery`] wraps it, and
//! [`crate::publish::PublishCoordinator`] borrows it for submission.

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{CostConfig, LimitsConfig};
use crate::content_id::{self, ContentId};
use crate::error::ValidationError;
use crate::image_fit;
use crate::models::{BlobLocator, Document, DocumentId, Extension, RealmId};
use crate::tokens;

/// What a draft will become once published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DraftTarget {
    NewPost,
    Comment {
        parent: DocumentId,
    },
    Edit {
        id: DocumentId,
        previous_body: String,
        existing_media: BTreeMap<ContentId, BlobLocator>,
    },
}

impl DraftTarget {
    pub fn recovery_key(&self) -> RecoveryKey {
        match self {
            DraftTarget::NewPost => RecoveryKey("draft:new".to_string()),
            DraftTarget::Comment { parent } => RecoveryKey(format!("draft:comment:{}", parent)),
            DraftTarget::Edit { id, .. } => RecoveryKey(format!("draft:edit:{}", id)),
        }
    }
}

/// Key of the local recovery record for a draft.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecoveryKey(String);

impl RecoveryKey {
    pub fn new(key: impl Into<String>) -> Self {
        RecoveryKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Draft {
    working_text: String,
    /// Insertion point, in chars.
    caret: usize,
    pending_blobs: BTreeMap<ContentId, Vec<u8>>,
    pub extension: Extension,
    pub target_realm: Option<RealmId>,
    target: DraftTarget,
}

impl Draft {
    pub fn new(target: DraftTarget) -> Self {
        Self {
            working_text: String::new(),
            caret: 0,
            pending_blobs: BTreeMap::new(),
            extension: Extension::None,
            target_realm: None,
            target,
        }
    }

    /// A draft for a reply to `parent`.
    pub fn comment(parent: DocumentId) -> Self {
        Self::new(DraftTarget::Comment { parent })
    }

    /// A draft for editing a committed document, seeded with its body.
    pub fn edit(doc: &Document) -> Self {
        let mut draft = Self::new(DraftTarget::Edit {
            id: doc.id.clone(),
            previous_body: doc.body.clone(),
            existing_media: doc.media_map.clone(),
        });
        draft.set_text(doc.body.clone());
        draft.extension = doc.extension.clone();
        draft.target_realm = doc.realm.clone();
        draft
    }

    pub fn text(&self) -> &str {
        &self.working_text
    }

    pub fn caret(&self) -> usize {
        self.caret
    }

    pub fn target(&self) -> &DraftTarget {
        &self.target
    }

    pub fn recovery_key(&self) -> RecoveryKey {
        self.target.recovery_key()
    }

    pub fn pending_blobs(&self) -> &BTreeMap<ContentId, Vec<u8>> {
        &self.pending_blobs
    }

    /// Replace the working text; the caret moves to the end.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.working_text = text.into();
        self.caret = self.working_text.chars().count();
    }

    /// Move the caret, clamped to the text length.
    pub fn set_caret(&mut self, caret: usize) {
        self.caret = caret.min(self.working_text.chars().count());
    }

    /// Attach an image and insert its reference at the caret.
    ///
    /// Images larger than `limits.max_blob_bytes` are re-encoded first. The
    /// content id is taken from the bytes that will be uploaded, so
    /// attaching the same picture twice keeps a single entry.
    pub fn attach(
        &mut self,
        bytes: &[u8],
        limits: &LimitsConfig,
    ) -> Result<ContentId, ValidationError> {
        let fitted = if bytes.len() > limits.max_blob_bytes {
            image_fit::fit(bytes, limits.max_blob_bytes)
        } else {
            image_fit::dimensions(bytes).map(|(width, height)| image_fit::FittedImage {
                bytes: bytes.to_vec(),
                width,
                height,
                iterations: 0,
            })
        }
        .map_err(|e| ValidationError::UnreadableImage(e.to_string()))?;

        let id = content_id::address_of(&fitted.bytes);
        let reference = format!(
            "![{}x{}, {}kb]({})",
            fitted.width,
            fitted.height,
            fitted.bytes.len().div_ceil(1024),
            id.blob_path()
        );
        tracing::debug!(
            blob = %id,
            len = fitted.bytes.len(),
            reencoded = fitted.iterations > 0,
            "attached image"
        );
        self.pending_blobs.entry(id.clone()).or_insert(fitted.bytes);
        self.insert_at_caret(&reference);
        Ok(id)
    }

    /// Drop a pending blob and every image reference to it.
    pub fn detach(&mut self, id: &ContentId) -> bool {
        let removed = self.pending_blobs.remove(id).is_some();
        let pattern = format!(r"!\[[^\]]*\]\({}\)", regex::escape(&id.blob_path()));
        if let Ok(re) = Regex::new(&pattern) {
            let stripped = re.replace_all(&self.working_text, "").into_owned();
            if stripped != self.working_text {
                self.set_text(stripped);
            }
        }
        removed
    }

    /// Pending blobs the text still references, in order of appearance.
    pub fn referenced_blobs(&self) -> Vec<(&ContentId, &[u8])> {
        tokens::blob_references(&self.working_text)
            .iter()
            .filter_map(|raw| raw.parse::<ContentId>().ok())
            .filter_map(|id| self.pending_blobs.get_key_value(&id))
            .map(|(id, bytes)| (id, bytes.as_slice()))
            .collect()
    }

    /// Text bytes plus the bytes of every referenced pending blob.
    pub fn total_size(&self) -> usize {
        self.working_text.len()
            + self
                .referenced_blobs()
                .iter()
                .map(|(_, bytes)| bytes.len())
                .sum::<usize>()
    }

    /// Check everything that can be checked without a network call.
    pub fn validate(&self, limits: &LimitsConfig) -> Result<(), ValidationError> {
        let len = self.working_text.chars().count();
        if len > limits.max_text_chars {
            return Err(ValidationError::TextTooLong {
                len,
                max: limits.max_text_chars,
            });
        }

        let existing = match &self.target {
            DraftTarget::Edit { existing_media, .. } => Some(existing_media),
            _ => None,
        };
        for raw in tokens::blob_references(&self.working_text) {
            let known = raw.parse::<ContentId>().ok().is_some_and(|id| {
                self.pending_blobs.contains_key(&id)
                    || existing.is_some_and(|media| media.contains_key(&id))
            });
            if !known {
                return Err(ValidationError::StaleBlobReference(raw));
            }
        }

        for (id, bytes) in self.referenced_blobs() {
            if bytes.len() > limits.max_blob_bytes {
                return Err(ValidationError::BlobTooLarge {
                    id: id.clone(),
                    len: bytes.len(),
                    max: limits.max_blob_bytes,
                });
            }
        }

        if let Extension::Poll(poll) = &self.extension {
            if poll.options.len() < 2 {
                return Err(ValidationError::InvalidPoll);
            }
        }

        Ok(())
    }

    /// Estimated publishing cost of the draft as it stands.
    pub fn cost(&self, costs: &CostConfig) -> u64 {
        estimate_cost(
            tokens::tag_count(&self.working_text),
            self.referenced_blobs().len(),
            self.extension.is_poll(),
            costs,
        )
    }

    fn insert_at_caret(&mut self, snippet: &str) {
        let at = self
            .working_text
            .char_indices()
            .nth(self.caret)
            .map(|(i, _)| i)
            .unwrap_or(self.working_text.len());
        self.working_text.insert_str(at, snippet);
        self.caret += snippet.chars().count();
    }
}

/// Publishing cost for a post with the given number of tags and images.
pub fn estimate_cost(tags: usize, images: usize, has_poll: bool, costs: &CostConfig) -> u64 {
    let mut total = costs.post + tags as u64 * costs.tag + images as u64 * costs.blob;
    if has_poll {
        total += costs.poll;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Poll;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn png(width: u32, height: u32, seed: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            let v = (x ^ seed).wrapping_mul(2_654_435_761) ^ y.wrapping_mul(40_503);
            Rgb([v as u8, (v >> 8) as u8, (v >> 16) as u8])
        });
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn test_recovery_keys() {
        assert_eq!(DraftTarget::NewPost.recovery_key().as_str(), "draft:new");
        assert_eq!(
            Draft::comment(DocumentId::from("12")).recovery_key().as_str(),
            "draft:comment:12"
        );
        let doc = Document::new(DocumentId::from("5"), "body");
        assert_eq!(Draft::edit(&doc).recovery_key().as_str(), "draft:edit:5");
    }

    #[test]
    fn test_attach_inserts_reference_at_caret() {
        let mut draft = Draft::new(DraftTarget::NewPost);
        draft.set_text("before after");
        draft.set_caret(7);
        let bytes = png(8, 6, 1);
        let id = draft.attach(&bytes, &LimitsConfig::default()).unwrap();
        let expected = format!("before ![8x6, {}kb](/blob/{})after", bytes.len().div_ceil(1024), id);
        assert_eq!(draft.text(), expected);
        assert_eq!(draft.pending_blobs().len(), 1);
    }

    #[test]
    fn test_attach_same_bytes_once() {
        let mut draft = Draft::new(DraftTarget::NewPost);
        let bytes = png(4, 4, 2);
        let a = draft.attach(&bytes, &LimitsConfig::default()).unwrap();
        let b = draft.attach(&bytes, &LimitsConfig::default()).unwrap();
        assert_eq!(a, b);
        assert_eq!(draft.pending_blobs().len(), 1);
        assert_eq!(draft.referenced_blobs().len(), 1);
    }

    #[test]
    fn test_attach_rejects_non_image() {
        let mut draft = Draft::new(DraftTarget::NewPost);
        let err = draft
            .attach(b"plain text", &LimitsConfig::default())
            .unwrap_err();
        assert!(matches!(err, ValidationError::UnreadableImage(_)));
        assert!(draft.pending_blobs().is_empty());
    }

    #[test]
    fn test_attach_fits_oversized_image() {
        let mut draft = Draft::new(DraftTarget::NewPost);
        let bytes = png(200, 200, 3);
        let limits = LimitsConfig {
            max_blob_bytes: 15_000,
            ..LimitsConfig::default()
        };
        assert!(bytes.len() > limits.max_blob_bytes);
        let id = draft.attach(&bytes, &limits).unwrap();
        let stored = &draft.pending_blobs()[&id];
        assert!(stored.len() <= limits.max_blob_bytes);
        assert_eq!(id, content_id::address_of(stored));
        draft.validate(&limits).unwrap();
    }

    #[test]
    fn test_stale_reference_fails_validation() {
        let mut draft = Draft::new(DraftTarget::NewPost);
        draft.set_text("look ![1x1, 1kb](/blob/deadbeef)");
        let err = draft.validate(&LimitsConfig::default()).unwrap_err();
        assert!(matches!(err, ValidationError::StaleBlobReference(ref id) if id == "deadbeef"));
    }

    #[test]
    fn test_repository_links_are_not_blob_references() {
        let mut draft = Draft::new(DraftTarget::NewPost);
        draft.set_text(
            "see https://github.com/rust-lang/rust/blob/master/README.md for details",
        );
        draft.validate(&LimitsConfig::default()).unwrap();
        assert_eq!(draft.cost(&CostConfig::default()), 2);
        assert_eq!(draft.total_size(), draft.text().len());
    }

    #[test]
    fn test_edit_accepts_existing_media() {
        let mut doc = Document::new(DocumentId::from("3"), "![1x1, 1kb](/blob/deadbeef)");
        doc.media_map.insert(
            "deadbeef".parse().unwrap(),
            BlobLocator {
                bucket: "b".into(),
                offset: 0,
                len: 10,
            },
        );
        let draft = Draft::edit(&doc);
        draft.validate(&LimitsConfig::default()).unwrap();
    }

    #[test]
    fn test_text_too_long() {
        let mut draft = Draft::new(DraftTarget::NewPost);
        draft.set_text("ééééé");
        let limits = LimitsConfig {
            max_text_chars: 4,
            ..LimitsConfig::default()
        };
        assert!(matches!(
            draft.validate(&limits),
            Err(ValidationError::TextTooLong { len: 5, max: 4 })
        ));
    }

    #[test]
    fn test_poll_needs_two_options() {
        let mut draft = Draft::new(DraftTarget::NewPost);
        draft.set_text("vote");
        draft.extension = Extension::Poll(Poll {
            options: vec!["yes".into()],
            deadline_hours: 24,
        });
        assert!(matches!(
            draft.validate(&LimitsConfig::default()),
            Err(ValidationError::InvalidPoll)
        ));
    }

    #[test]
    fn test_unreferenced_blobs_are_not_published() {
        let mut draft = Draft::new(DraftTarget::NewPost);
        let id = draft.attach(&png(4, 4, 4), &LimitsConfig::default()).unwrap();
        draft.set_text("changed my mind");
        assert!(draft.referenced_blobs().is_empty());
        assert_eq!(draft.total_size(), "changed my mind".len());
        assert!(draft.pending_blobs().contains_key(&id));
    }

    #[test]
    fn test_detach_strips_reference() {
        let mut draft = Draft::new(DraftTarget::NewPost);
        draft.set_text("pic: ");
        let id = draft.attach(&png(4, 4, 5), &LimitsConfig::default()).unwrap();
        assert!(draft.detach(&id));
        assert_eq!(draft.text(), "pic: ");
        assert!(draft.pending_blobs().is_empty());
    }

    #[test]
    fn test_cost_estimate() {
        let costs = CostConfig::default();
        assert_eq!(estimate_cost(0, 0, false, &costs), 2);
        assert_eq!(estimate_cost(2, 1, true, &costs), 2 + 6 + 10 + 3);

        let mut draft = Draft::new(DraftTarget::NewPost);
        draft.set_text("hello #ai and $btc and #123");
        assert_eq!(draft.cost(&costs), 2 + 2 * 3);
    }
}
