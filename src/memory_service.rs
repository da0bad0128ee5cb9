//! In-memory [`DocumentService`] and [`BlobResolver`].
//!
//! Documents get sequential numeric ids. Blobs are appended to a single
//! byte bucket and addressed by range locators; uploading the same content
//! id twice stores it once. Edits push the supplied undo patch onto the
//! document's stack. Every call is appended to a call log. Uploads can be
//! made to fail per content id, and fetches can be made to fail outright.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::content_id::ContentId;
use crate::models::{BlobLocator, Document, DocumentId, Extension, RealmId};
use crate::service::{BlobResolver, DocumentEdit, DocumentService, NewDocument};

const BUCKET: &str = "memory";

struct Staged {
    text: String,
    parent: Option<DocumentId>,
    realm: Option<RealmId>,
    extension: Extension,
    media: BTreeMap<ContentId, BlobLocator>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    documents: BTreeMap<DocumentId, Document>,
    bucket: Vec<u8>,
    blobs: HashMap<ContentId, BlobLocator>,
    staged: Option<Staged>,
    failing_uploads: HashSet<ContentId>,
    failing_fetches: bool,
    calls: Vec<String>,
}

impl State {
    fn store_blob(&mut self, id: &ContentId, bytes: &[u8]) -> BlobLocator {
        if let Some(locator) = self.blobs.get(id) {
            return locator.clone();
        }
        let locator = BlobLocator {
            bucket: BUCKET.to_string(),
            offset: self.bucket.len() as u64,
            len: bytes.len() as u64,
        };
        self.bucket.extend_from_slice(bytes);
        self.blobs.insert(id.clone(), locator.clone());
        locator
    }

    fn insert_new(
        &mut self,
        body: String,
        media_map: BTreeMap<ContentId, BlobLocator>,
        parent: Option<DocumentId>,
        realm: Option<RealmId>,
        extension: Extension,
    ) -> DocumentId {
        let id = DocumentId(self.next_id.to_string());
        self.next_id += 1;

        if let Some(parent_id) = &parent {
            if let Some(parent_doc) = self.documents.get_mut(parent_id) {
                parent_doc.children.push(id.clone());
            }
        }

        let mut doc = Document::new(id.clone(), body);
        doc.media_map = media_map;
        doc.parent = parent;
        doc.realm = realm;
        doc.extension = extension;
        doc.timestamp = chrono::Utc::now().timestamp();
        self.documents.insert(id.clone(), doc);
        id
    }
}

/// Document service held entirely in process memory.
pub struct InMemoryDocumentService {
    state: RwLock<State>,
}

impl InMemoryDocumentService {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    /// Make every upload of `id` fail.
    pub fn fail_uploads_of(&self, id: ContentId) {
        self.state.write().unwrap().failing_uploads.insert(id);
    }

    /// Make every `fetch_documents` call fail.
    pub fn fail_fetches(&self) {
        self.state.write().unwrap().failing_fetches = true;
    }

    /// Insert a document as-is, e.g. one loaded from disk.
    pub fn insert_document(&self, doc: Document) {
        let mut state = self.state.write().unwrap();
        if let Ok(n) = doc.id.0.parse::<u64>() {
            state.next_id = state.next_id.max(n + 1);
        }
        state.documents.insert(doc.id.clone(), doc);
    }

    pub fn document(&self, id: &DocumentId) -> Option<Document> {
        self.state.read().unwrap().documents.get(id).cloned()
    }

    pub fn document_count(&self) -> usize {
        self.state.read().unwrap().documents.len()
    }

    /// Calls received so far, e.g. `"stage"`, `"upload:2cf24dba"`, `"commit"`.
    pub fn calls(&self) -> Vec<String> {
        self.state.read().unwrap().calls.clone()
    }
}

impl Default for InMemoryDocumentService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentService for InMemoryDocumentService {
    async fn create_document(&self, doc: NewDocument) -> Result<DocumentId> {
        let mut state = self.state.write().unwrap();
        state.calls.push("create".to_string());
        let media = doc
            .blobs
            .iter()
            .map(|(id, bytes)| (id.clone(), state.store_blob(id, bytes)))
            .collect();
        Ok(state.insert_new(doc.text, media, doc.parent, doc.realm, doc.extension))
    }

    async fn edit_document(&self, edit: DocumentEdit) -> Result<()> {
        let mut state = self.state.write().unwrap();
        state.calls.push(format!("edit:{}", edit.id));
        let media: Vec<(ContentId, BlobLocator)> = edit
            .blobs
            .iter()
            .map(|(id, bytes)| (id.clone(), state.store_blob(id, bytes)))
            .collect();

        let Some(doc) = state.documents.get_mut(&edit.id) else {
            bail!("document {} not found", edit.id);
        };
        doc.patches.push(chrono::Utc::now().timestamp(), edit.patch);
        doc.body = edit.text;
        doc.media_map.extend(media);
        if edit.realm.is_some() {
            doc.realm = edit.realm;
        }
        Ok(())
    }

    async fn stage_document(
        &self,
        text: &str,
        parent: Option<&DocumentId>,
        realm: Option<&RealmId>,
        extension: &Extension,
    ) -> Result<()> {
        let mut state = self.state.write().unwrap();
        state.calls.push("stage".to_string());
        state.staged = Some(Staged {
            text: text.to_string(),
            parent: parent.cloned(),
            realm: realm.cloned(),
            extension: extension.clone(),
            media: BTreeMap::new(),
        });
        Ok(())
    }

    async fn upload_blob(&self, id: &ContentId, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.write().unwrap();
        state.calls.push(format!("upload:{}", id));
        if state.failing_uploads.contains(id) {
            bail!("upload of blob {} rejected", id);
        }
        let locator = state.store_blob(id, bytes);
        match state.staged.as_mut() {
            Some(staged) => {
                staged.media.insert(id.clone(), locator);
                Ok(())
            }
            None => bail!("no staged document to attach blob {} to", id),
        }
    }

    async fn commit_document(&self) -> Result<DocumentId> {
        let mut state = self.state.write().unwrap();
        state.calls.push("commit".to_string());
        let Some(staged) = state.staged.take() else {
            bail!("nothing staged to commit");
        };
        Ok(state.insert_new(
            staged.text,
            staged.media,
            staged.parent,
            staged.realm,
            staged.extension,
        ))
    }

    async fn fetch_documents(&self, ids: &[DocumentId]) -> Result<Vec<Document>> {
        let mut state = self.state.write().unwrap();
        state.calls.push(format!("fetch:{}", ids.len()));
        if state.failing_fetches {
            bail!("document fetch unavailable");
        }
        Ok(ids
            .iter()
            .filter_map(|id| state.documents.get(id).cloned())
            .collect())
    }
}

#[async_trait]
impl BlobResolver for InMemoryDocumentService {
    async fn resolve_blob(&self, locator: &BlobLocator) -> Result<Vec<u8>> {
        let state = self.state.read().unwrap();
        if locator.bucket != BUCKET {
            bail!("unknown bucket {}", locator.bucket);
        }
        let start = usize::try_from(locator.offset)?;
        let len = usize::try_from(locator.len)?;
        let Some(end) = start.checked_add(len) else {
            bail!("locator {}+{} overflows", locator.offset, locator.len);
        };
        match state.bucket.get(start..end) {
            Some(bytes) => Ok(bytes.to_vec()),
            None => bail!(
                "range {}..{} is outside the bucket ({} bytes)",
                start,
                end,
                state.bucket.len()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_id::address_of;
    use crate::patch;

    #[tokio::test]
    async fn test_create_and_fetch() {
        let service = InMemoryDocumentService::new();
        let id = service
            .create_document(NewDocument {
                text: "hello".into(),
                blobs: BTreeMap::new(),
                parent: None,
                realm: None,
                extension: Extension::None,
            })
            .await
            .unwrap();
        assert_eq!(id.0, "0");
        let docs = service
            .fetch_documents(&[id.clone(), DocumentId::from("99")])
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].body, "hello");
    }

    #[tokio::test]
    async fn test_blobs_are_deduplicated_and_resolvable() {
        let service = InMemoryDocumentService::new();
        let bytes = b"picture bytes".to_vec();
        let cid = address_of(&bytes);
        let mut blobs = BTreeMap::new();
        blobs.insert(cid.clone(), bytes.clone());
        let a = service
            .create_document(NewDocument {
                text: "a".into(),
                blobs: blobs.clone(),
                parent: None,
                realm: None,
                extension: Extension::None,
            })
            .await
            .unwrap();
        let b = service
            .create_document(NewDocument {
                text: "b".into(),
                blobs,
                parent: Some(a.clone()),
                realm: None,
                extension: Extension::None,
            })
            .await
            .unwrap();

        let first = service.document(&a).unwrap();
        let second = service.document(&b).unwrap();
        assert_eq!(first.media_map[&cid], second.media_map[&cid]);
        assert_eq!(first.children, vec![b.clone()]);
        assert_eq!(second.parent, Some(a));
        let resolved = service.resolve_blob(&first.media_map[&cid]).await.unwrap();
        assert_eq!(resolved, bytes);
    }

    #[tokio::test]
    async fn test_edit_pushes_undo_patch() {
        let service = InMemoryDocumentService::new();
        service.insert_document(Document::new(DocumentId::from("4"), "old body"));
        service
            .edit_document(DocumentEdit {
                id: DocumentId::from("4"),
                text: "new body".into(),
                blobs: BTreeMap::new(),
                patch: patch::diff("new body", "old body"),
                realm: None,
            })
            .await
            .unwrap();
        let doc = service.document(&DocumentId::from("4")).unwrap();
        assert_eq!(doc.body, "new body");
        assert_eq!(doc.latest_version(), 1);
        assert!(service
            .edit_document(DocumentEdit {
                id: DocumentId::from("404"),
                text: String::new(),
                blobs: BTreeMap::new(),
                patch: patch::Patch::default(),
                realm: None,
            })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_commit_without_stage_fails() {
        let service = InMemoryDocumentService::new();
        assert!(service.commit_document().await.is_err());
    }

    #[tokio::test]
    async fn test_out_of_range_locators_rejected() {
        let service = InMemoryDocumentService::new();
        let overflowing = BlobLocator {
            bucket: BUCKET.into(),
            offset: u64::MAX - 1,
            len: 10,
        };
        assert!(service.resolve_blob(&overflowing).await.is_err());

        let past_end = BlobLocator {
            bucket: BUCKET.into(),
            offset: 0,
            len: 1,
        };
        assert!(service.resolve_blob(&past_end).await.is_err());
    }
}
