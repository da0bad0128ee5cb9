//! Interfaces to the external document service.
//!
//! Folio never owns committed documents. Everything it needs from the
//! outside world goes through two traits:
//!
//! ```text
//!   PublishCoordinator ──► DocumentService ◄── RenderEngine::resolve_pending
//!                                                   │
//!   RenderEngine ─────────► BlobResolver ◄──────────┘
//! ```
//!
//! Both return `anyhow::Result`; the coordinator maps failures into
//! [`crate::error::PublishError`]. [`crate::memory_service`] provides an
//! in-process implementation of both.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::content_id::ContentId;
use crate::models::{BlobLocator, Document, DocumentId, Extension, RealmId};
use crate::patch::Patch;

/// Payload of a single-call document creation.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub text: String,
    pub blobs: BTreeMap<ContentId, Vec<u8>>,
    pub parent: Option<DocumentId>,
    pub realm: Option<RealmId>,
    pub extension: Extension,
}

/// Payload of an edit to an existing document.
#[derive(Debug, Clone)]
pub struct DocumentEdit {
    pub id: DocumentId,
    pub text: String,
    pub blobs: BTreeMap<ContentId, Vec<u8>>,
    /// Undo patch: turns `text` back into the previous body.
    pub patch: Patch,
    pub realm: Option<RealmId>,
}

/// The document service that stores and serves committed documents.
///
/// # Publishing shapes
///
/// - **Single call**: [`create_document`](DocumentService::create_document)
///   or [`edit_document`](DocumentService::edit_document) carry the text and
///   every blob at once.
/// - **Staged**: [`stage_document`](DocumentService::stage_document) parks
///   the text server-side, each blob goes up through
///   [`upload_blob`](DocumentService::upload_blob) (possibly concurrently),
///   and [`commit_document`](DocumentService::commit_document) returns the
///   new id.
///
/// Blob uploads are keyed by content id, so retrying one is harmless.
#[async_trait]
pub trait DocumentService: Send + Sync {
    async fn create_document(&self, doc: NewDocument) -> Result<DocumentId>;

    async fn edit_document(&self, edit: DocumentEdit) -> Result<()>;

    /// Stage text and extension of a new document without blobs.
    async fn stage_document(
        &self,
        text: &str,
        parent: Option<&DocumentId>,
        realm: Option<&RealmId>,
        extension: &Extension,
    ) -> Result<()>;

    async fn upload_blob(&self, id: &ContentId, bytes: &[u8]) -> Result<()>;

    /// Finalize the staged document and its uploaded blobs.
    async fn commit_document(&self) -> Result<DocumentId>;

    /// Fetch documents by id. Unknown ids are left out of the result.
    async fn fetch_documents(&self, ids: &[DocumentId]) -> Result<Vec<Document>>;
}

/// Access to committed blob bytes.
#[async_trait]
pub trait BlobResolver: Send + Sync {
    /// A URL the reader can load directly, when the transport can build one.
    fn url_for(&self, _locator: &BlobLocator) -> Option<String> {
        None
    }

    /// Fetch the bytes behind a locator.
    async fn resolve_blob(&self, locator: &BlobLocator) -> Result<Vec<u8>>;
}
