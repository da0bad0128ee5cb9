//! Submission of a draft to the document service.
//!
//! ```text
//! Idle → Sizing ─┬─► SingleCall ─────────────────────────────┬─► Published(id)
//!                └─► Staging → BlobUpload(n) → Committing ───┘
//!
//!   any state that touches the network ──► Failed
//! ```
//!
//! A draft whose text plus referenced blobs fit in
//! `limits.single_call_budget` goes out in one call. Larger new documents
//! are staged, their blobs uploaded concurrently, then committed. Edits
//! always use the single-call shape and carry the undo patch.
//!
//! A failed publish never mutates the draft. If any blob upload fails the
//! commit is skipped; blobs that did make it are left server-side, which
//! is harmless because uploads are keyed by content id.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use serde::Serialize;

use crate::config::LimitsConfig;
use crate::content_id::ContentId;
use crate::draft::{Draft, DraftTarget};
use crate::error::PublishError;
use crate::models::DocumentId;
use crate::patch;
use crate::recovery::DraftStore;
use crate::service::{DocumentEdit, DocumentService, NewDocument};

/// Where a publish attempt currently is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum PublishState {
    Idle,
    Sizing,
    SingleCall,
    Staging,
    BlobUpload(usize),
    Committing,
    Published(DocumentId),
    Failed,
}

impl PublishState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PublishState::Published(_) | PublishState::Failed)
    }
}

pub struct PublishCoordinator {
    service: Arc<dyn DocumentService>,
    limits: LimitsConfig,
    recovery: Option<Arc<dyn DraftStore>>,
    transitions: Mutex<Vec<PublishState>>,
}

impl PublishCoordinator {
    pub fn new(service: Arc<dyn DocumentService>, limits: LimitsConfig) -> Self {
        Self {
            service,
            limits,
            recovery: None,
            transitions: Mutex::new(vec![PublishState::Idle]),
        }
    }

    /// Clear the draft's recovery record from `store` after a successful publish.
    pub fn with_recovery(mut self, store: Arc<dyn DraftStore>) -> Self {
        self.recovery = Some(store);
        self
    }

    /// States visited by the most recent publish, starting at `Idle`.
    pub fn transitions(&self) -> Vec<PublishState> {
        self.transitions.lock().unwrap().clone()
    }

    pub fn state(&self) -> PublishState {
        self.transitions
            .lock()
            .unwrap()
            .last()
            .cloned()
            .unwrap_or(PublishState::Idle)
    }

    /// Publish `draft` and return the id of the created or edited document.
    pub async fn publish(&self, draft: &Draft) -> Result<DocumentId, PublishError> {
        *self.transitions.lock().unwrap() = vec![PublishState::Idle];

        if let Err(e) = draft.validate(&self.limits) {
            tracing::info!(error = %e, "draft rejected before submission");
            self.enter(PublishState::Failed);
            return Err(e.into());
        }

        match self.submit(draft).await {
            Ok(id) => {
                self.enter(PublishState::Published(id.clone()));
                if let Some(store) = &self.recovery {
                    if let Err(e) = store.clear(&draft.recovery_key()).await {
                        tracing::warn!(
                            key = %draft.recovery_key(),
                            error = %e,
                            "failed to clear recovery record"
                        );
                    }
                }
                Ok(id)
            }
            Err(e) => {
                tracing::warn!(error = %e, "publish failed");
                self.enter(PublishState::Failed);
                Err(e)
            }
        }
    }

    async fn submit(&self, draft: &Draft) -> Result<DocumentId, PublishError> {
        self.enter(PublishState::Sizing);
        let blobs: BTreeMap<ContentId, Vec<u8>> = draft
            .referenced_blobs()
            .into_iter()
            .map(|(id, bytes)| (id.clone(), bytes.to_vec()))
            .collect();
        let total = draft.total_size();
        tracing::debug!(
            total,
            budget = self.limits.single_call_budget,
            blobs = blobs.len(),
            "sized draft"
        );

        let parent = match draft.target() {
            DraftTarget::Edit {
                id, previous_body, ..
            } => {
                self.enter(PublishState::SingleCall);
                let edit = DocumentEdit {
                    id: id.clone(),
                    text: draft.text().to_string(),
                    blobs,
                    patch: patch::diff(draft.text(), previous_body),
                    realm: draft.target_realm.clone(),
                };
                self.service
                    .edit_document(edit)
                    .await
                    .map_err(|e| PublishError::transport("edit", e))?;
                return Ok(id.clone());
            }
            DraftTarget::Comment { parent } => Some(parent.clone()),
            DraftTarget::NewPost => None,
        };

        if total <= self.limits.single_call_budget {
            self.enter(PublishState::SingleCall);
            let doc = NewDocument {
                text: draft.text().to_string(),
                blobs,
                parent,
                realm: draft.target_realm.clone(),
                extension: draft.extension.clone(),
            };
            return self
                .service
                .create_document(doc)
                .await
                .map_err(|e| PublishError::transport("create", e));
        }

        self.enter(PublishState::Staging);
        self.service
            .stage_document(
                draft.text(),
                parent.as_ref(),
                draft.target_realm.as_ref(),
                &draft.extension,
            )
            .await
            .map_err(|e| PublishError::transport("stage", e))?;

        self.enter(PublishState::BlobUpload(blobs.len()));
        let service = self.service.as_ref();
        let uploads = blobs.iter().map(|(id, bytes)| async move {
            (id, service.upload_blob(id, bytes).await)
        });
        let mut failed = Vec::new();
        let mut first_error = None;
        for (id, result) in join_all(uploads).await {
            if let Err(e) = result {
                tracing::warn!(blob = %id, error = %e, "blob upload failed");
                failed.push(id.clone());
                first_error.get_or_insert(e);
            }
        }
        if let Some(cause) = first_error {
            return Err(PublishError::PartialBlobFailure {
                failed,
                total: blobs.len(),
                cause,
            });
        }

        self.enter(PublishState::Committing);
        self.service
            .commit_document()
            .await
            .map_err(|e| PublishError::transport("commit", e))
    }

    fn enter(&self, state: PublishState) {
        tracing::info!(state = ?state, "publish transition");
        self.transitions.lock().unwrap().push(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_service::InMemoryDocumentService;
    use crate::recovery::InMemoryDraftStore;

    fn coordinator(service: &Arc<InMemoryDocumentService>, budget: usize) -> PublishCoordinator {
        PublishCoordinator::new(
            service.clone(),
            LimitsConfig {
                single_call_budget: budget,
                ..LimitsConfig::default()
            },
        )
    }

    fn text_draft(text: &str) -> Draft {
        let mut draft = Draft::new(DraftTarget::NewPost);
        draft.set_text(text);
        draft
    }

    #[tokio::test]
    async fn test_single_call_transitions() {
        let service = Arc::new(InMemoryDocumentService::new());
        let coord = coordinator(&service, 1000);
        let id = coord.publish(&text_draft("short post")).await.unwrap();
        assert_eq!(
            coord.transitions(),
            vec![
                PublishState::Idle,
                PublishState::Sizing,
                PublishState::SingleCall,
                PublishState::Published(id),
            ]
        );
        assert_eq!(service.calls(), vec!["create"]);
    }

    #[tokio::test]
    async fn test_staged_transitions_without_blobs() {
        let service = Arc::new(InMemoryDocumentService::new());
        let coord = coordinator(&service, 4);
        let id = coord.publish(&text_draft("longer than four")).await.unwrap();
        assert_eq!(
            coord.transitions(),
            vec![
                PublishState::Idle,
                PublishState::Sizing,
                PublishState::Staging,
                PublishState::BlobUpload(0),
                PublishState::Committing,
                PublishState::Published(id.clone()),
            ]
        );
        assert_eq!(service.document(&id).unwrap().body, "longer than four");
    }

    #[tokio::test]
    async fn test_validation_fails_before_any_call() {
        let service = Arc::new(InMemoryDocumentService::new());
        let coord = coordinator(&service, 1000);
        let err = coord
            .publish(&text_draft("see /blob/deadbeef"))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Validation(_)));
        assert!(!err.is_retryable());
        assert!(service.calls().is_empty());
        assert_eq!(coord.state(), PublishState::Failed);
    }

    #[tokio::test]
    async fn test_success_clears_recovery_record() {
        let service = Arc::new(InMemoryDocumentService::new());
        let store = Arc::new(InMemoryDraftStore::new());
        let draft = text_draft("saved earlier");
        store.save(&draft.recovery_key(), draft.text()).await.unwrap();

        let coord = coordinator(&service, 1000).with_recovery(store.clone());
        coord.publish(&draft).await.unwrap();
        assert_eq!(store.load(&draft.recovery_key()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_comment_links_parent() {
        let service = Arc::new(InMemoryDocumentService::new());
        let coord = coordinator(&service, 1000);
        let root = coord.publish(&text_draft("root")).await.unwrap();

        let mut reply = Draft::comment(root.clone());
        reply.set_text("a reply");
        let child = coord.publish(&reply).await.unwrap();
        assert_eq!(service.document(&child).unwrap().parent, Some(root.clone()));
        assert_eq!(service.document(&root).unwrap().children, vec![child]);
    }
}
