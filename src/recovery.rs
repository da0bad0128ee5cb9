//! Draft recovery: local persistence of the working text.
//!
//! A [`DraftStore`] keeps one record per [`RecoveryKey`]. Only the working
//! text is stored; attachments and the extension are session-local and are
//! lost on reload.
//!
//! [`DraftSession`] wraps a [`Draft`] with a debounced autosave task:
//!
//! ```text
//! set_text ──► watch::Sender ──► autosave task
//!                                  │ wait for a change
//!                                  │ wait until `idle` passes with no change
//!                                  ▼
//!                              store.save(key, text)
//! ```
//!
//! Discarding or publishing stops the task (abort + await) before the record
//! is cleared, so a late write cannot bring it back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{Config, LimitsConfig};
use crate::content_id::ContentId;
use crate::db;
use crate::draft::{Draft, RecoveryKey};
use crate::error::{PublishError, ValidationError};
use crate::migrate;
use crate::models::{DocumentId, Extension, RealmId};
use crate::publish::PublishCoordinator;

// ═══════════════════════════════════════════════════════════════════════
// Stores
// ═══════════════════════════════════════════════════════════════════════

/// Persistent home of draft recovery records.
#[async_trait]
pub trait DraftStore: Send + Sync {
    /// Insert or replace the working text for `key`.
    async fn save(&self, key: &RecoveryKey, text: &str) -> Result<()>;

    /// The saved working text, if any.
    async fn load(&self, key: &RecoveryKey) -> Result<Option<String>>;

    /// Remove the record. Clearing a missing record is not an error.
    async fn clear(&self, key: &RecoveryKey) -> Result<()>;
}

/// SQLite implementation of [`DraftStore`] over the `drafts` table.
pub struct SqliteDraftStore {
    pool: SqlitePool,
}

impl SqliteDraftStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured database and make sure the schema exists.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply_schema(&pool).await?;
        Ok(Self::new(pool))
    }

    /// All recovery keys with a saved record, most recently updated first.
    pub async fn keys(&self) -> Result<Vec<RecoveryKey>> {
        let keys: Vec<String> =
            sqlx::query_scalar("SELECT recovery_key FROM drafts ORDER BY updated_at DESC")
                .fetch_all(&self.pool)
                .await?;
        Ok(keys.into_iter().map(RecoveryKey::new).collect())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl DraftStore for SqliteDraftStore {
    async fn save(&self, key: &RecoveryKey, text: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO drafts (recovery_key, working_text, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(recovery_key) DO UPDATE SET
                working_text = excluded.working_text,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key.as_str())
        .bind(text)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load(&self, key: &RecoveryKey) -> Result<Option<String>> {
        let text: Option<String> =
            sqlx::query_scalar("SELECT working_text FROM drafts WHERE recovery_key = ?")
                .bind(key.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(text)
    }

    async fn clear(&self, key: &RecoveryKey) -> Result<()> {
        sqlx::query("DELETE FROM drafts WHERE recovery_key = ?")
            .bind(key.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// In-memory [`DraftStore`] for tests and embedders without a disk.
pub struct InMemoryDraftStore {
    records: RwLock<HashMap<RecoveryKey, String>>,
    saves: AtomicUsize,
}

impl InMemoryDraftStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of `save` calls served so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryDraftStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DraftStore for InMemoryDraftStore {
    async fn save(&self, key: &RecoveryKey, text: &str) -> Result<()> {
        self.records
            .write()
            .unwrap()
            .insert(key.clone(), text.to_string());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load(&self, key: &RecoveryKey) -> Result<Option<String>> {
        Ok(self.records.read().unwrap().get(key).cloned())
    }

    async fn clear(&self, key: &RecoveryKey) -> Result<()> {
        self.records.write().unwrap().remove(key);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Session
// ═══════════════════════════════════════════════════════════════════════

/// A draft plus its autosave task.
pub struct DraftSession {
    draft: Draft,
    key: RecoveryKey,
    store: Arc<dyn DraftStore>,
    text_tx: watch::Sender<String>,
    autosave: Option<JoinHandle<()>>,
}

impl DraftSession {
    /// Start a session; must be called inside a tokio runtime.
    pub fn start(draft: Draft, store: Arc<dyn DraftStore>, idle: Duration) -> Self {
        let key = draft.recovery_key();
        let (text_tx, text_rx) = watch::channel(draft.text().to_string());
        let autosave = tokio::spawn(autosave_loop(
            store.clone(),
            key.clone(),
            text_rx,
            idle,
        ));
        Self {
            draft,
            key,
            store,
            text_tx,
            autosave: Some(autosave),
        }
    }

    pub fn draft(&self) -> &Draft {
        &self.draft
    }

    pub fn recovery_key(&self) -> &RecoveryKey {
        &self.key
    }

    /// Replace the working text and schedule an autosave.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.draft.set_text(text);
        self.schedule();
    }

    pub fn set_caret(&mut self, caret: usize) {
        self.draft.set_caret(caret);
    }

    /// Select the poll, repost or other extension published with the text.
    /// Not part of the recovery record.
    pub fn set_extension(&mut self, extension: Extension) {
        self.draft.extension = extension;
    }

    /// Choose the community to publish into; `None` posts outside any realm.
    pub fn set_target_realm(&mut self, realm: Option<RealmId>) {
        self.draft.target_realm = realm;
    }

    /// Attach an image at the caret and schedule an autosave.
    pub fn attach(
        &mut self,
        bytes: &[u8],
        limits: &LimitsConfig,
    ) -> Result<ContentId, ValidationError> {
        let id = self.draft.attach(bytes, limits)?;
        self.schedule();
        Ok(id)
    }

    pub fn detach(&mut self, id: &ContentId) -> bool {
        let removed = self.draft.detach(id);
        self.schedule();
        removed
    }

    /// Write the working text now, bypassing the idle window.
    pub async fn persist_now(&self) -> Result<()> {
        self.store.save(&self.key, self.draft.text()).await
    }

    /// Replace the working text with the saved record, if there is one.
    pub async fn restore(&mut self) -> Result<bool> {
        match self.store.load(&self.key).await? {
            Some(text) => {
                tracing::debug!(key = %self.key, "restored draft");
                self.draft.set_text(text);
                self.text_tx.send_replace(self.draft.text().to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Publish the draft; on success autosave stops and the record is cleared.
    ///
    /// On failure the session keeps running unchanged so the author can
    /// retry.
    pub async fn publish(
        &mut self,
        coordinator: &PublishCoordinator,
    ) -> Result<DocumentId, PublishError> {
        let id = coordinator.publish(&self.draft).await?;
        self.stop_autosave().await;
        if let Err(e) = self.store.clear(&self.key).await {
            tracing::warn!(key = %self.key, error = %e, "failed to clear recovery record");
        }
        Ok(id)
    }

    /// Throw the draft away, including its recovery record.
    pub async fn discard(mut self) -> Result<()> {
        self.stop_autosave().await;
        self.store.clear(&self.key).await
    }

    /// Stop autosaving and hand back the draft. The record is kept.
    pub async fn close(mut self) -> Draft {
        self.stop_autosave().await;
        self.draft
    }

    fn schedule(&self) {
        if self.autosave.is_some() {
            self.text_tx.send_replace(self.draft.text().to_string());
        }
    }

    async fn stop_autosave(&mut self) {
        if let Some(handle) = self.autosave.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

async fn autosave_loop(
    store: Arc<dyn DraftStore>,
    key: RecoveryKey,
    mut rx: watch::Receiver<String>,
    idle: Duration,
) {
    loop {
        if rx.changed().await.is_err() {
            return;
        }
        let closed = loop {
            match tokio::time::timeout(idle, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => break true,
                Err(_) => break false,
            }
        };

        let text = rx.borrow_and_update().clone();
        match store.save(&key, &text).await {
            Ok(()) => tracing::debug!(key = %key, chars = text.chars().count(), "autosaved draft"),
            Err(e) => tracing::warn!(key = %key, error = %e, "autosave failed"),
        }
        if closed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draft::DraftTarget;

    fn session(store: &Arc<InMemoryDraftStore>) -> DraftSession {
        DraftSession::start(
            Draft::new(DraftTarget::NewPost),
            store.clone(),
            Duration::from_millis(1500),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_autosave_debounces() {
        let store = Arc::new(InMemoryDraftStore::new());
        let mut s = session(&store);
        s.set_text("a");
        s.set_text("ab");
        s.set_text("abc");

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(store.save_count(), 0);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(store.save_count(), 1);
        let key = RecoveryKey::new("draft:new");
        assert_eq!(store.load(&key).await.unwrap().as_deref(), Some("abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_extends_idle_window() {
        let store = Arc::new(InMemoryDraftStore::new());
        let mut s = session(&store);
        for text in ["h", "he", "hel", "hell", "hello"] {
            s.set_text(text);
            tokio::time::sleep(Duration::from_millis(1000)).await;
        }
        assert_eq!(store.save_count(), 0);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discard_clears_and_stops() {
        let store = Arc::new(InMemoryDraftStore::new());
        let mut s = session(&store);
        s.set_text("first");
        s.persist_now().await.unwrap();
        s.set_text("second");
        s.discard().await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        let key = RecoveryKey::new("draft:new");
        assert_eq!(store.load(&key).await.unwrap(), None);
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore() {
        let store = Arc::new(InMemoryDraftStore::new());
        let key = RecoveryKey::new("draft:comment:9");
        store.save(&key, "half-written reply").await.unwrap();

        let mut s = DraftSession::start(
            Draft::comment(DocumentId::from("9")),
            store.clone(),
            Duration::from_millis(1500),
        );
        assert!(s.restore().await.unwrap());
        assert_eq!(s.draft().text(), "half-written reply");

        let mut empty = session(&store);
        assert!(!empty.restore().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_keeps_record() {
        let store = Arc::new(InMemoryDraftStore::new());
        let mut s = session(&store);
        s.set_text("keep me");
        s.persist_now().await.unwrap();
        let draft = s.close().await;
        assert_eq!(draft.text(), "keep me");
        let key = RecoveryKey::new("draft:new");
        assert_eq!(store.load(&key).await.unwrap().as_deref(), Some("keep me"));
    }
}
