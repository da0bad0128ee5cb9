//! Draft recovery against a real SQLite file.

use std::sync::Arc;
use std::time::Duration;

use folio::config::Config;
use folio::draft::{Draft, DraftTarget, RecoveryKey};
use folio::models::DocumentId;
use folio::recovery::{DraftSession, DraftStore, SqliteDraftStore};
use tempfile::TempDir;

fn config_in(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.drafts.path = dir.path().join("nested/drafts.sqlite");
    config
}

#[tokio::test]
async fn test_save_load_clear() {
    let tmp = TempDir::new().unwrap();
    let store = SqliteDraftStore::open(&config_in(&tmp)).await.unwrap();
    let key = RecoveryKey::new("draft:new");

    assert_eq!(store.load(&key).await.unwrap(), None);
    store.save(&key, "first").await.unwrap();
    store.save(&key, "second").await.unwrap();
    assert_eq!(store.load(&key).await.unwrap().as_deref(), Some("second"));
    assert_eq!(store.keys().await.unwrap(), vec![key.clone()]);

    store.clear(&key).await.unwrap();
    assert_eq!(store.load(&key).await.unwrap(), None);
    // Clearing twice is fine.
    store.clear(&key).await.unwrap();
}

#[tokio::test]
async fn test_records_survive_reopen() {
    let tmp = TempDir::new().unwrap();
    let config = config_in(&tmp);
    let key = RecoveryKey::new("draft:edit:42");
    {
        let store = SqliteDraftStore::open(&config).await.unwrap();
        store.save(&key, "unfinished edit").await.unwrap();
        store.close().await;
    }
    let store = SqliteDraftStore::open(&config).await.unwrap();
    assert_eq!(
        store.load(&key).await.unwrap().as_deref(),
        Some("unfinished edit")
    );
}

#[tokio::test]
async fn test_session_restores_from_sqlite() {
    let tmp = TempDir::new().unwrap();
    let config = config_in(&tmp);
    let store = Arc::new(SqliteDraftStore::open(&config).await.unwrap());
    let parent = DocumentId::from("17");

    let mut session = DraftSession::start(
        Draft::comment(parent.clone()),
        store.clone(),
        config.drafts.idle(),
    );
    session.set_text("a reply in progress");
    session.persist_now().await.unwrap();
    let _ = session.close().await;

    let mut resumed = DraftSession::start(
        Draft::comment(parent),
        store.clone(),
        config.drafts.idle(),
    );
    assert!(resumed.restore().await.unwrap());
    assert_eq!(resumed.draft().text(), "a reply in progress");

    resumed.discard().await.unwrap();
    let key = RecoveryKey::new("draft:comment:17");
    assert_eq!(store.load(&key).await.unwrap(), None);
}

#[tokio::test]
async fn test_autosave_reaches_sqlite() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(SqliteDraftStore::open(&config_in(&tmp)).await.unwrap());

    let mut session = DraftSession::start(
        Draft::new(DraftTarget::NewPost),
        store.clone(),
        Duration::from_millis(30),
    );
    session.set_text("typed");
    session.set_text("typed and saved");

    let key = RecoveryKey::new("draft:new");
    let mut saved = None;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        saved = store.load(&key).await.unwrap();
        if saved.is_some() {
            break;
        }
    }
    assert_eq!(saved.as_deref(), Some("typed and saved"));
}
