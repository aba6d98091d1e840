//! Persistence integration tests.
//!
//! Verifies:
//! - Sessions on one namespace converge through the shared log
//! - Compaction folds the log without losing edits
//! - Replayed updates are never written back
//! - Cursors only move forward
//! - Erasing one namespace leaves the others intact
//! - A session destroyed during startup never reports synced
//! - 600 array edits compact to a handful of records and replay in order
//! - Key/value accessors refuse to run on an erased store

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use logos_persist::{
    DocumentSession, PersistError, PersistEvent, SessionConfig, SessionState, StoreConfig,
    StoreManager, UpdateLog, PREFERRED_TRIM_SIZE,
};
use tempfile::{tempdir, TempDir};
use tokio::sync::mpsc::UnboundedReceiver;
use yrs::{Any, Array, Doc, GetString, Out, ReadTxn, Text, Transact, WriteTxn};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn shared_manager(dir: &TempDir) -> Arc<StoreManager> {
    init_logger();
    StoreManager::shared(StoreConfig::for_testing(dir.path().join("db")))
}

async fn open_synced(manager: &Arc<StoreManager>, name: &str, doc: &Doc) -> DocumentSession {
    let session =
        DocumentSession::open(manager.clone(), name, doc.clone(), SessionConfig::for_testing())
            .unwrap();
    session.when_synced().await.unwrap();
    session
}

fn push_item(doc: &Doc, item: &str) {
    let mut txn = doc.transact_mut();
    let items = txn.get_or_insert_array("items");
    let len = items.len(&txn);
    items.insert(&mut txn, len, item.to_string());
}

fn read_items(doc: &Doc) -> Vec<String> {
    let txn = doc.transact();
    let Some(items) = txn.get_array("items") else {
        return Vec::new();
    };
    items
        .iter(&txn)
        .map(|out| match out {
            Out::Any(Any::String(s)) => s.to_string(),
            other => panic!("unexpected element {other:?}"),
        })
        .collect()
}

fn append_text(doc: &Doc, content: &str) {
    let mut txn = doc.transact_mut();
    let text = txn.get_or_insert_text("content");
    let len = text.get_string(&txn).len() as u32;
    text.insert(&mut txn, len, content);
}

fn read_text(doc: &Doc) -> String {
    let txn = doc.transact();
    txn.get_text("content")
        .map(|text| text.get_string(&txn))
        .unwrap_or_default()
}

fn drain(rx: &mut UnboundedReceiver<PersistEvent>) -> Vec<PersistEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn stored_records(manager: &StoreManager, name: &str) -> u64 {
    let handle = manager.acquire().await.unwrap();
    UpdateLog::new(name).count(&handle).unwrap()
}

// ─── Convergence ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_update_and_merge() {
    let dir = tempdir().unwrap();
    let manager = shared_manager(&dir);

    let doc1 = Doc::new();
    push_item(&doc1, "0");
    let session1 = open_synced(&manager, "merge", &doc1).await;
    push_item(&doc1, "1");
    session1.flush().await.unwrap();

    let doc2 = Doc::new();
    let session2 = open_synced(&manager, "merge", &doc2).await;
    assert_eq!(read_items(&doc2), vec!["0", "1"]);

    for i in 2..PREFERRED_TRIM_SIZE + 1 {
        push_item(&doc1, &i.to_string());
    }
    session1.flush().await.unwrap();
    session2.fetch_updates().await.unwrap();

    assert_eq!(read_items(&doc2).len() as u64, PREFERRED_TRIM_SIZE + 1);
    assert_eq!(read_items(&doc1), read_items(&doc2));
    // Everything folded into one snapshot
    assert_eq!(session1.size(), 1);
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let dir = tempdir().unwrap();
    let manager = shared_manager(&dir);

    let doc1 = Doc::new();
    let doc2 = Doc::new();
    let session1 = open_synced(&manager, "shared", &doc1).await;
    let session2 = open_synced(&manager, "shared", &doc2).await;

    push_item(&doc1, "left");
    push_item(&doc2, "right");
    for i in 0..50 {
        push_item(&doc1, &format!("a{i}"));
        push_item(&doc2, &format!("b{i}"));
    }
    session1.flush().await.unwrap();
    session2.flush().await.unwrap();
    session1.fetch_updates().await.unwrap();
    session2.fetch_updates().await.unwrap();

    let items1 = read_items(&doc1);
    assert_eq!(items1.len(), 102);
    assert_eq!(items1, read_items(&doc2));

    // A third instance replays to the same state
    let doc3 = Doc::new();
    let _session3 = open_synced(&manager, "shared", &doc3).await;
    assert_eq!(read_items(&doc3), items1);
}

// ─── Compaction ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_compaction_preserves_state() {
    let dir = tempdir().unwrap();
    let manager = shared_manager(&dir);

    let doc = Doc::new();
    let mut session = open_synced(&manager, "compact", &doc).await;
    let mut events = session.take_event_rx().unwrap();
    for word in ["alpha ", "beta ", "gamma ", "delta"] {
        append_text(&doc, word);
    }
    session.flush().await.unwrap();
    assert_eq!(stored_records(&manager, "compact").await, 4);

    session.store_state(true).await.unwrap();
    assert_eq!(stored_records(&manager, "compact").await, 1);
    assert!(drain(&mut events).contains(&PersistEvent::Compacted { records: 1 }));

    // Edits after the fold are appended behind the snapshot
    append_text(&doc, "!");
    session.flush().await.unwrap();
    assert_eq!(stored_records(&manager, "compact").await, 2);

    let restored = Doc::new();
    let _replica = open_synced(&manager, "compact", &restored).await;
    assert_eq!(read_text(&restored), "alpha beta gamma delta!");
}

#[tokio::test]
async fn test_compaction_keeps_other_sessions_tail() {
    let dir = tempdir().unwrap();
    let manager = shared_manager(&dir);

    let doc1 = Doc::new();
    let doc2 = Doc::new();
    let session1 = open_synced(&manager, "tail", &doc1).await;
    let session2 = open_synced(&manager, "tail", &doc2).await;

    append_text(&doc1, "one ");
    session1.flush().await.unwrap();
    session1.store_state(true).await.unwrap();

    // Appended after session1's cursor, must survive its next fold
    append_text(&doc2, "two");
    session2.flush().await.unwrap();

    let restored = Doc::new();
    let _replica = open_synced(&manager, "tail", &restored).await;
    let text = read_text(&restored);
    assert!(text.contains("one"));
    assert!(text.contains("two"));
}

// ─── No loopback ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_replay_is_not_written_back() {
    let dir = tempdir().unwrap();
    let manager = shared_manager(&dir);

    let doc = Doc::new();
    let writer = open_synced(&manager, "loop", &doc).await;
    for i in 0..3 {
        push_item(&doc, &i.to_string());
    }
    writer.flush().await.unwrap();
    writer.destroy();
    assert_eq!(stored_records(&manager, "loop").await, 3);

    let fresh = Doc::new();
    let reader = open_synced(&manager, "loop", &fresh).await;
    reader.flush().await.unwrap();
    assert_eq!(read_items(&fresh), vec!["0", "1", "2"]);
    assert_eq!(reader.size(), 3);
    assert_eq!(stored_records(&manager, "loop").await, 3);

    // Re-fetching what is already applied writes nothing either
    assert_eq!(reader.fetch_updates().await.unwrap(), 0);
    reader.flush().await.unwrap();
    assert_eq!(stored_records(&manager, "loop").await, 3);
}

// ─── Cursor monotonicity ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_cursor_never_moves_backwards() {
    let dir = tempdir().unwrap();
    let manager = shared_manager(&dir);

    let doc1 = Doc::new();
    let doc2 = Doc::new();
    let reader = open_synced(&manager, "cursor", &doc1).await;
    let writer = open_synced(&manager, "cursor", &doc2).await;
    let log = UpdateLog::new("cursor");

    let mut previous = reader.cursor();
    for round in 0..5 {
        for i in 0..3 {
            push_item(&doc2, &format!("{round}-{i}"));
        }
        writer.flush().await.unwrap();
        if round == 2 {
            writer.store_state(true).await.unwrap();
        }

        reader.fetch_updates().await.unwrap();
        let handle = manager.acquire().await.unwrap();
        let last = log.last_sequence(&handle).unwrap().unwrap();
        assert!(reader.cursor() > last);
        assert!(reader.cursor() >= previous);
        previous = reader.cursor();
    }
    assert_eq!(read_items(&doc1), read_items(&doc2));
}

// ─── Erase isolation ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_erase_namespace_isolation() {
    let dir = tempdir().unwrap();
    let manager = shared_manager(&dir);

    let doc_x = Doc::new();
    let doc_y = Doc::new();
    let session_x = open_synced(&manager, "x", &doc_x).await;
    let session_y = open_synced(&manager, "y", &doc_y).await;
    append_text(&doc_x, "gone");
    append_text(&doc_y, "kept");
    session_x.flush().await.unwrap();
    session_y.flush().await.unwrap();
    session_y.set("owner", "ada").await.unwrap();

    session_x.erase().await.unwrap();
    assert_eq!(session_x.state(), SessionState::Destroyed);
    assert_eq!(stored_records(&manager, "y").await, 1);

    // The erased namespace stays gone until a session re-opens it
    let generation = manager.generation();
    assert_eq!(
        session_x.set("owner", "bob").await.unwrap_err(),
        PersistError::NamespaceErased { op: "set", namespace: "x".into() }
    );
    assert!(session_x.get::<_, String>("owner").await.is_err());
    assert_eq!(manager.generation(), generation);

    // y keeps working through the upgraded store
    append_text(&doc_y, " going");
    session_y.flush().await.unwrap();
    assert_eq!(session_y.get::<_, String>("owner").await.unwrap(), Some("ada".into()));

    let fresh_x = Doc::new();
    let _reopened_x = open_synced(&manager, "x", &fresh_x).await;
    assert_eq!(read_text(&fresh_x), "");

    let fresh_y = Doc::new();
    let _reopened_y = open_synced(&manager, "y", &fresh_y).await;
    assert_eq!(read_text(&fresh_y), "kept going");
}

// ─── Destroy before sync ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_destroy_before_sync() {
    let dir = tempdir().unwrap();
    let manager = shared_manager(&dir);

    let mut session =
        DocumentSession::open(manager.clone(), "early", Doc::new(), SessionConfig::for_testing())
            .unwrap();
    let mut events = session.take_event_rx().unwrap();
    session.destroy();

    session.when_synced().await.unwrap();
    assert!(!session.is_synced());
    assert_eq!(session.state(), SessionState::Destroyed);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(drain(&mut events), vec![PersistEvent::Destroyed]);
}

// ─── 600-edit scenario ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_600_edits_compact_and_replay_in_order() {
    let dir = tempdir().unwrap();
    let manager = shared_manager(&dir);

    let doc = Doc::new();
    let session = open_synced(&manager, "doc1", &doc).await;
    assert_eq!(session.size(), 0);

    let expected: Vec<String> = (0..600).map(|i| format!("item-{i}")).collect();
    for item in &expected {
        push_item(&doc, item);
    }
    session.flush().await.unwrap();
    let records = stored_records(&manager, "doc1").await;
    assert!(records < 10, "{records} records after compaction");

    let fresh = Doc::new();
    let _replica = open_synced(&manager, "doc1", &fresh).await;
    assert_eq!(read_items(&fresh), expected);
}

// ─── Key/value and store erasure ─────────────────────────────────────────────

#[tokio::test]
async fn test_accessors_fail_after_store_erased() {
    let dir = tempdir().unwrap();
    let manager = shared_manager(&dir);

    let doc = Doc::new();
    let mut session = open_synced(&manager, "erased", &doc).await;
    let mut events = session.take_event_rx().unwrap();
    session.set("a", &4).await.unwrap();

    manager.erase_store().await.unwrap();

    let err = session.get::<_, i32>("a").await.unwrap_err();
    assert_eq!(err, PersistError::Erased { op: "get" });
    assert_eq!(err.to_string(), "get() cannot be called after the store was erased");
    assert_eq!(
        session.set("a", &5).await.unwrap_err(),
        PersistError::Erased { op: "set" }
    );
    assert_eq!(session.del("a").await.unwrap_err(), PersistError::Erased { op: "del" });

    // Background writes surface the same failure
    append_text(&doc, "lost");
    session.flush().await.unwrap();
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        PersistEvent::WriteFailed(PersistError::Erased { .. })
    )));

    // A new session re-establishes an empty store
    let _next = open_synced(&manager, "erased", &Doc::new()).await;
    assert_eq!(session.get::<_, i32>("a").await.unwrap(), None);
}

// ─── Restart and many documents ──────────────────────────────────────────────

#[tokio::test]
async fn test_history_survives_restart() {
    let dir = tempdir().unwrap();
    {
        let manager = shared_manager(&dir);
        let doc = Doc::new();
        let session = open_synced(&manager, "restart", &doc).await;
        append_text(&doc, "Data that must survive a restart");
        session.flush().await.unwrap();
        session.set("version", &3u32).await.unwrap();
        session.destroy();
        manager.close().await.unwrap();
    }

    let manager = shared_manager(&dir);
    let doc = Doc::new();
    let session = open_synced(&manager, "restart", &doc).await;
    assert_eq!(read_text(&doc), "Data that must survive a restart");
    assert_eq!(session.get::<_, u32>("version").await.unwrap(), Some(3));
}

#[tokio::test]
async fn test_many_documents_share_one_store() {
    let dir = tempdir().unwrap();
    let manager = shared_manager(&dir);
    let names: Vec<String> = (0..4).map(|i| format!("doc-{i}")).collect();
    let docs: Vec<Doc> = names.iter().map(|_| Doc::new()).collect();

    let sessions: Vec<DocumentSession> = names
        .iter()
        .zip(&docs)
        .map(|(name, doc)| {
            DocumentSession::open(
                manager.clone(),
                name.as_str(),
                doc.clone(),
                SessionConfig::for_testing(),
            )
            .unwrap()
        })
        .collect();
    for result in join_all(sessions.iter().map(|s| s.when_synced())).await {
        result.unwrap();
    }
    // One generation for the initial open plus one per namespace
    assert_eq!(manager.generation(), 5);

    for (name, doc) in names.iter().zip(&docs) {
        append_text(doc, name);
    }
    for result in join_all(sessions.iter().map(|s| s.flush())).await {
        result.unwrap();
    }
    drop(sessions);

    for name in &names {
        let doc = Doc::new();
        let _session = open_synced(&manager, name, &doc).await;
        assert_eq!(&read_text(&doc), name);
    }
}
