//! Integration tests for local persistence: cache blobs, session restore,
//! and resumed replica identity.

use roomsync::cache::{CacheConfig, DocumentCache, SaveDebouncer};
use roomsync::crdt::{ContainerView, Document, Mutation, Value};
use roomsync::relay::{RelayConfig, SyncRelay};
use roomsync::session::{RoomSession, SessionConfig, UserIdentity};
use tempfile::TempDir;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

async fn start_test_relay() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let relay = SyncRelay::new(RelayConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        channel_capacity: 64,
    });
    tokio::spawn(async move {
        relay.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("ws://127.0.0.1:{port}")
}

fn session_config(url: &str, cache_dir: &TempDir) -> SessionConfig {
    let mut config = SessionConfig::for_testing(url);
    config.cache_dir = Some(cache_dir.path().to_path_buf());
    config
}

#[tokio::test]
async fn test_document_state_roundtrips_through_cache() {
    let dir = TempDir::new().unwrap();
    let cache = DocumentCache::new(dir.path()).unwrap();

    let mut doc = Document::new(Uuid::new_v4());
    doc.get_text("body").unwrap();
    doc.apply_local(
        "body",
        Mutation::TextInsert {
            index: 0,
            text: "persisted".into(),
        },
    )
    .unwrap();

    cache.save("doc-1", &doc.encode_state().unwrap()).unwrap();

    let blob = cache.load("doc-1").expect("blob should load back");
    let mut restored = Document::decode_state(&blob).unwrap();
    assert_eq!(restored.replica(), doc.replica());
    assert_eq!(restored.get_text("body").unwrap(), "persisted");
}

#[tokio::test]
async fn test_session_restores_from_cache() {
    let dir = TempDir::new().unwrap();

    // No relay: shutdown still persists the final state.
    let first = RoomSession::connect(
        session_config("ws://127.0.0.1:1", &dir),
        UserIdentity::new("Alice"),
        "notes",
        "room",
    )
    .await
    .unwrap();
    let original_id = first.client_id();

    first.document().lock().await.get_text("body").unwrap();
    first
        .edit(
            "body",
            Mutation::TextInsert {
                index: 0,
                text: "survives restart".into(),
            },
        )
        .await
        .unwrap();
    first.shutdown().await;

    let second = RoomSession::connect(
        session_config("ws://127.0.0.1:1", &dir),
        UserIdentity::new("Alice"),
        "notes",
        "room",
    )
    .await
    .unwrap();

    // Restored replica resumes its identity, not a fresh one.
    assert_eq!(second.client_id(), original_id);
    match second.snapshot("body").await.unwrap() {
        ContainerView::Text(text) => assert_eq!(text, "survives restart"),
        other => panic!("expected text view, got {other:?}"),
    }
    second.shutdown().await;
}

#[tokio::test]
async fn test_restored_session_syncs_full_history() {
    let dir = TempDir::new().unwrap();
    let url = start_test_relay().await;

    // Phase 1: edit offline against an unreachable relay, then shut down.
    let first = RoomSession::connect(
        session_config("ws://127.0.0.1:1", &dir),
        UserIdentity::new("Alice"),
        "doc",
        "restore-room",
    )
    .await
    .unwrap();
    first.document().lock().await.get_text("body").unwrap();
    first
        .edit(
            "body",
            Mutation::TextInsert {
                index: 0,
                text: "offline work".into(),
            },
        )
        .await
        .unwrap();
    first.shutdown().await;

    // Phase 2: restore and come online; a peer must receive the full
    // history, including the op chain minted before the restart.
    let restored = RoomSession::connect(
        session_config(&url, &dir),
        UserIdentity::new("Alice"),
        "doc",
        "restore-room",
    )
    .await
    .unwrap();
    restored
        .edit(
            "body",
            Mutation::TextInsert {
                index: 12,
                text: ", continued".into(),
            },
        )
        .await
        .unwrap();

    let bob = RoomSession::connect(
        SessionConfig::for_testing(&url),
        UserIdentity::new("Bob"),
        "doc",
        "restore-room",
    )
    .await
    .unwrap();

    let text = timeout(Duration::from_secs(3), async {
        loop {
            if let Ok(ContainerView::Text(text)) = bob.snapshot("body").await {
                if text.len() == "offline work, continued".len() {
                    return text;
                }
            }
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
    })
    .await
    .expect("peer should receive the restored history");

    assert_eq!(text, "offline work, continued");
    restored.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_corrupt_blob_starts_fresh() {
    let dir = TempDir::new().unwrap();

    let first = RoomSession::connect(
        session_config("ws://127.0.0.1:1", &dir),
        UserIdentity::new("Alice"),
        "doc",
        "room",
    )
    .await
    .unwrap();
    let original_id = first.client_id();
    first.document().lock().await.get_map("meta").unwrap();
    first
        .edit(
            "meta",
            Mutation::MapSet {
                key: "k".into(),
                value: Value::from(1i64),
            },
        )
        .await
        .unwrap();
    first.shutdown().await;

    // Clobber every blob in the cache directory.
    for entry in std::fs::read_dir(dir.path()).unwrap() {
        let path = entry.unwrap().path();
        if path.is_file() {
            std::fs::write(&path, b"not a cache blob").unwrap();
        }
    }

    // The corrupt blob is a cache miss: fresh document, fresh replica.
    let second = RoomSession::connect(
        session_config("ws://127.0.0.1:1", &dir),
        UserIdentity::new("Alice"),
        "doc",
        "room",
    )
    .await
    .unwrap();
    assert_ne!(second.client_id(), original_id);
    assert!(second.snapshot("meta").await.is_err());
    second.shutdown().await;
}

#[tokio::test]
async fn test_debouncer_triggers_on_op_threshold() {
    let dir = TempDir::new().unwrap();
    let config = CacheConfig::for_testing(dir.path());
    let mut debouncer = SaveDebouncer::new(&config);

    assert!(!debouncer.needs_save());
    debouncer.note_ops(1);
    assert!(!debouncer.needs_save());
    assert!(debouncer.dirty());
    debouncer.note_ops(1);
    assert!(debouncer.needs_save());

    debouncer.mark_saved();
    assert!(!debouncer.needs_save());
    assert!(!debouncer.dirty());
}

#[tokio::test]
async fn test_remove_clears_blob() {
    let dir = TempDir::new().unwrap();
    let cache = DocumentCache::new(dir.path()).unwrap();

    cache.save("doc", b"state").unwrap();
    assert!(cache.load("doc").is_some());

    cache.remove("doc").unwrap();
    assert!(cache.load("doc").is_none());
    // Removing again is fine.
    cache.remove("doc").unwrap();
}
