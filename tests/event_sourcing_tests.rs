//! Event Sourcing Integration Tests
//!
//! Tests for the durable event and snapshot layers:
//! - Monotonic, gap-free sequencing under concurrent appends
//! - Reloading streams from a file backend
//! - Replay idempotence
//! - Snapshot checksum verification and retention

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use game_state_persist::error::PersistError;
use game_state_persist::snapshot::{FileSnapshotStore, SnapshotStore};
use game_state_persist::storage::{FileBackend, StorageBackend};
use game_state_persist::types::{EventType, PersistedState, StateTransition};
use game_state_persist::utils::FakeClock;
use game_state_persist::{EventStore, SnapshotConfig, SnapshotManager};

async fn file_backend(dir: &TempDir) -> Arc<dyn StorageBackend> {
    Arc::new(FileBackend::open(dir.path().join("documents")).await.unwrap())
}

fn playing(round: i64) -> PersistedState {
    let raw = json!({"current_state": "playing", "round": round});
    PersistedState::from_raw("game-1", raw.as_object().unwrap())
}

#[tokio::test]
async fn test_concurrent_appends_are_gap_free() {
    let store = Arc::new(EventStore::new());

    let mut tasks = Vec::new();
    for i in 0..20 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store
                .append("game-1", EventType::Updated, json!({"tick": i}), None, None)
                .await
                .unwrap()
                .sequence_number
        }));
    }

    let mut sequences = Vec::new();
    for task in tasks {
        sequences.push(task.await.unwrap());
    }
    sequences.sort();
    assert_eq!(sequences, (1..=20).collect::<Vec<u64>>());
    assert_eq!(store.stream_version("game-1").await.unwrap(), 20);
    assert_eq!(store.verify_stream("game-1").await.unwrap(), 20);
}

#[tokio::test]
async fn test_stream_survives_restart() {
    let dir = TempDir::new().unwrap();
    let backend = file_backend(&dir).await;

    {
        let store = EventStore::new().with_backend(backend.clone());
        store
            .append("game-1", EventType::Created, json!({"current_state": "lobby"}), Some("host"), None)
            .await
            .unwrap();
        let start = StateTransition::new("lobby", "playing", "start").with_field("round", json!(1));
        store
            .append(
                "game-1",
                EventType::Transitioned,
                serde_json::to_value(&start).unwrap(),
                Some("host"),
                Some("req-7"),
            )
            .await
            .unwrap();
    }

    let reopened = EventStore::new().with_backend(backend);
    let events = reopened.get_events("game-1", 0, None).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].correlation_id.as_deref(), Some("req-7"));

    let state = reopened.get_current_state("game-1", 0).await.unwrap().unwrap();
    assert_eq!(state.current_state, "playing");
    assert_eq!(state.get("round"), Some(&json!(1)));

    let next = reopened
        .append("game-1", EventType::Updated, json!({"round": 2}), None, None)
        .await
        .unwrap();
    assert_eq!(next.sequence_number, 3);
    assert_eq!(reopened.list_stream_ids().await.unwrap(), vec!["game-1".to_string()]);
}

#[tokio::test]
async fn test_missing_event_is_reported_as_gap() {
    let dir = TempDir::new().unwrap();
    let backend = file_backend(&dir).await;

    let store = EventStore::new().with_backend(backend.clone());
    for round in 1..=3 {
        store
            .append("game-1", EventType::Updated, json!({"round": round}), None, None)
            .await
            .unwrap();
    }

    let keys = backend.list_prefix("events/game-1/").await.unwrap();
    assert_eq!(keys.len(), 3);
    assert!(backend.delete(&keys[1]).await.unwrap());

    let err = EventStore::new()
        .with_backend(backend)
        .verify_stream("game-1")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PersistError::SequenceGapDetected { expected: 2, found: 3, .. }
    ));
}

#[tokio::test]
async fn test_replay_is_idempotent() {
    let store = EventStore::new();
    store
        .append("game-1", EventType::Created, json!({"current_state": "lobby", "players": 2}), None, None)
        .await
        .unwrap();
    let start = StateTransition::new("lobby", "playing", "start").with_field("round", json!(1));
    store
        .append("game-1", EventType::Transitioned, serde_json::to_value(&start).unwrap(), None, None)
        .await
        .unwrap();
    store
        .append("game-1", EventType::Updated, json!({"scores": {"p1": 10}}), None, None)
        .await
        .unwrap();

    let first = store.get_current_state("game-1", 0).await.unwrap().unwrap();
    let second = store.get_current_state("game-1", 0).await.unwrap().unwrap();
    assert_eq!(first, second);

    let at_two = store.get_state_at_version("game-1", 2).await.unwrap().unwrap();
    let resumed = store.replay_onto("game-1", at_two, 2).await.unwrap();
    assert_eq!(resumed, first);
}

#[tokio::test]
async fn test_corrupted_snapshot_fails_checksum() {
    let dir = TempDir::new().unwrap();
    let file_store = Arc::new(FileSnapshotStore::open(dir.path().join("snapshots")).await.unwrap());
    let manager = SnapshotManager::new(vec![file_store.clone() as Arc<dyn SnapshotStore>], SnapshotConfig::default());

    let ids = manager.create_snapshot("game-1", &playing(4), vec![]).await.unwrap();
    let snapshot_id = ids[0].clone();

    let (metadata, restored) = manager
        .load_snapshot("game-1", Some(&snapshot_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(restored.get("round"), Some(&json!(4)));
    assert!(!metadata.compressed);

    let body_path = file_store
        .state_dir("game-1")
        .join(format!("{}.json", snapshot_id));
    let mut body = std::fs::read(&body_path).unwrap();
    let middle = body.len() / 2;
    body[middle] ^= 0x01;
    std::fs::write(&body_path, body).unwrap();

    let err = manager
        .load_snapshot("game-1", Some(&snapshot_id))
        .await
        .unwrap_err();
    assert!(matches!(err, PersistError::ChecksumMismatch { .. }));
}

#[tokio::test]
async fn test_retention_keeps_most_recent() {
    let dir = TempDir::new().unwrap();
    let file_store = Arc::new(FileSnapshotStore::open(dir.path().join("snapshots")).await.unwrap());
    let clock = FakeClock::new();
    let config = SnapshotConfig {
        max_snapshots: 3,
        ..Default::default()
    };
    let manager = SnapshotManager::new(vec![file_store.clone() as Arc<dyn SnapshotStore>], config)
        .with_clock(Arc::new(clock.clone()));

    for round in 1..=5 {
        manager.create_snapshot("game-1", &playing(round), vec![]).await.unwrap();
        clock.advance(chrono::Duration::seconds(1));
    }

    let listed = file_store.list("game-1").await.unwrap();
    assert_eq!(listed.len(), 3);

    let newest = manager.restore_snapshot("game-1", None).await.unwrap().unwrap();
    assert_eq!(newest.get("round"), Some(&json!(5)));

    let rounds: Vec<i64> = {
        let mut rounds = Vec::new();
        for metadata in manager.list_metadata("game-1").await.unwrap() {
            let (_, state) = manager
                .load_snapshot("game-1", Some(&metadata.snapshot_id))
                .await
                .unwrap()
                .unwrap();
            rounds.push(state.get("round").and_then(|v| v.as_i64()).unwrap());
        }
        rounds
    };
    assert_eq!(rounds, vec![5, 4, 3]);
}
