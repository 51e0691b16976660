use chrono::{Duration, Utc};
use rusqlite::Connection;
use tempfile::TempDir;

use noesis_core::config::{DecayConfig, StoreConfig};
use noesis_core::services::decay::DecayEngine;
use noesis_core::services::store::{NewItem, Store};

fn open_store(dir: &TempDir) -> Store {
    let cfg = StoreConfig::default();
    Store::open(&dir.path().join("engine.db"), &cfg).expect("store open")
}

fn ingest(store: &Store, id: &str, class: &str) -> String {
    store
        .insert_item(&NewItem {
            item_id: Some(id.to_string()),
            content: format!("content for {id}"),
            embedding: vec![1.0, 0.0, 0.0],
            item_class: class.to_string(),
            project_code: None,
        })
        .expect("insert item")
}

/// Backdate timestamps through a second connection, the way an aged row
/// would look on disk.
fn backdate(dir: &TempDir, id: &str, created_h: i64, accessed_h: i64) {
    let conn = Connection::open(dir.path().join("engine.db")).expect("open sqlite");
    let created = (Utc::now() - Duration::hours(created_h)).to_rfc3339();
    let accessed = (Utc::now() - Duration::hours(accessed_h)).to_rfc3339();
    conn.execute(
        "UPDATE items SET created_at=?1, last_accessed_at=?2, score_computed_at=?2 WHERE item_id=?3",
        (&created, &accessed, id),
    )
    .expect("backdate");
}

#[test]
fn score_is_a_pure_function_of_its_inputs() {
    let engine = DecayEngine::new(DecayConfig::default());
    let now = Utc::now();
    let created = now - Duration::hours(500);
    let accessed = now - Duration::hours(72);

    let a = engine.score_at("meeting_note", created, accessed, 4, now);
    let b = engine.score_at("meeting_note", created, accessed, 4, now);
    assert_eq!(a, b, "recomputing with identical inputs must not drift");
}

#[test]
fn refresh_twice_without_access_yields_the_same_value() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    let engine = DecayEngine::new(DecayConfig::default());

    let id = ingest(&store, "m1", "meeting_note");
    backdate(&dir, &id, 300, 100);

    let first = engine.refresh(&store, &id).expect("refresh");
    let second = engine.refresh(&store, &id).expect("refresh again");
    assert!(
        (first - second).abs() < 1e-6,
        "no hidden state: {first} vs {second}"
    );
}

#[test]
fn access_never_decreases_the_score() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    let engine = DecayEngine::new(DecayConfig::default());

    let id = ingest(&store, "m1", "meeting_note");
    backdate(&dir, &id, 400, 200);

    let before = engine.refresh(&store, &id).expect("refresh");
    let after = engine.touch(&store, &id).expect("touch");
    assert!(
        after >= before,
        "touch must not lower the score: {before} -> {after}"
    );

    let item = store.require_item(&id).expect("reload");
    assert_eq!(item.access_count, 1);
}

#[test]
fn score_stays_within_floor_and_ceiling() {
    let cfg = DecayConfig::default();
    let floor = cfg.floor;
    let engine = DecayEngine::new(cfg);
    let now = Utc::now();

    // Ancient, never re-accessed: pinned at the floor, not erased.
    let ancient = engine.score_at(
        "meeting_note",
        now - Duration::days(3650),
        now - Duration::days(3650),
        0,
        now,
    );
    assert!((ancient - floor).abs() < 1e-9, "aged to floor, got {ancient}");

    // Brand new and heavily reinforced: capped at 1.0.
    let hot = engine.score_at("meeting_note", now, now, 1_000_000, now);
    assert!(hot <= 1.0, "boost must not push past 1.0, got {hot}");
}

#[test]
fn decision_records_outlive_meeting_notes() {
    let engine = DecayEngine::new(DecayConfig::default());
    let now = Utc::now();
    let created = now - Duration::hours(300);
    let accessed = now - Duration::hours(300);

    let note = engine.score_at("meeting_note", created, accessed, 0, now);
    let decision = engine.score_at("decision_record", created, accessed, 0, now);
    assert!(
        decision > note,
        "decision records decay slower: {decision} vs {note}"
    );
}

#[test]
fn stored_score_is_served_until_stale() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    let engine = DecayEngine::new(DecayConfig::default());

    let id = ingest(&store, "m1", "meeting_note");
    // Fresh row: stored score (1.0 at ingest) is within the recompute
    // interval and served untouched.
    let item = store.require_item(&id).expect("load");
    let served = engine.refresh_if_stale(&store, &item).expect("serve");
    assert_eq!(served, item.decay_score);

    // Stale row: recomputed and written back.
    backdate(&dir, &id, 500, 200);
    let item = store.require_item(&id).expect("reload");
    let recomputed = engine.refresh_if_stale(&store, &item).expect("recompute");
    assert!(recomputed < 1.0);
    let after = store.require_item(&id).expect("reload again");
    assert!((after.decay_score - recomputed).abs() < 1e-9);
}
