use chrono::{Duration, Utc};
use tempfile::TempDir;

use noesis_core::config::{EpisodeConfig, StoreConfig};
use noesis_core::error::EngineError;
use noesis_core::services::episodes::{
    EngineEvent, EpisodeStatus, EventKind, ExtractiveSummarizer, SegmentAction, Segmenter,
};
use noesis_core::services::store::Store;

fn open_store(dir: &TempDir) -> Store {
    Store::open(&dir.path().join("engine.db"), &StoreConfig::default()).expect("store open")
}

fn segmenter() -> Segmenter {
    Segmenter::new(
        EpisodeConfig::default(),
        Box::new(ExtractiveSummarizer { sentences: 2 }),
    )
}

fn event(id: &str, project: &str, kind: EventKind, topics: &[&str], minutes_ago: i64) -> EngineEvent {
    EngineEvent {
        event_id: id.to_string(),
        project_code: project.to_string(),
        kind,
        description: format!("event {id} for {project}"),
        topics: topics.iter().map(|t| t.to_string()).collect(),
        item_id: None,
        occurred_at: Utc::now() - Duration::minutes(minutes_ago),
    }
}

#[test]
fn first_event_opens_an_episode() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    let seg = segmenter();

    let out = seg
        .ingest(&store, &event("e1", "atlas", EventKind::Meeting, &["kickoff"], 10))
        .expect("ingest");
    assert_eq!(out.action, SegmentAction::Opened);
    assert_eq!(out.episode.status, EpisodeStatus::Active);
    assert!(out.episode.ended_at.is_none(), "active episode has no end");
    assert_eq!(out.episode.key_events.len(), 1);
    assert_eq!(out.episode.topics, vec!["kickoff".to_string()]);
}

#[test]
fn cohesive_events_extend_and_merge_topics() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    let seg = segmenter();

    seg.ingest(&store, &event("e1", "atlas", EventKind::Meeting, &["kickoff"], 60))
        .expect("open");
    let out = seg
        .ingest(&store, &event("e2", "atlas", EventKind::Action, &["kickoff", "budget"], 30))
        .expect("extend");

    assert_eq!(out.action, SegmentAction::Extended);
    assert_eq!(out.episode.key_events.len(), 2);
    assert_eq!(
        out.episode.topics,
        vec!["budget".to_string(), "kickoff".to_string()]
    );
}

#[test]
fn topicless_events_still_extend_within_the_idle_window() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    let seg = segmenter();

    seg.ingest(&store, &event("e1", "atlas", EventKind::Meeting, &["kickoff"], 60))
        .expect("open");
    // No topics, no graph anchor: temporal-only cohesion must carry it.
    let out = seg
        .ingest(&store, &event("e2", "atlas", EventKind::Action, &[], 30))
        .expect("extend");
    assert_eq!(out.action, SegmentAction::Extended);
}

#[test]
fn a_gap_beyond_the_idle_window_closes_and_reopens() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    let seg = segmenter();

    let first = seg
        .ingest(&store, &event("e1", "atlas", EventKind::Meeting, &["kickoff"], 600))
        .expect("open");
    // Same topic, but the silence exceeded the window: never extend.
    let out = seg
        .ingest(&store, &event("e2", "atlas", EventKind::Meeting, &["kickoff"], 5))
        .expect("reopen");

    match &out.action {
        SegmentAction::Reopened { closed_episode_id } => {
            assert_eq!(closed_episode_id, &first.episode.episode_id);
        }
        other => panic!("expected Reopened, got {other:?}"),
    }

    let closed = seg
        .require(&store, &first.episode.episode_id)
        .expect("reload closed");
    assert_eq!(closed.status, EpisodeStatus::Completed);
    let ended = closed.ended_at.expect("frozen end");
    assert_eq!(
        ended.timestamp(),
        closed.last_event_at.timestamp(),
        "ended_at freezes to the last event"
    );
    assert!(closed.started_at <= ended);
}

#[test]
fn at_most_one_active_episode_per_key() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    let seg = segmenter();

    // Meetings and decisions segment independently; a burst of events per key
    // must still leave exactly one active episode for each.
    for (i, minutes_ago) in (0..6).map(|i| (i, 600 - i * 30)) {
        seg.ingest(
            &store,
            &event(&format!("m{i}"), "atlas", EventKind::Meeting, &[], minutes_ago),
        )
        .expect("meeting");
        seg.ingest(
            &store,
            &event(&format!("d{i}"), "atlas", EventKind::Decision, &[], minutes_ago),
        )
        .expect("decision");
    }

    let active = seg
        .load_with_status(&store, EpisodeStatus::Active)
        .expect("actives");
    let phase = active
        .iter()
        .filter(|e| e.episode_type.as_str() == "project_phase")
        .count();
    let decisions = active
        .iter()
        .filter(|e| e.episode_type.as_str() == "decision_sequence")
        .count();
    assert_eq!(phase, 1, "one active project_phase episode");
    assert_eq!(decisions, 1, "one active decision_sequence episode");
}

#[test]
fn idle_sweep_closes_stale_actives_without_an_event() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    let seg = segmenter();

    let stale = seg
        .ingest(&store, &event("e1", "atlas", EventKind::Meeting, &[], 500))
        .expect("open stale");
    let fresh = seg
        .ingest(&store, &event("e2", "borealis", EventKind::Meeting, &[], 5))
        .expect("open fresh");

    let closed = seg.sweep(&store, Utc::now()).expect("sweep");
    assert_eq!(closed, vec![stale.episode.episode_id.clone()]);

    // Sweeping again is a no-op: the conditional close only moves actives.
    let closed_again = seg.sweep(&store, Utc::now()).expect("sweep again");
    assert!(closed_again.is_empty());

    let fresh_reloaded = seg
        .require(&store, &fresh.episode.episode_id)
        .expect("reload fresh");
    assert_eq!(fresh_reloaded.status, EpisodeStatus::Active);
}

#[test]
fn abandon_is_explicit_and_only_from_active() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    let seg = segmenter();

    let out = seg
        .ingest(&store, &event("e1", "atlas", EventKind::Meeting, &[], 10))
        .expect("open");
    let abandoned = seg
        .abandon(&store, &out.episode.episode_id)
        .expect("abandon");
    assert_eq!(abandoned.status, EpisodeStatus::Abandoned);

    match seg.abandon(&store, &out.episode.episode_id) {
        Err(EngineError::InvalidTransition { from, .. }) => assert_eq!(from, "abandoned"),
        other => panic!("expected InvalidTransition, got {other:?}"),
    }
}
