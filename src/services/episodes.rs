// src/services/episodes.rs
//! Episode segmenter: groups the time-ordered event stream into bounded,
//! summarized episodes.
//!
//! State machine per (project_code, episode_type) key:
//! - Open: no active episode for the key -> create one seeded by the event.
//! - Extend: active episode + event coheres (shared topic, graph link within
//!   the hop budget, or plain temporal proximity inside the idle window).
//! - Close-and-reopen: the gap since the last event exceeds the idle window;
//!   the old episode completes with its own last event as `ended_at`.
//! - Idle sweep: `sweep` closes stale actives on a timer, with the same
//!   conditional-close SQL, so it is safe to run beside ingestion.
//!
//! The Open/Extend/Close decision is serialized per key through conditional
//! updates on (status='active', version): two racing events cannot leave two
//! active episodes behind.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::num::NonZeroU32;

use summary::{Language, Summarizer as SentenceRanker};

use crate::config::EpisodeConfig;
use crate::error::{EngineError, Result};
use crate::services::graph;
use crate::services::store::{parse_ts, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Meeting,
    Action,
    Decision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeType {
    ProjectPhase,
    DecisionSequence,
}

impl EpisodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpisodeType::ProjectPhase => "project_phase",
            EpisodeType::DecisionSequence => "decision_sequence",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "project_phase" => Some(EpisodeType::ProjectPhase),
            "decision_sequence" => Some(EpisodeType::DecisionSequence),
            _ => None,
        }
    }

    /// Decisions segment into their own narrative; meetings and actions
    /// belong to the project phase timeline.
    pub fn for_kind(kind: EventKind) -> Self {
        match kind {
            EventKind::Decision => EpisodeType::DecisionSequence,
            EventKind::Meeting | EventKind::Action => EpisodeType::ProjectPhase,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeStatus {
    Active,
    Completed,
    Abandoned,
}

impl EpisodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpisodeStatus::Active => "active",
            EpisodeStatus::Completed => "completed",
            EpisodeStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(EpisodeStatus::Active),
            "completed" => Some(EpisodeStatus::Completed),
            "abandoned" => Some(EpisodeStatus::Abandoned),
            _ => None,
        }
    }
}

/// One event from the external stream boundary.
#[derive(Debug, Clone)]
pub struct EngineEvent {
    pub event_id: String,
    pub project_code: String,
    pub kind: EventKind,
    pub description: String,
    pub topics: Vec<String>,
    /// Knowledge item this event is anchored to, when one exists; feeds the
    /// graph cohesion signal.
    pub item_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Stored entry in an episode's ordered `key_events` column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRef {
    pub event_id: String,
    pub description: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub item_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Episode {
    pub episode_id: String,
    pub project_code: String,
    pub episode_type: EpisodeType,
    pub title: String,
    pub summary: String,
    pub status: EpisodeStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_event_at: DateTime<Utc>,
    pub key_events: Vec<EventRef>,
    pub topics: Vec<String>,
    pub decay_score: f64,
    pub access_count: i64,
    pub version: i64,
}

/// What ingest did with the event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentAction {
    Opened,
    Extended,
    /// Previous active episode completed; its id is carried for audit.
    Reopened { closed_episode_id: String },
}

#[derive(Debug)]
pub struct IngestOutcome {
    pub episode: Episode,
    pub action: SegmentAction,
}

/// Episode summaries regenerate through this seam; production injects an
/// LLM-backed implementation, the default stays extractive and local.
pub trait Summarizer: Send {
    fn summarize(&self, text: &str) -> Result<String>;
}

pub struct ExtractiveSummarizer {
    pub sentences: u32,
}

impl Summarizer for ExtractiveSummarizer {
    fn summarize(&self, text: &str) -> Result<String> {
        let n = NonZeroU32::new(self.sentences).unwrap_or(NonZeroU32::MIN);
        let picked = SentenceRanker::new(Language::English).summarize_sentences(text, n);
        if picked.is_empty() {
            Ok(text.to_string())
        } else {
            Ok(picked.join(" "))
        }
    }
}

pub struct Segmenter {
    cfg: EpisodeConfig,
    summarizer: Box<dyn Summarizer>,
}

impl Segmenter {
    pub fn new(cfg: EpisodeConfig, summarizer: Box<dyn Summarizer>) -> Self {
        Self { cfg, summarizer }
    }

    /// Route one event: Open, Extend, or Close-and-reopen for its key.
    pub fn ingest(&self, store: &Store, event: &EngineEvent) -> Result<IngestOutcome> {
        if event.project_code.trim().is_empty() {
            return Err(EngineError::schema("event", "project_code must not be empty"));
        }
        let episode_type = EpisodeType::for_kind(event.kind);

        let Some(active) = self.load_active(store, &event.project_code, episode_type)? else {
            let episode = self.open(store, event, episode_type)?;
            return Ok(IngestOutcome {
                episode,
                action: SegmentAction::Opened,
            });
        };

        let gap = event.occurred_at.signed_duration_since(active.last_event_at);
        if gap > self.idle_window() {
            // Idle window elapsed: pure silence ends the narrative even when
            // topics would still match.
            self.close(store, &active, EpisodeStatus::Completed)?;
            let episode = self.open(store, event, episode_type)?;
            return Ok(IngestOutcome {
                episode,
                action: SegmentAction::Reopened {
                    closed_episode_id: active.episode_id,
                },
            });
        }

        let reason = self.cohesion_reason(store, &active, event);
        tracing::debug!(
            episode_id = %active.episode_id,
            event_id = %event.event_id,
            cohesion = reason,
            "extending active episode"
        );
        let episode = self.extend(store, active, event)?;
        Ok(IngestOutcome {
            episode,
            action: SegmentAction::Extended,
        })
    }

    /// Periodic close of actives whose idle window elapsed without any event
    /// arriving. Returns the ids it closed. Concurrent-safe: the conditional
    /// close is the same one ingest uses.
    pub fn sweep(&self, store: &Store, now: DateTime<Utc>) -> Result<Vec<String>> {
        let cutoff = now - self.idle_window();
        let stale: Vec<Episode> = self
            .load_with_status(store, EpisodeStatus::Active)?
            .into_iter()
            .filter(|ep| ep.last_event_at < cutoff)
            .collect();

        let mut closed = Vec::new();
        for ep in stale {
            if self.close(store, &ep, EpisodeStatus::Completed)? {
                closed.push(ep.episode_id);
            }
        }
        Ok(closed)
    }

    /// Human reviewer marks an active episode abandoned.
    pub fn abandon(&self, store: &Store, episode_id: &str) -> Result<Episode> {
        let ep = self.require(store, episode_id)?;
        if ep.status != EpisodeStatus::Active {
            return Err(EngineError::InvalidTransition {
                entity: "episode",
                id: episode_id.to_string(),
                from: ep.status.as_str().to_string(),
                attempted: EpisodeStatus::Abandoned.as_str().to_string(),
            });
        }
        if !self.close(store, &ep, EpisodeStatus::Abandoned)? {
            return Err(self.stale_close(store, episode_id, EpisodeStatus::Abandoned)?);
        }
        self.require(store, episode_id)
    }

    // ---------- state machine steps ----------

    fn open(
        &self,
        store: &Store,
        event: &EngineEvent,
        episode_type: EpisodeType,
    ) -> Result<Episode> {
        let episode_id = uuid::Uuid::new_v4().to_string();
        let key_events = vec![event_ref(event)];
        let topics = normalize_topics(&event.topics);
        let title = self.title_for(event, episode_type);
        let summary = self.render_summary(&key_events);
        store.db.execute(
            r#"
            INSERT INTO episodes(episode_id, project_code, episode_type, title, summary,
                                 status, started_at, last_event_at, key_events, topics,
                                 decay_score, access_count, version)
            VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6, ?6, ?7, ?8, 1.0, 0, 0)
            "#,
            (
                &episode_id,
                &event.project_code,
                episode_type.as_str(),
                &title,
                &summary,
                event.occurred_at.to_rfc3339(),
                serde_json::to_string(&key_events)?,
                serde_json::to_string(&topics)?,
            ),
        )?;
        self.require(store, &episode_id)
    }

    /// Append the event and refresh topics/summary under the episode's
    /// version stamp; retries reload so a racing close diverts to reopen.
    fn extend(&self, store: &Store, mut current: Episode, event: &EngineEvent) -> Result<Episode> {
        for attempt in 0..store.write_attempts() {
            if current.status != EpisodeStatus::Active {
                // Lost the race to a concurrent close; the event starts the
                // next episode instead.
                return self.open(store, event, current.episode_type);
            }

            let mut key_events = current.key_events.clone();
            key_events.push(event_ref(event));
            let mut topics: BTreeSet<String> = current.topics.iter().cloned().collect();
            topics.extend(normalize_topics(&event.topics));
            let topics: Vec<String> = topics.into_iter().collect();
            let summary = self.render_summary(&key_events);
            let last_event_at = event.occurred_at.max(current.last_event_at);

            let applied = store.db.execute(
                r#"
                UPDATE episodes
                SET key_events=?1, topics=?2, summary=?3, last_event_at=?4, version=version+1
                WHERE episode_id=?5 AND status='active' AND version=?6
                "#,
                (
                    serde_json::to_string(&key_events)?,
                    serde_json::to_string(&topics)?,
                    &summary,
                    last_event_at.to_rfc3339(),
                    &current.episode_id,
                    current.version,
                ),
            )?;
            if applied == 1 {
                return self.require(store, &current.episode_id);
            }
            store.backoff(attempt);
            current = self.require(store, &current.episode_id)?;
        }
        Err(store.conflict("episode", &current.episode_id))
    }

    /// Conditional close: only an `active` row at the observed version moves.
    /// Returns false when another writer already closed it.
    fn close(&self, store: &Store, episode: &Episode, to: EpisodeStatus) -> Result<bool> {
        let applied = store.db.execute(
            r#"
            UPDATE episodes
            SET status=?1, ended_at=?2, version=version+1
            WHERE episode_id=?3 AND status='active'
            "#,
            (
                to.as_str(),
                episode.last_event_at.to_rfc3339(),
                &episode.episode_id,
            ),
        )?;
        Ok(applied == 1)
    }

    fn stale_close(
        &self,
        store: &Store,
        episode_id: &str,
        attempted: EpisodeStatus,
    ) -> Result<EngineError> {
        let ep = self.require(store, episode_id)?;
        Ok(EngineError::InvalidTransition {
            entity: "episode",
            id: episode_id.to_string(),
            from: ep.status.as_str().to_string(),
            attempted: attempted.as_str().to_string(),
        })
    }

    // ---------- cohesion ----------

    /// Which signal keeps this event in the episode. Temporal proximity is
    /// the fallback: silence inside the window never fragments a narrative.
    fn cohesion_reason(&self, store: &Store, episode: &Episode, event: &EngineEvent) -> &'static str {
        let event_topics = normalize_topics(&event.topics);
        if event_topics
            .iter()
            .any(|t| episode.topics.iter().any(|have| have == t))
        {
            return "topic";
        }
        if self.graph_connected(store, episode, event) {
            return "graph";
        }
        "temporal"
    }

    fn graph_connected(&self, store: &Store, episode: &Episode, event: &EngineEvent) -> bool {
        let Some(event_item) = event.item_id.as_deref() else {
            return false;
        };
        let reached = match graph::neighbors(store, event_item, self.cfg.cohesion_hops, None) {
            Ok(r) => r,
            Err(_) => return false,
        };
        episode
            .key_events
            .iter()
            .filter_map(|e| e.item_id.as_deref())
            .any(|anchor| anchor == event_item || reached.contains_key(anchor))
    }

    // ---------- reads & rendering ----------

    fn idle_window(&self) -> ChronoDuration {
        ChronoDuration::minutes(self.cfg.idle_window_minutes)
    }

    fn title_for(&self, event: &EngineEvent, episode_type: EpisodeType) -> String {
        let lead: String = event.description.chars().take(self.cfg.title_len).collect();
        format!("{} / {}: {}", event.project_code, episode_type.as_str(), lead)
    }

    fn render_summary(&self, key_events: &[EventRef]) -> String {
        let text = key_events
            .iter()
            .map(|e| e.description.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if text.len() <= self.cfg.summary_min_chars {
            return text;
        }
        match self.summarizer.summarize(&text) {
            Ok(s) if !s.trim().is_empty() => s,
            Ok(_) | Err(_) => {
                // Keep the pipeline robust: fall back to a truncated lead.
                let lead: String = text.chars().take(self.cfg.summary_min_chars).collect();
                lead
            }
        }
    }

    pub fn require(&self, store: &Store, episode_id: &str) -> Result<Episode> {
        self.load_by_id(store, episode_id)?
            .ok_or_else(|| EngineError::not_found("episode", episode_id))
    }

    pub fn load_by_id(&self, store: &Store, episode_id: &str) -> Result<Option<Episode>> {
        let mut stmt = store
            .db
            .prepare(&format!("{SELECT_EPISODE} WHERE episode_id=?1"))?;
        let mut rows = stmt.query([episode_id])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(episode_from_row(row)?));
        }
        Ok(None)
    }

    fn load_active(
        &self,
        store: &Store,
        project_code: &str,
        episode_type: EpisodeType,
    ) -> Result<Option<Episode>> {
        let mut stmt = store.db.prepare(&format!(
            "{SELECT_EPISODE}
             WHERE project_code=?1 AND episode_type=?2 AND status='active'
             ORDER BY last_event_at DESC LIMIT 1"
        ))?;
        let mut rows = stmt.query((project_code, episode_type.as_str()))?;
        if let Some(row) = rows.next()? {
            return Ok(Some(episode_from_row(row)?));
        }
        Ok(None)
    }

    pub fn load_with_status(&self, store: &Store, status: EpisodeStatus) -> Result<Vec<Episode>> {
        let mut stmt = store
            .db
            .prepare(&format!("{SELECT_EPISODE} WHERE status=?1 ORDER BY last_event_at ASC"))?;
        let rows = stmt.query_map([status.as_str()], RawEpisodeRow::read)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?.decode()?);
        }
        Ok(out)
    }
}

const SELECT_EPISODE: &str = "SELECT episode_id, project_code, episode_type, title, summary,
        status, started_at, ended_at, last_event_at, key_events, topics,
        decay_score, access_count, version
 FROM episodes";

struct RawEpisodeRow {
    episode_id: String,
    project_code: String,
    episode_type: String,
    title: String,
    summary: String,
    status: String,
    started_at: String,
    ended_at: Option<String>,
    last_event_at: String,
    key_events: String,
    topics: String,
    decay_score: f64,
    access_count: i64,
    version: i64,
}

impl RawEpisodeRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            episode_id: row.get(0)?,
            project_code: row.get(1)?,
            episode_type: row.get(2)?,
            title: row.get(3)?,
            summary: row.get(4)?,
            status: row.get(5)?,
            started_at: row.get(6)?,
            ended_at: row.get(7)?,
            last_event_at: row.get(8)?,
            key_events: row.get(9)?,
            topics: row.get(10)?,
            decay_score: row.get(11)?,
            access_count: row.get(12)?,
            version: row.get(13)?,
        })
    }

    fn decode(self) -> Result<Episode> {
        let episode_type = EpisodeType::parse(&self.episode_type)
            .ok_or_else(|| EngineError::schema("episode", "unknown episode_type"))?;
        let status = EpisodeStatus::parse(&self.status)
            .ok_or_else(|| EngineError::schema("episode", "unknown status"))?;
        Ok(Episode {
            episode_id: self.episode_id,
            project_code: self.project_code,
            episode_type,
            title: self.title,
            summary: self.summary,
            status,
            started_at: parse_ts(&self.started_at),
            ended_at: self.ended_at.as_deref().map(parse_ts),
            last_event_at: parse_ts(&self.last_event_at),
            key_events: serde_json::from_str(&self.key_events)?,
            topics: serde_json::from_str(&self.topics)?,
            decay_score: self.decay_score,
            access_count: self.access_count,
            version: self.version,
        })
    }
}

fn episode_from_row(row: &rusqlite::Row<'_>) -> Result<Episode> {
    RawEpisodeRow::read(row)?.decode()
}

fn event_ref(event: &EngineEvent) -> EventRef {
    EventRef {
        event_id: event.event_id.clone(),
        description: event.description.clone(),
        occurred_at: event.occurred_at,
        topics: normalize_topics(&event.topics),
        item_id: event.item_id.clone(),
    }
}

fn normalize_topics(topics: &[String]) -> Vec<String> {
    let set: BTreeSet<String> = topics
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    set.into_iter().collect()
}
