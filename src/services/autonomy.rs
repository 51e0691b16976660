// src/services/autonomy.rs
//! Autonomy controller: how much supervision an (agent, action) pair needs.
//!
//! Levels are ordinal: 1 manual, 2 supervised, 3 autonomous. The gating is
//! asymmetric: demotions are created pre-approved and take effect
//! immediately; promotions are created pending and wait for a human.
//! `autonomy_levels` is the materialized current level, updated in the same
//! transaction as each approval; the transition log stays the audit source
//! of truth.
//!
//! Mistake-pattern detection also lives here: repeated execution failures on
//! the same action accumulate into an active pattern, and crossing the
//! occurrence threshold forces a demotion without waiting for the next
//! calibration cycle.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::config::AutonomyConfig;
use crate::error::{EngineError, Result};
use crate::services::calibration::{self, CalibrationRecord};
use crate::services::proposals::Proposal;
use crate::services::store::{parse_ts, Store};

pub const LEVEL_MANUAL: i64 = 1;
pub const LEVEL_SUPERVISED: i64 = 2;
pub const LEVEL_AUTONOMOUS: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionStatus {
    Pending,
    Approved,
    Rejected,
}

impl TransitionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionStatus::Pending => "pending",
            TransitionStatus::Approved => "approved",
            TransitionStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TransitionStatus::Pending),
            "approved" => Some(TransitionStatus::Approved),
            "rejected" => Some(TransitionStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AutonomyTransition {
    pub transition_id: String,
    pub agent_id: String,
    pub action_name: String,
    pub previous_level: i64,
    pub new_level: i64,
    pub reason: String,
    pub evidence: Value,
    pub approved_by: Option<String>,
    pub status: TransitionStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MistakePattern {
    pub pattern_id: String,
    pub agent_id: String,
    pub action_name: String,
    pub pattern_description: String,
    pub category: String,
    pub occurrence_count: i64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub status: String,
    pub resolution_notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Learning {
    pub learning_id: String,
    pub agent_id: String,
    pub learning_type: String,
    pub content: String,
    pub confidence: f64,
    pub applied_count: i64,
    pub last_applied_at: Option<DateTime<Utc>>,
}

// ---------- current level ----------

/// Materialized current level; level 1 (manual) when no approved transition
/// has ever touched the pair.
pub fn current_level(store: &Store, agent_id: &str, action_name: &str) -> Result<i64> {
    let mut stmt = store
        .db
        .prepare("SELECT level FROM autonomy_levels WHERE agent_id=?1 AND action_name=?2")?;
    let mut rows = stmt.query((agent_id, action_name))?;
    if let Some(row) = rows.next()? {
        return Ok(row.get(0)?);
    }
    Ok(LEVEL_MANUAL)
}

// ---------- evaluation ----------

/// Inspect the latest calibration record and any active mistake pattern and
/// emit at most one transition candidate. Safety-biased: the demotion check
/// runs first and needs no minimum sample; promotion needs tight calibration
/// over enough data and a clean pattern slate. Insufficient data is a valid
/// "no transition" outcome.
pub fn evaluate(
    store: &Store,
    cfg: &AutonomyConfig,
    agent_id: &str,
    action_name: &str,
) -> Result<Option<AutonomyTransition>> {
    let level = current_level(store, agent_id, action_name)?;
    let cal = calibration::latest(store, agent_id, action_name)?;
    let pattern = active_pattern(store, agent_id, action_name)?;

    let mistake_trip = pattern
        .as_ref()
        .map(|p| p.occurrence_count >= cfg.mistake_threshold as i64)
        .unwrap_or(false);
    let error_trip = cal
        .as_ref()
        .map(|c| c.calibration_error > cfg.demote_error_threshold)
        .unwrap_or(false);

    if (mistake_trip || error_trip) && level > LEVEL_MANUAL {
        let reason = if mistake_trip {
            "active mistake pattern crossed its occurrence threshold"
        } else {
            "calibration error above the demotion threshold"
        };
        let evidence = demotion_evidence(cal.as_ref(), pattern.as_ref());
        let t = insert_transition(
            store,
            agent_id,
            action_name,
            level,
            level - 1,
            reason,
            evidence,
            TransitionStatus::Approved,
            Some("autonomy-controller"),
        )?;
        apply_level(store, agent_id, action_name, t.new_level)?;
        return Ok(Some(t));
    }

    if level < LEVEL_AUTONOMOUS && pattern.is_none() {
        if let Some(c) = cal.as_ref() {
            if c.total_actions >= cfg.min_sample && c.calibration_error < cfg.promote_error_threshold
            {
                // One pending promotion per pair at a time; evaluate stays
                // idempotent between reviews.
                if has_pending(store, agent_id, action_name)? {
                    return Ok(None);
                }
                let t = insert_transition(
                    store,
                    agent_id,
                    action_name,
                    level,
                    level + 1,
                    "calibration error below the promotion threshold over a full sample",
                    promotion_evidence(c),
                    TransitionStatus::Pending,
                    None,
                )?;
                return Ok(Some(t));
            }
        }
    }

    Ok(None)
}

/// Approve or reject a pending promotion. Approval moves the materialized
/// level in the same transaction as the status flip. A transition whose
/// `previous_level` no longer matches the current level is stale and
/// rejected as an `InvalidTransition`.
pub fn resolve_transition(
    store: &Store,
    transition_id: &str,
    approver: &str,
    approve: bool,
) -> Result<AutonomyTransition> {
    let t = require_transition(store, transition_id)?;
    if t.status != TransitionStatus::Pending {
        return Err(EngineError::InvalidTransition {
            entity: "autonomy_transition",
            id: transition_id.to_string(),
            from: t.status.as_str().to_string(),
            attempted: if approve { "approved" } else { "rejected" }.to_string(),
        });
    }

    if approve {
        let level_now = current_level(store, &t.agent_id, &t.action_name)?;
        if level_now != t.previous_level {
            return Err(EngineError::InvalidTransition {
                entity: "autonomy_transition",
                id: transition_id.to_string(),
                from: format!("level {}", level_now),
                attempted: format!("level {}", t.new_level),
            });
        }
        let tx = store.db.unchecked_transaction()?;
        tx.execute(
            "UPDATE autonomy_transitions SET status='approved', approved_by=?1
             WHERE transition_id=?2 AND status='pending'",
            (approver, transition_id),
        )?;
        tx.execute(
            "INSERT INTO autonomy_levels(agent_id, action_name, level, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(agent_id, action_name) DO UPDATE SET
               level = excluded.level, updated_at = excluded.updated_at",
            (
                &t.agent_id,
                &t.action_name,
                t.new_level,
                Utc::now().to_rfc3339(),
            ),
        )?;
        tx.commit()?;
    } else {
        store.db.execute(
            "UPDATE autonomy_transitions SET status='rejected', approved_by=?1
             WHERE transition_id=?2 AND status='pending'",
            (approver, transition_id),
        )?;
    }
    require_transition(store, transition_id)
}

pub fn pending_transitions(store: &Store) -> Result<Vec<AutonomyTransition>> {
    load_transitions(store, "WHERE status='pending' ORDER BY created_at ASC", &[])
}

pub fn transitions_for_pair(
    store: &Store,
    agent_id: &str,
    action_name: &str,
) -> Result<Vec<AutonomyTransition>> {
    load_transitions(
        store,
        "WHERE agent_id=?1 AND action_name=?2 ORDER BY created_at ASC",
        &[agent_id, action_name],
    )
}

// ---------- mistake patterns ----------

/// Fold one terminal proposal outcome into the pattern table. Failures
/// accumulate on the pair's active pattern (creating it at first sight);
/// successes leave patterns alone — only a human resolves one.
pub fn note_execution_outcome(
    store: &Store,
    proposal: &Proposal,
) -> Result<Option<MistakePattern>> {
    let Some(error) = proposal.execution_error.as_deref() else {
        return Ok(None);
    };
    let now = Utc::now().to_rfc3339();
    let preview: String = error.chars().take(160).collect();

    let existing = active_pattern(store, &proposal.agent_id, &proposal.action_name)?;
    match existing {
        Some(p) => {
            store.db.execute(
                "UPDATE mistake_patterns
                 SET occurrence_count=occurrence_count+1, last_seen_at=?1, pattern_description=?2
                 WHERE pattern_id=?3",
                (&now, &preview, &p.pattern_id),
            )?;
            Ok(Some(require_pattern(store, &p.pattern_id)?))
        }
        None => {
            let pattern_id = uuid::Uuid::new_v4().to_string();
            store.db.execute(
                "INSERT INTO mistake_patterns(pattern_id, agent_id, action_name,
                     pattern_description, category, occurrence_count,
                     first_seen_at, last_seen_at, status)
                 VALUES (?1, ?2, ?3, ?4, 'execution_failure', 1, ?5, ?5, 'active')",
                (
                    &pattern_id,
                    &proposal.agent_id,
                    &proposal.action_name,
                    &preview,
                    &now,
                ),
            )?;
            record_learning(
                store,
                &proposal.agent_id,
                "failure_mode",
                &format!(
                    "{} proposals can fail downstream: {}",
                    proposal.action_name, preview
                ),
                0.6,
            )?;
            Ok(Some(require_pattern(store, &pattern_id)?))
        }
    }
}

pub fn active_pattern(
    store: &Store,
    agent_id: &str,
    action_name: &str,
) -> Result<Option<MistakePattern>> {
    let mut stmt = store.db.prepare(&format!(
        "{SELECT_PATTERN}
         WHERE agent_id=?1 AND action_name=?2 AND status='active'
         ORDER BY occurrence_count DESC LIMIT 1"
    ))?;
    let mut rows = stmt.query((agent_id, action_name))?;
    if let Some(row) = rows.next()? {
        return Ok(Some(pattern_from_row(row)?));
    }
    Ok(None)
}

/// Human reviewer closes out a pattern after addressing the failure mode.
pub fn resolve_pattern(store: &Store, pattern_id: &str, notes: &str) -> Result<MistakePattern> {
    let p = require_pattern(store, pattern_id)?;
    if p.status != "active" {
        return Err(EngineError::InvalidTransition {
            entity: "mistake_pattern",
            id: pattern_id.to_string(),
            from: p.status,
            attempted: "resolved".to_string(),
        });
    }
    store.db.execute(
        "UPDATE mistake_patterns SET status='resolved', resolution_notes=?1 WHERE pattern_id=?2",
        (notes, pattern_id),
    )?;
    require_pattern(store, pattern_id)
}

// ---------- learnings ----------

pub fn record_learning(
    store: &Store,
    agent_id: &str,
    learning_type: &str,
    content: &str,
    confidence: f64,
) -> Result<Learning> {
    let learning_id = uuid::Uuid::new_v4().to_string();
    store.db.execute(
        "INSERT INTO learnings(learning_id, agent_id, learning_type, content,
                               confidence, applied_count)
         VALUES (?1, ?2, ?3, ?4, ?5, 0)",
        (learning_id.as_str(), agent_id, learning_type, content, confidence),
    )?;
    require_learning(store, &learning_id)
}

/// Mark a learning as having influenced a later proposal.
pub fn apply_learning(store: &Store, learning_id: &str) -> Result<Learning> {
    let applied = store.db.execute(
        "UPDATE learnings SET applied_count=applied_count+1, last_applied_at=?1
         WHERE learning_id=?2",
        (Utc::now().to_rfc3339(), learning_id),
    )?;
    if applied == 0 {
        return Err(EngineError::not_found("learning", learning_id));
    }
    require_learning(store, learning_id)
}

// ---------- internals ----------

fn has_pending(store: &Store, agent_id: &str, action_name: &str) -> Result<bool> {
    let mut stmt = store.db.prepare(
        "SELECT 1 FROM autonomy_transitions
         WHERE agent_id=?1 AND action_name=?2 AND status='pending' LIMIT 1",
    )?;
    Ok(stmt.exists((agent_id, action_name))?)
}

#[allow(clippy::too_many_arguments)]
fn insert_transition(
    store: &Store,
    agent_id: &str,
    action_name: &str,
    previous_level: i64,
    new_level: i64,
    reason: &str,
    evidence: Value,
    status: TransitionStatus,
    approved_by: Option<&str>,
) -> Result<AutonomyTransition> {
    debug_assert_eq!((new_level - previous_level).abs(), 1);
    let transition_id = uuid::Uuid::new_v4().to_string();
    store.db.execute(
        "INSERT INTO autonomy_transitions(transition_id, agent_id, action_name,
             previous_level, new_level, reason, evidence, approved_by, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        (
            &transition_id,
            agent_id,
            action_name,
            previous_level,
            new_level,
            reason,
            serde_json::to_string(&evidence)?,
            approved_by,
            status.as_str(),
            Utc::now().to_rfc3339(),
        ),
    )?;
    require_transition(store, &transition_id)
}

fn apply_level(store: &Store, agent_id: &str, action_name: &str, level: i64) -> Result<()> {
    store.db.execute(
        "INSERT INTO autonomy_levels(agent_id, action_name, level, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(agent_id, action_name) DO UPDATE SET
           level = excluded.level, updated_at = excluded.updated_at",
        (agent_id, action_name, level, Utc::now().to_rfc3339()),
    )?;
    Ok(())
}

fn demotion_evidence(cal: Option<&CalibrationRecord>, pattern: Option<&MistakePattern>) -> Value {
    json!({
        "calibration_error": cal.map(|c| c.calibration_error),
        "total_actions": cal.map(|c| c.total_actions),
        "mistake_pattern": pattern.map(|p| json!({
            "pattern_id": p.pattern_id,
            "category": p.category,
            "occurrence_count": p.occurrence_count,
        })),
    })
}

fn promotion_evidence(cal: &CalibrationRecord) -> Value {
    json!({
        "calibration_error": cal.calibration_error,
        "mean_confidence": cal.mean_confidence,
        "mean_success_rate": cal.mean_success_rate,
        "total_actions": cal.total_actions,
    })
}

fn require_transition(store: &Store, transition_id: &str) -> Result<AutonomyTransition> {
    let mut found = load_transitions(store, "WHERE transition_id=?1", &[transition_id])?;
    found
        .pop()
        .ok_or_else(|| EngineError::not_found("autonomy_transition", transition_id))
}

fn load_transitions(
    store: &Store,
    suffix: &str,
    params: &[&str],
) -> Result<Vec<AutonomyTransition>> {
    let mut stmt = store.db.prepare(&format!(
        "SELECT transition_id, agent_id, action_name, previous_level, new_level,
                reason, evidence, approved_by, status, created_at
         FROM autonomy_transitions {suffix}"
    ))?;
    let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, i64>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, String>(6)?,
            row.get::<_, Option<String>>(7)?,
            row.get::<_, String>(8)?,
            row.get::<_, String>(9)?,
        ))
    })?;
    let mut out = Vec::new();
    for r in rows {
        let (id, agent, action, prev, new, reason, evidence, approved_by, status, created) = r?;
        let status = TransitionStatus::parse(&status)
            .ok_or_else(|| EngineError::schema("autonomy_transition", "unknown status"))?;
        out.push(AutonomyTransition {
            transition_id: id,
            agent_id: agent,
            action_name: action,
            previous_level: prev,
            new_level: new,
            reason,
            evidence: serde_json::from_str(&evidence)?,
            approved_by,
            status,
            created_at: parse_ts(&created),
        });
    }
    Ok(out)
}

const SELECT_PATTERN: &str = "SELECT pattern_id, agent_id, action_name, pattern_description,
        category, occurrence_count, first_seen_at, last_seen_at, status, resolution_notes
 FROM mistake_patterns";

fn require_pattern(store: &Store, pattern_id: &str) -> Result<MistakePattern> {
    let mut stmt = store
        .db
        .prepare(&format!("{SELECT_PATTERN} WHERE pattern_id=?1"))?;
    let mut rows = stmt.query([pattern_id])?;
    if let Some(row) = rows.next()? {
        return pattern_from_row(row);
    }
    Err(EngineError::not_found("mistake_pattern", pattern_id))
}

fn pattern_from_row(row: &rusqlite::Row<'_>) -> Result<MistakePattern> {
    let first: String = row.get(6)?;
    let last: String = row.get(7)?;
    Ok(MistakePattern {
        pattern_id: row.get(0)?,
        agent_id: row.get(1)?,
        action_name: row.get(2)?,
        pattern_description: row.get(3)?,
        category: row.get(4)?,
        occurrence_count: row.get(5)?,
        first_seen_at: parse_ts(&first),
        last_seen_at: parse_ts(&last),
        status: row.get(8)?,
        resolution_notes: row.get(9)?,
    })
}

fn require_learning(store: &Store, learning_id: &str) -> Result<Learning> {
    let mut stmt = store.db.prepare(
        "SELECT learning_id, agent_id, learning_type, content, confidence,
                applied_count, last_applied_at
         FROM learnings WHERE learning_id=?1",
    )?;
    let mut rows = stmt.query([learning_id])?;
    if let Some(row) = rows.next()? {
        let last: Option<String> = row.get(6)?;
        return Ok(Learning {
            learning_id: row.get(0)?,
            agent_id: row.get(1)?,
            learning_type: row.get(2)?,
            content: row.get(3)?,
            confidence: row.get(4)?,
            applied_count: row.get(5)?,
            last_applied_at: last.as_deref().map(parse_ts),
        });
    }
    Err(EngineError::not_found("learning", learning_id))
}
