// src/services/proposals.rs
//! Proposal lifecycle: pending_review -> {approved, rejected};
//! approved -> executed. Terminal states are frozen; a failed execution is
//! still terminal (retry means a new proposal, never a mutation of the old
//! one).
//!
//! Payloads are a tagged union keyed by `action_name`: free-form JSON at the
//! wire, validated against the registered schema for that action at the
//! intake boundary instead of being trusted downstream.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{EngineError, Result};
use crate::services::store::{parse_ts, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalStatus {
    PendingReview,
    Approved,
    Rejected,
    Executed,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::PendingReview => "pending_review",
            ProposalStatus::Approved => "approved",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::Executed => "executed",
        }
    }

    /// Canonical parse. The legacy spelling "pending" collapses into
    /// `pending_review`; there is exactly one pre-review state.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_review" | "pending" => Some(ProposalStatus::PendingReview),
            "approved" => Some(ProposalStatus::Approved),
            "rejected" => Some(ProposalStatus::Rejected),
            "executed" => Some(ProposalStatus::Executed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProposalStatus::Rejected | ProposalStatus::Executed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            "critical" => Some(Priority::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Approve,
    Reject,
}

#[derive(Debug, Clone)]
pub struct Proposal {
    pub proposal_id: String,
    pub agent_id: String,
    pub action_name: String,
    pub title: String,
    pub description: String,
    pub reasoning: String,
    pub payload: Value,
    pub confidence: f64,
    pub priority: Priority,
    pub status: ProposalStatus,
    pub reviewed_by: Option<String>,
    pub review_notes: Option<String>,
    pub execution_result: Option<Value>,
    pub execution_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

#[derive(Debug, Clone)]
pub struct NewProposal {
    pub agent_id: String,
    pub action_name: String,
    pub title: String,
    pub description: String,
    pub reasoning: String,
    pub payload: Value,
    pub confidence: f64,
    pub priority: Priority,
}

/// Required top-level payload fields for one action type.
#[derive(Debug, Clone, Default)]
pub struct ActionSchema {
    pub required: Vec<String>,
}

/// Per-action payload schemas. Registered actions enforce their required
/// fields; unregistered actions still demand a JSON object so nothing
/// downstream handles scalars pretending to be actions.
#[derive(Debug, Default)]
pub struct ActionRegistry {
    schemas: HashMap<String, ActionSchema>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action_name: &str, required: &[&str]) {
        self.schemas.insert(
            action_name.to_string(),
            ActionSchema {
                required: required.iter().map(|s| s.to_string()).collect(),
            },
        );
    }

    pub fn validate(&self, action_name: &str, payload: &Value) -> Result<()> {
        let Some(obj) = payload.as_object() else {
            return Err(EngineError::schema("payload", "must be a JSON object"));
        };
        if let Some(schema) = self.schemas.get(action_name) {
            for field in &schema.required {
                if !obj.contains_key(field) {
                    return Err(EngineError::schema(
                        "payload",
                        format!("action {action_name} requires field `{field}`"),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Downstream executor boundary. An `Err` is the downstream action failing,
/// not the engine: it is recorded on the proposal as a terminal fact.
pub trait ActionRunner: Send {
    fn run(&self, proposal: &Proposal) -> std::result::Result<Value, String>;
}

impl<F> ActionRunner for F
where
    F: Fn(&Proposal) -> std::result::Result<Value, String> + Send,
{
    fn run(&self, proposal: &Proposal) -> std::result::Result<Value, String> {
        self(proposal)
    }
}

/// Runner used when no downstream is wired; every execution is a recorded
/// failure rather than a silent success.
pub struct NoRunner;

impl ActionRunner for NoRunner {
    fn run(&self, _proposal: &Proposal) -> std::result::Result<Value, String> {
        Err("no action runner configured".to_string())
    }
}

// ---------- lifecycle operations ----------

pub fn create(store: &Store, registry: &ActionRegistry, input: NewProposal) -> Result<Proposal> {
    if !(0.0..=1.0).contains(&input.confidence) {
        return Err(EngineError::schema("confidence", "must be in [0, 1]"));
    }
    if input.agent_id.trim().is_empty() || input.action_name.trim().is_empty() {
        return Err(EngineError::schema(
            "proposal",
            "agent_id and action_name must not be empty",
        ));
    }
    registry.validate(&input.action_name, &input.payload)?;

    let proposal_id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    store.db.execute(
        r#"
        INSERT INTO proposals(proposal_id, agent_id, action_name, title, description,
                              reasoning, payload, confidence, priority, status,
                              created_at, updated_at, version)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending_review', ?10, ?10, 0)
        "#,
        (
            &proposal_id,
            &input.agent_id,
            &input.action_name,
            &input.title,
            &input.description,
            &input.reasoning,
            serde_json::to_string(&input.payload)?,
            input.confidence,
            input.priority.as_str(),
            &now,
        ),
    )?;
    require(store, &proposal_id)
}

/// Approve or reject a pending proposal. Anything other than
/// `pending_review` is an `InvalidTransition` — a caller bug, never retried.
pub fn review(
    store: &Store,
    proposal_id: &str,
    decision: ReviewDecision,
    reviewer: &str,
    notes: Option<&str>,
) -> Result<Proposal> {
    let target = match decision {
        ReviewDecision::Approve => ProposalStatus::Approved,
        ReviewDecision::Reject => ProposalStatus::Rejected,
    };

    for attempt in 0..store.write_attempts() {
        let current = require(store, proposal_id)?;
        if current.status != ProposalStatus::PendingReview {
            return Err(invalid_transition(&current, target));
        }
        let applied = store.db.execute(
            r#"
            UPDATE proposals
            SET status=?1, reviewed_by=?2, review_notes=?3, updated_at=?4, version=version+1
            WHERE proposal_id=?5 AND status='pending_review' AND version=?6
            "#,
            (
                target.as_str(),
                reviewer,
                notes,
                Utc::now().to_rfc3339(),
                proposal_id,
                current.version,
            ),
        )?;
        if applied == 1 {
            return require(store, proposal_id);
        }
        store.backoff(attempt);
    }
    Err(store.conflict("proposal", proposal_id))
}

/// Execute an approved proposal through the downstream runner. Either way the
/// proposal lands on `executed`: a downstream error is recorded as
/// `execution_error` and surfaced as `ExecutionFailure`, but execution
/// attempted is a terminal fact, not a retry point.
pub fn execute(store: &Store, proposal_id: &str, runner: &dyn ActionRunner) -> Result<Proposal> {
    for attempt in 0..store.write_attempts() {
        let current = require(store, proposal_id)?;
        if current.status != ProposalStatus::Approved {
            return Err(invalid_transition(&current, ProposalStatus::Executed));
        }

        let outcome = runner.run(&current);
        let (result_json, error_msg) = match &outcome {
            Ok(v) => (Some(serde_json::to_string(v)?), None),
            Err(e) => (None, Some(e.clone())),
        };

        let applied = store.db.execute(
            r#"
            UPDATE proposals
            SET status='executed', execution_result=?1, execution_error=?2,
                updated_at=?3, version=version+1
            WHERE proposal_id=?4 AND status='approved' AND version=?5
            "#,
            (
                result_json,
                error_msg,
                Utc::now().to_rfc3339(),
                proposal_id,
                current.version,
            ),
        )?;
        if applied == 1 {
            return match outcome {
                Ok(_) => require(store, proposal_id),
                Err(e) => Err(EngineError::ExecutionFailure(e)),
            };
        }
        store.backoff(attempt);
    }
    Err(store.conflict("proposal", proposal_id))
}

pub fn list_by_status(store: &Store, status: ProposalStatus) -> Result<Vec<Proposal>> {
    let mut stmt = store.db.prepare(&format!(
        "{SELECT_PROPOSAL} WHERE status=?1 ORDER BY created_at DESC"
    ))?;
    let rows = stmt.query_map([status.as_str()], RawProposalRow::read)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?.decode()?);
    }
    Ok(out)
}

/// Terminal proposals for one (agent, action) pair, oldest first. The
/// calibration engine's full-recompute input.
pub fn executed_for_pair(store: &Store, agent_id: &str, action_name: &str) -> Result<Vec<Proposal>> {
    let mut stmt = store.db.prepare(&format!(
        "{SELECT_PROPOSAL}
         WHERE agent_id=?1 AND action_name=?2 AND status='executed'
         ORDER BY created_at ASC"
    ))?;
    let rows = stmt.query_map((agent_id, action_name), RawProposalRow::read)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?.decode()?);
    }
    Ok(out)
}

pub fn require(store: &Store, proposal_id: &str) -> Result<Proposal> {
    let mut stmt = store
        .db
        .prepare(&format!("{SELECT_PROPOSAL} WHERE proposal_id=?1"))?;
    let mut rows = stmt.query([proposal_id])?;
    if let Some(row) = rows.next()? {
        return RawProposalRow::read(row)?.decode();
    }
    Err(EngineError::not_found("proposal", proposal_id))
}

fn invalid_transition(current: &Proposal, attempted: ProposalStatus) -> EngineError {
    EngineError::InvalidTransition {
        entity: "proposal",
        id: current.proposal_id.clone(),
        from: current.status.as_str().to_string(),
        attempted: attempted.as_str().to_string(),
    }
}

const SELECT_PROPOSAL: &str = "SELECT proposal_id, agent_id, action_name, title, description,
        reasoning, payload, confidence, priority, status, reviewed_by, review_notes,
        execution_result, execution_error, created_at, updated_at, version
 FROM proposals";

struct RawProposalRow {
    proposal_id: String,
    agent_id: String,
    action_name: String,
    title: String,
    description: String,
    reasoning: String,
    payload: String,
    confidence: f64,
    priority: String,
    status: String,
    reviewed_by: Option<String>,
    review_notes: Option<String>,
    execution_result: Option<String>,
    execution_error: Option<String>,
    created_at: String,
    updated_at: String,
    version: i64,
}

impl RawProposalRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            proposal_id: row.get(0)?,
            agent_id: row.get(1)?,
            action_name: row.get(2)?,
            title: row.get(3)?,
            description: row.get(4)?,
            reasoning: row.get(5)?,
            payload: row.get(6)?,
            confidence: row.get(7)?,
            priority: row.get(8)?,
            status: row.get(9)?,
            reviewed_by: row.get(10)?,
            review_notes: row.get(11)?,
            execution_result: row.get(12)?,
            execution_error: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
            version: row.get(16)?,
        })
    }

    fn decode(self) -> Result<Proposal> {
        let status = ProposalStatus::parse(&self.status)
            .ok_or_else(|| EngineError::schema("proposal", "unknown status"))?;
        let priority = Priority::parse(&self.priority)
            .ok_or_else(|| EngineError::schema("proposal", "unknown priority"))?;
        let execution_result = match self.execution_result.as_deref() {
            Some(raw) => Some(serde_json::from_str(raw)?),
            None => None,
        };
        Ok(Proposal {
            proposal_id: self.proposal_id,
            agent_id: self.agent_id,
            action_name: self.action_name,
            title: self.title,
            description: self.description,
            reasoning: self.reasoning,
            payload: serde_json::from_str(&self.payload)?,
            confidence: self.confidence,
            priority,
            status,
            reviewed_by: self.reviewed_by,
            review_notes: self.review_notes,
            execution_result,
            execution_error: self.execution_error,
            created_at: parse_ts(&self.created_at),
            updated_at: parse_ts(&self.updated_at),
            version: self.version,
        })
    }
}
