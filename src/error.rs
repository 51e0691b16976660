// src/error.rs
//! Engine error taxonomy.
//!
//! Callers are expected to match on these variants: `NotFound` and
//! `InvalidTransition` are caller bugs and never retried; `ExecutionFailure`
//! is a terminal fact recorded on the proposal; `DependencyTimeout` is the
//! only variant the retriever degrades around; `Conflict` surfaces only after
//! optimistic-concurrency retries are exhausted.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid transition for {entity} {id}: {from} -> {attempted}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        attempted: String,
    },

    #[error("execution failed: {0}")]
    ExecutionFailure(String),

    #[error("{dependency} did not respond within {budget_ms}ms")]
    DependencyTimeout {
        dependency: &'static str,
        budget_ms: u64,
    },

    #[error("conflicting update on {entity} {id} after {attempts} attempts")]
    Conflict {
        entity: &'static str,
        id: String,
        attempts: u32,
    },

    #[error("invalid {what}: {detail}")]
    Schema { what: &'static str, detail: String },

    #[error(transparent)]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Encoding(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn schema(what: &'static str, detail: impl Into<String>) -> Self {
        EngineError::Schema {
            what,
            detail: detail.into(),
        }
    }
}
