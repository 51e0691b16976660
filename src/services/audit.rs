// src/services/audit.rs
//! Action logbook: lightweight JSONL telemetry for engine operations.
//!
//! Writes are best-effort: the logbook never fails the caller. Disabled via
//! `[audit] enabled = false`, which turns `record` into a no-op.

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use crate::config::{AuditConfig, LogbookConfig};

pub struct Logbook {
    actions: Option<PathBuf>,
}

impl Logbook {
    pub fn open(logbook: &LogbookConfig, audit: &AuditConfig) -> Self {
        Self {
            actions: audit.enabled.then(|| logbook.actions.clone()),
        }
    }

    pub fn disabled() -> Self {
        Self { actions: None }
    }

    /// Record a generic action event.
    ///
    /// * `agent` — logical component name (e.g. `"commands"`, `"segmenter"`).
    /// * `action` — short verb label (e.g. `"proposal_created"`).
    /// * `details` — arbitrary JSON payload (parameters, ids, etc.).
    /// * `severity` — `"low" | "medium" | "high"` for quick triage.
    pub fn record(&self, agent: &str, action: &str, details: &Value, severity: &str) {
        let Some(path) = &self.actions else {
            return;
        };
        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": "action",
            "agent": agent,
            "action": action,
            "severity": severity,
            "details": details,
        });
        append_jsonl(path, &entry);
    }
}

/// Append a single JSON value as a line. Creates parent directories if
/// missing; ignores write errors to avoid crashing the caller.
fn append_jsonl<S: Serialize>(path: &PathBuf, val: &S) {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if let (Ok(mut f), Ok(line)) = (
        fs::OpenOptions::new().create(true).append(true).open(path),
        serde_json::to_string(val),
    ) {
        let _ = writeln!(f, "{}", line);
    }
}
