// src/services/calibration.rs
//! Calibration: stated confidence vs observed success per (agent, action).
//!
//! Always a full recompute over the executed proposals for the pair — never
//! incrementally patched, so the rollup cannot drift from its inputs. Only
//! executed proposals carry ground truth; pending/rejected are excluded.

use chrono::{DateTime, Utc};

use crate::config::CalibrationConfig;
use crate::error::Result;
use crate::services::proposals;
use crate::services::store::{parse_ts, Store};

#[derive(Debug, Clone, serde::Serialize)]
pub struct CalibrationRecord {
    pub agent_id: String,
    pub action_name: String,
    pub total_actions: u32,
    pub mean_confidence: f64,
    pub mean_success_rate: f64,
    pub calibration_error: f64,
    pub overconfidence_rate: f64,
    pub underconfidence_rate: f64,
    pub confidence_adjustment: f64,
    pub calculated_at: DateTime<Utc>,
}

impl CalibrationRecord {
    /// Bias-corrected confidence to show a reviewer next to the agent's own
    /// number. A correction, not a silent override.
    pub fn adjusted_confidence(&self, stated: f64) -> f64 {
        (stated + self.confidence_adjustment).clamp(0.0, 1.0)
    }
}

/// Full recompute for one pair. `Ok(None)` when the pair has no executed
/// proposals yet — insufficient data is a valid outcome, not an error.
pub fn recalculate(
    store: &Store,
    cfg: &CalibrationConfig,
    agent_id: &str,
    action_name: &str,
) -> Result<Option<CalibrationRecord>> {
    let executed = proposals::executed_for_pair(store, agent_id, action_name)?;
    if executed.is_empty() {
        return Ok(None);
    }

    let total = executed.len() as f64;
    let mean_confidence = executed.iter().map(|p| p.confidence).sum::<f64>() / total;
    let successes = executed
        .iter()
        .filter(|p| p.execution_error.is_none())
        .count() as f64;
    let mean_success_rate = successes / total;
    let calibration_error = (mean_confidence - mean_success_rate).abs();

    let mut over = 0u32;
    let mut under = 0u32;
    for p in &executed {
        let outcome = if p.execution_error.is_none() { 1.0 } else { 0.0 };
        if p.confidence - outcome > cfg.miscalibration_threshold {
            over += 1;
        } else if outcome - p.confidence > cfg.miscalibration_threshold {
            under += 1;
        }
    }

    // Damped bias correction: pushes future stated confidences toward the
    // observed rate without ever flipping past it.
    let direction = if mean_confidence >= mean_success_rate {
        1.0
    } else {
        -1.0
    };
    let confidence_adjustment = -calibration_error * direction * cfg.adjustment_damping;

    let record = CalibrationRecord {
        agent_id: agent_id.to_string(),
        action_name: action_name.to_string(),
        total_actions: executed.len() as u32,
        mean_confidence,
        mean_success_rate,
        calibration_error,
        overconfidence_rate: over as f64 / total,
        underconfidence_rate: under as f64 / total,
        confidence_adjustment,
        calculated_at: Utc::now(),
    };
    upsert(store, &record)?;
    Ok(Some(record))
}

pub fn latest(store: &Store, agent_id: &str, action_name: &str) -> Result<Option<CalibrationRecord>> {
    let mut stmt = store.db.prepare(
        "SELECT total_actions, mean_confidence, mean_success_rate, calibration_error,
                overconfidence_rate, underconfidence_rate, confidence_adjustment, calculated_at
         FROM calibration WHERE agent_id=?1 AND action_name=?2",
    )?;
    let mut rows = stmt.query((agent_id, action_name))?;
    if let Some(row) = rows.next()? {
        let calculated: String = row.get(7)?;
        return Ok(Some(CalibrationRecord {
            agent_id: agent_id.to_string(),
            action_name: action_name.to_string(),
            total_actions: row.get(0)?,
            mean_confidence: row.get(1)?,
            mean_success_rate: row.get(2)?,
            calibration_error: row.get(3)?,
            overconfidence_rate: row.get(4)?,
            underconfidence_rate: row.get(5)?,
            confidence_adjustment: row.get(6)?,
            calculated_at: parse_ts(&calculated),
        }));
    }
    Ok(None)
}

fn upsert(store: &Store, record: &CalibrationRecord) -> Result<()> {
    store.db.execute(
        r#"
        INSERT INTO calibration(agent_id, action_name, total_actions, mean_confidence,
                                mean_success_rate, calibration_error, overconfidence_rate,
                                underconfidence_rate, confidence_adjustment, calculated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(agent_id, action_name) DO UPDATE SET
          total_actions         = excluded.total_actions,
          mean_confidence       = excluded.mean_confidence,
          mean_success_rate     = excluded.mean_success_rate,
          calibration_error     = excluded.calibration_error,
          overconfidence_rate   = excluded.overconfidence_rate,
          underconfidence_rate  = excluded.underconfidence_rate,
          confidence_adjustment = excluded.confidence_adjustment,
          calculated_at         = excluded.calculated_at
        "#,
        (
            &record.agent_id,
            &record.action_name,
            record.total_actions,
            record.mean_confidence,
            record.mean_success_rate,
            record.calibration_error,
            record.overconfidence_rate,
            record.underconfidence_rate,
            record.confidence_adjustment,
            record.calculated_at.to_rfc3339(),
        ),
    )?;
    Ok(())
}
