// src/services/decay.rs
//! Decay engine: derives a [floor, 1.0] freshness multiplier from age and
//! access pattern. The score function is pure; `refresh`/`touch` are the only
//! writers of `decay_score` and the access stats.

use chrono::{DateTime, Utc};

use crate::config::DecayConfig;
use crate::error::Result;
use crate::services::store::{KnowledgeItem, Store};

pub struct DecayEngine {
    cfg: DecayConfig,
}

impl DecayEngine {
    pub fn new(cfg: DecayConfig) -> Self {
        Self { cfg }
    }

    /// Pure score: exponential recency decay on the per-class half-life, a
    /// slower age decay (`age_scale` times the half-life), and a capped
    /// permanent boost per access. Clamped to [floor, 1.0].
    pub fn score_at(
        &self,
        item_class: &str,
        created_at: DateTime<Utc>,
        last_accessed_at: DateTime<Utc>,
        access_count: i64,
        now: DateTime<Utc>,
    ) -> f64 {
        let half_life = self.cfg.half_life_for(item_class);
        let recency_h = hours_between(last_accessed_at, now);
        let age_h = hours_between(created_at, now);

        let recency = (-std::f64::consts::LN_2 * recency_h / half_life).exp();
        let age = (-std::f64::consts::LN_2 * age_h / (half_life * self.cfg.age_scale)).exp();
        let boost = (access_count.max(0) as f64 * self.cfg.access_boost).min(self.cfg.boost_cap);

        (recency * age + boost).clamp(self.cfg.floor, 1.0)
    }

    pub fn score_for(&self, item: &KnowledgeItem, now: DateTime<Utc>) -> f64 {
        self.score_at(
            &item.item_class,
            item.created_at,
            item.last_accessed_at,
            item.access_count,
            now,
        )
    }

    /// Recompute and write back the stored score. Idempotent and safe to run
    /// redundantly across readers: a racing recompute writes the same derived
    /// value.
    pub fn refresh(&self, store: &Store, item_id: &str) -> Result<f64> {
        let item = store.require_item(item_id)?;
        let now = Utc::now();
        let score = self.score_for(&item, now);
        store.db.execute(
            "UPDATE items SET decay_score=?1, score_computed_at=?2 WHERE item_id=?3",
            (score, now.to_rfc3339(), item_id),
        )?;
        Ok(score)
    }

    /// Serve the stored score while it is within the recompute interval;
    /// recompute and write back once it goes stale.
    pub fn refresh_if_stale(&self, store: &Store, item: &KnowledgeItem) -> Result<f64> {
        let now = Utc::now();
        let stale =
            (now - item.score_computed_at).num_minutes() >= self.cfg.recompute_interval_minutes;
        if stale {
            self.refresh(store, &item.item_id)
        } else {
            Ok(item.decay_score)
        }
    }

    /// Access reinforcement: reset the recency clock, bump the access count,
    /// and write back the (never lower) recomputed score.
    pub fn touch(&self, store: &Store, item_id: &str) -> Result<f64> {
        let item = store.require_item(item_id)?;
        let now = Utc::now();
        let score = self.score_at(
            &item.item_class,
            item.created_at,
            now,
            item.access_count + 1,
            now,
        );
        store.db.execute(
            "UPDATE items SET last_accessed_at=?1, access_count=access_count+1,
                    decay_score=?2, score_computed_at=?1
             WHERE item_id=?3",
            (now.to_rfc3339(), score, item_id),
        )?;
        Ok(score)
    }
}

fn hours_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    (later - earlier).num_seconds().max(0) as f64 / 3600.0
}
