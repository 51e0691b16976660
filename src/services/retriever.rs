// src/services/retriever.rs
//! Hybrid retriever: semantic similarity blended with temporal decay and
//! graph proximity to session seeds.
//!
//! - Over-fetches a candidate superset, re-ranks, truncates to k.
//! - With no seeds the graph term is dropped and the remaining weights are
//!   renormalized so fresh engines are not penalized for an unusable feature.
//! - Reinforcement (access count / recency reset) on returned items is
//!   fire-and-forget: a query never waits on, or fails from, its own side
//!   effects.
//! - A deadline bounds the work: an exhausted budget before candidate fetch
//!   is `DependencyTimeout`; exhausted after it degrades to vector+decay
//!   scoring instead of failing the whole query.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use summary::{Language, Summarizer as SentenceRanker};

use crate::config::RetrievalConfig;
use crate::error::{EngineError, Result};
use crate::services::decay::DecayEngine;
use crate::services::graph;
use crate::services::index::VectorIndex;
use crate::services::store::Store;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ScoredItem {
    pub item_id: String,
    pub vector_score: f64,
    pub decay_score: f64,
    pub graph_score: f64,
    pub final_score: f64,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
}

/// One ranked source handed to the synthesis boundary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Evidence {
    pub item_id: String,
    pub content: String,
    pub score: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct GroundedAnswer {
    pub answer: String,
    pub sources: Vec<Evidence>,
}

/// Natural-language synthesis is an external collaborator (an LLM call in
/// production). The engine supplies ranked evidence and source attribution.
pub trait Synthesizer: Send {
    fn synthesize(&self, question: &str, evidence: &[Evidence]) -> Result<String>;
}

/// Default synthesizer: extractive, no model call. Concatenates the evidence
/// and keeps the top-ranked sentences.
pub struct ExtractiveSynthesizer {
    pub sentences: u32,
}

impl Synthesizer for ExtractiveSynthesizer {
    fn synthesize(&self, _question: &str, evidence: &[Evidence]) -> Result<String> {
        if evidence.is_empty() {
            return Ok(String::new());
        }
        let joined = evidence
            .iter()
            .map(|e| e.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let n = NonZeroU32::new(self.sentences).unwrap_or(NonZeroU32::MIN);
        let picked = SentenceRanker::new(Language::English).summarize_sentences(&joined, n);
        if picked.is_empty() {
            Ok(joined)
        } else {
            Ok(picked.join(" "))
        }
    }
}

pub struct Retriever {
    index: Box<dyn VectorIndex>,
    cfg: RetrievalConfig,
}

impl Retriever {
    pub fn new(index: Box<dyn VectorIndex>, cfg: RetrievalConfig) -> Self {
        Self { index, cfg }
    }

    /// Ranked hybrid search. `seeds` are item ids already known relevant to
    /// the session; `deadline` overrides the configured budget.
    pub fn search(
        &self,
        store: &Store,
        decay: &DecayEngine,
        query: &[f32],
        k: usize,
        seeds: &[String],
        deadline: Option<Duration>,
    ) -> Result<Vec<ScoredItem>> {
        let budget = deadline.unwrap_or(Duration::from_millis(self.cfg.deadline_ms));
        let started = Instant::now();
        if budget.is_zero() {
            return Err(EngineError::DependencyTimeout {
                dependency: "vector-index",
                budget_ms: 0,
            });
        }

        // (a) candidate superset, over-fetched to leave room for re-ranking
        let fetch = k.saturating_mul(self.cfg.overfetch_factor).max(k);
        let candidates = self
            .index
            .top_k(store, query, fetch, self.cfg.min_similarity)?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        // (c) graph proximity from session seeds, best path weight per item;
        // skipped entirely when the budget is already spent (degrade, not fail)
        let graph_scores = if seeds.is_empty() || started.elapsed() >= budget {
            if !seeds.is_empty() {
                tracing::warn!(elapsed_ms = started.elapsed().as_millis() as u64,
                    "retrieval deadline reached before graph scoring, degrading to vector+decay");
            }
            None
        } else {
            Some(self.seed_proximity(store, seeds))
        };

        // (d) weighted blend; weights renormalize when the graph term is out
        let (w_vec, w_decay, w_graph) = self.weights(graph_scores.is_some());

        let mut scored = Vec::with_capacity(candidates.len());
        for (item_id, similarity) in candidates {
            let item = store.require_item(&item_id)?;
            // (b) current decay score, recomputed if stale
            let decay_score = decay.refresh_if_stale(store, &item)?;
            let graph_score = graph_scores
                .as_ref()
                .and_then(|m| m.get(&item_id).copied())
                .unwrap_or(0.0);
            let final_score =
                w_vec * similarity as f64 + w_decay * decay_score + w_graph * graph_score;
            scored.push(ScoredItem {
                item_id,
                vector_score: similarity as f64,
                decay_score,
                graph_score,
                final_score,
                created_at: item.created_at,
            });
        }

        // (e) rank, newer first on ties, truncate, reinforce
        scored.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.created_at.cmp(&a.created_at))
        });
        scored.truncate(k);

        for hit in &scored {
            if let Err(e) = decay.touch(store, &hit.item_id) {
                tracing::warn!(item_id = %hit.item_id, error = %e,
                    "reinforcement write dropped");
            }
        }

        Ok(scored)
    }

    /// Evidence-grounded answer: search, load content, hand the ranked
    /// evidence to the synthesis boundary.
    pub fn ask(
        &self,
        store: &Store,
        decay: &DecayEngine,
        synthesizer: &dyn Synthesizer,
        question: &str,
        query: &[f32],
        k: usize,
    ) -> Result<GroundedAnswer> {
        let hits = self.search(store, decay, query, k, &[], None)?;
        let mut sources = Vec::with_capacity(hits.len());
        for hit in &hits {
            let item = store.require_item(&hit.item_id)?;
            sources.push(Evidence {
                item_id: hit.item_id.clone(),
                content: item.content,
                score: hit.final_score,
            });
        }
        let answer = synthesizer.synthesize(question, &sources)?;
        Ok(GroundedAnswer { answer, sources })
    }

    /// Max cumulative weight from any seed to each reachable item. A seed id
    /// the graph does not know is skipped with a warning: session hints must
    /// not fail the query.
    fn seed_proximity(&self, store: &Store, seeds: &[String]) -> HashMap<String, f64> {
        let mut best: HashMap<String, f64> = HashMap::new();
        for seed in seeds {
            match graph::neighbors(store, seed, self.cfg.graph_hops, None) {
                Ok(reached) => {
                    for (item_id, weight) in reached {
                        let entry = best.entry(item_id).or_insert(0.0);
                        if weight > *entry {
                            *entry = weight;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(seed = %seed, error = %e, "seed expansion skipped");
                }
            }
        }
        best
    }

    fn weights(&self, with_graph: bool) -> (f64, f64, f64) {
        let (w1, w2, w3) = (
            self.cfg.vector_weight,
            self.cfg.decay_weight,
            self.cfg.graph_weight,
        );
        if with_graph {
            (w1, w2, w3)
        } else {
            // Renormalize so vector+decay still sum to the full weight budget.
            let sum = w1 + w2;
            if sum <= 0.0 {
                (1.0, 0.0, 0.0)
            } else {
                ((w1 + w2 + w3) * w1 / sum, (w1 + w2 + w3) * w2 / sum, 0.0)
            }
        }
    }
}
