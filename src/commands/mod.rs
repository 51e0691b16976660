// src/commands/mod.rs
//! Public facade. Wires the store, decay engine, retriever, segmenter and
//! trust subsystems together and exposes the operations collaborators call:
//! ingestion intake, hybrid search/ask, the proposal lifecycle, autonomy
//! queries, and the operational recompute triggers.

use anyhow::Result as AnyResult;
use serde_json::json;
use std::path::Path;
use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::config::CoreConfig;
use crate::error::{EngineError, Result};
use crate::services::audit::Logbook;
use crate::services::autonomy::{
    self, AutonomyTransition, Learning, MistakePattern,
};
use crate::services::calibration::{self, CalibrationRecord};
use crate::services::decay::DecayEngine;
use crate::services::episodes::{
    EngineEvent, Episode, ExtractiveSummarizer, IngestOutcome, SegmentAction, Segmenter,
};
use crate::services::graph::{self, EdgeType};
use crate::services::index::ExactIndex;
use crate::services::proposals::{
    self, ActionRegistry, ActionRunner, NewProposal, NoRunner, Proposal, ProposalStatus,
    ReviewDecision,
};
use crate::services::retriever::{
    ExtractiveSynthesizer, GroundedAnswer, Retriever, ScoredItem, Synthesizer,
};
use crate::services::signals::{Signal, SignalBus};
use crate::services::store::{NewItem, Store};

pub struct Commands {
    store: Store,
    cfg: CoreConfig,
    decay: DecayEngine,
    retriever: Retriever,
    segmenter: Segmenter,
    registry: ActionRegistry,
    runner: Box<dyn ActionRunner>,
    synthesizer: Box<dyn Synthesizer>,
    bus: SignalBus,
    log: Logbook,
}

impl Commands {
    /// Open the engine rooted at a directory: `<root>/config.toml` (optional)
    /// plus the configured cache/logbook paths underneath it.
    pub fn open(root: &Path) -> AnyResult<Self> {
        let cfg = CoreConfig::load(root)?;
        Self::with_config(cfg)
    }

    /// Build from an explicit config (primarily for tests/tools).
    pub fn with_config(cfg: CoreConfig) -> AnyResult<Self> {
        let store = Store::open(&cfg.store.cache_path, &cfg.store)?;
        let decay = DecayEngine::new(cfg.decay.clone());
        let retriever = Retriever::new(Box::new(ExactIndex), cfg.retrieval.clone());
        let segmenter = Segmenter::new(
            cfg.episodes.clone(),
            Box::new(ExtractiveSummarizer {
                sentences: cfg.episodes.summary_sentences,
            }),
        );
        let log = Logbook::open(&cfg.logbook, &cfg.audit);
        Ok(Self {
            store,
            decay,
            retriever,
            segmenter,
            registry: ActionRegistry::new(),
            runner: Box::new(NoRunner),
            synthesizer: Box::new(ExtractiveSynthesizer { sentences: 3 }),
            bus: SignalBus::new(),
            log,
            cfg,
        })
    }

    /// Wire the downstream action executor (the default records every
    /// execution as failed so nothing runs silently).
    pub fn set_runner(&mut self, runner: Box<dyn ActionRunner>) {
        self.runner = runner;
    }

    /// Swap the answer-synthesis boundary (an LLM call in production).
    pub fn set_synthesizer(&mut self, synthesizer: Box<dyn Synthesizer>) {
        self.synthesizer = synthesizer;
    }

    /// Register the payload schema for one action type.
    pub fn register_action(&mut self, action_name: &str, required_fields: &[&str]) {
        self.registry.register(action_name, required_fields);
    }

    pub fn config(&self) -> &CoreConfig {
        &self.cfg
    }

    /// Subscribe to engine change events (new proposals, transitions,
    /// recomputed calibration, episode opens/closes).
    pub fn subscribe(&self) -> Receiver<Signal> {
        self.bus.subscribe()
    }

    // ---------- ingestion & graph boundaries ----------

    /// Ingestion boundary: content plus a precomputed embedding. Returns the
    /// item id.
    pub fn ingest_item(&self, item: NewItem) -> Result<String> {
        let id = self.store.insert_item(&item)?;
        self.log.record(
            "commands",
            "item_ingested",
            &json!({"item_id": id, "class": item.item_class, "len": item.content.len()}),
            "low",
        );
        Ok(id)
    }

    /// Graph-authoring boundary: relationship edges from external analysis.
    pub fn record_edge(
        &self,
        source_id: &str,
        target_id: &str,
        edge_type: EdgeType,
        weight: f64,
    ) -> Result<()> {
        graph::record_edge(&self.store, source_id, target_id, edge_type, weight)?;
        self.log.record(
            "commands",
            "edge_recorded",
            &json!({"source": source_id, "target": target_id, "type": edge_type.as_str()}),
            "low",
        );
        Ok(())
    }

    // ---------- retrieval ----------

    /// Hybrid search: vector similarity blended with decay and seed-graph
    /// proximity. Empty result is a valid answer, not an error.
    pub fn search(
        &self,
        query_embedding: &[f32],
        k: usize,
        seeds: &[String],
        deadline: Option<Duration>,
    ) -> Result<Vec<ScoredItem>> {
        let hits = self
            .retriever
            .search(&self.store, &self.decay, query_embedding, k, seeds, deadline)?;
        self.log.record(
            "commands",
            "search_returned",
            &json!({"k": k, "seeds": seeds.len(), "hits": hits.len()}),
            "low",
        );
        Ok(hits)
    }

    /// Evidence-grounded answer with source attribution.
    pub fn ask(&self, question: &str, query_embedding: &[f32], k: usize) -> Result<GroundedAnswer> {
        let answer = self.retriever.ask(
            &self.store,
            &self.decay,
            self.synthesizer.as_ref(),
            question,
            query_embedding,
            k,
        )?;
        self.log.record(
            "commands",
            "ask_returned",
            &json!({"sources": answer.sources.len()}),
            "low",
        );
        Ok(answer)
    }

    // ---------- episodes ----------

    /// Event stream boundary: route one event into its episode.
    pub fn ingest_event(&self, event: &EngineEvent) -> Result<IngestOutcome> {
        let outcome = self.segmenter.ingest(&self.store, event)?;
        match &outcome.action {
            SegmentAction::Opened => {
                self.bus.publish(Signal::EpisodeOpened {
                    episode_id: outcome.episode.episode_id.clone(),
                });
            }
            SegmentAction::Extended => {}
            SegmentAction::Reopened { closed_episode_id } => {
                self.bus.publish(Signal::EpisodeClosed {
                    episode_id: closed_episode_id.clone(),
                });
                self.bus.publish(Signal::EpisodeOpened {
                    episode_id: outcome.episode.episode_id.clone(),
                });
            }
        }
        let action_label = match &outcome.action {
            SegmentAction::Opened => "opened",
            SegmentAction::Extended => "extended",
            SegmentAction::Reopened { .. } => "reopened",
        };
        self.log.record(
            "commands",
            "event_ingested",
            &json!({
                "event_id": event.event_id,
                "episode_id": outcome.episode.episode_id,
                "action": action_label,
            }),
            "low",
        );
        Ok(outcome)
    }

    /// Operational trigger: close idle actives. Returns the ids closed.
    pub fn sweep_episodes(&self) -> Result<Vec<String>> {
        let closed = self.segmenter.sweep(&self.store, chrono::Utc::now())?;
        for episode_id in &closed {
            self.bus.publish(Signal::EpisodeClosed {
                episode_id: episode_id.clone(),
            });
        }
        if !closed.is_empty() {
            self.log.record(
                "commands",
                "episodes_swept",
                &json!({"closed": closed.len()}),
                "low",
            );
        }
        Ok(closed)
    }

    /// Human reviewer marks an active episode abandoned.
    pub fn abandon_episode(&self, episode_id: &str) -> Result<Episode> {
        let ep = self.segmenter.abandon(&self.store, episode_id)?;
        self.bus.publish(Signal::EpisodeClosed {
            episode_id: episode_id.to_string(),
        });
        Ok(ep)
    }

    pub fn episode(&self, episode_id: &str) -> Result<Episode> {
        self.segmenter.require(&self.store, episode_id)
    }

    // ---------- proposal lifecycle ----------

    pub fn create_proposal(&self, input: NewProposal) -> Result<Proposal> {
        let proposal = proposals::create(&self.store, &self.registry, input)?;
        self.bus.publish(Signal::ProposalCreated {
            proposal_id: proposal.proposal_id.clone(),
            agent_id: proposal.agent_id.clone(),
            action_name: proposal.action_name.clone(),
        });
        self.log.record(
            "commands",
            "proposal_created",
            &json!({
                "proposal_id": proposal.proposal_id,
                "agent_id": proposal.agent_id,
                "action_name": proposal.action_name,
                "confidence": proposal.confidence,
            }),
            "low",
        );
        Ok(proposal)
    }

    pub fn review_proposal(
        &self,
        proposal_id: &str,
        decision: ReviewDecision,
        reviewer: &str,
        notes: Option<&str>,
    ) -> Result<Proposal> {
        let proposal = proposals::review(&self.store, proposal_id, decision, reviewer, notes)?;
        if proposal.status.is_terminal() {
            self.bus.publish(Signal::ProposalResolved {
                proposal_id: proposal.proposal_id.clone(),
                status: proposal.status.as_str().to_string(),
            });
        }
        self.log.record(
            "commands",
            "proposal_reviewed",
            &json!({
                "proposal_id": proposal.proposal_id,
                "status": proposal.status.as_str(),
                "reviewer": reviewer,
            }),
            "low",
        );
        Ok(proposal)
    }

    /// Execute an approved proposal through the wired runner. A downstream
    /// failure surfaces as `ExecutionFailure` after the terminal outcome,
    /// its mistake-pattern bookkeeping, and the change signal are recorded.
    pub fn execute_proposal(&self, proposal_id: &str) -> Result<Proposal> {
        match proposals::execute(&self.store, proposal_id, self.runner.as_ref()) {
            Ok(proposal) => {
                self.settle_execution(&proposal)?;
                Ok(proposal)
            }
            Err(EngineError::ExecutionFailure(msg)) => {
                let proposal = proposals::require(&self.store, proposal_id)?;
                self.settle_execution(&proposal)?;
                Err(EngineError::ExecutionFailure(msg))
            }
            Err(e) => Err(e),
        }
    }

    fn settle_execution(&self, proposal: &Proposal) -> Result<()> {
        if let Some(pattern) = autonomy::note_execution_outcome(&self.store, proposal)? {
            self.log.record(
                "commands",
                "mistake_pattern_updated",
                &json!({
                    "pattern_id": pattern.pattern_id,
                    "occurrences": pattern.occurrence_count,
                }),
                "medium",
            );
        }
        self.bus.publish(Signal::ProposalResolved {
            proposal_id: proposal.proposal_id.clone(),
            status: proposal.status.as_str().to_string(),
        });
        let severity = if proposal.execution_error.is_some() {
            "high"
        } else {
            "low"
        };
        self.log.record(
            "commands",
            "proposal_executed",
            &json!({
                "proposal_id": proposal.proposal_id,
                "failed": proposal.execution_error.is_some(),
            }),
            severity,
        );
        Ok(())
    }

    pub fn proposals_by_status(&self, status: ProposalStatus) -> Result<Vec<Proposal>> {
        proposals::list_by_status(&self.store, status)
    }

    pub fn proposal(&self, proposal_id: &str) -> Result<Proposal> {
        proposals::require(&self.store, proposal_id)
    }

    // ---------- calibration & autonomy ----------

    /// Operational trigger: full calibration recompute for one pair.
    /// `Ok(None)` means no executed proposals yet.
    pub fn recalibrate(
        &self,
        agent_id: &str,
        action_name: &str,
    ) -> Result<Option<CalibrationRecord>> {
        let record =
            calibration::recalculate(&self.store, &self.cfg.calibration, agent_id, action_name)?;
        if let Some(r) = &record {
            self.bus.publish(Signal::CalibrationUpdated {
                agent_id: agent_id.to_string(),
                action_name: action_name.to_string(),
                calibration_error: r.calibration_error,
            });
            self.log.record(
                "commands",
                "calibration_recomputed",
                &json!({
                    "agent_id": agent_id,
                    "action_name": action_name,
                    "calibration_error": r.calibration_error,
                    "total_actions": r.total_actions,
                }),
                "low",
            );
        }
        Ok(record)
    }

    /// Scheduled evaluation: emits at most one transition candidate.
    pub fn evaluate_autonomy(
        &self,
        agent_id: &str,
        action_name: &str,
    ) -> Result<Option<AutonomyTransition>> {
        let transition = autonomy::evaluate(&self.store, &self.cfg.autonomy, agent_id, action_name)?;
        if let Some(t) = &transition {
            self.bus.publish(Signal::TransitionCreated {
                transition_id: t.transition_id.clone(),
                agent_id: t.agent_id.clone(),
                action_name: t.action_name.clone(),
                new_level: t.new_level,
                status: t.status.as_str().to_string(),
            });
            self.log.record(
                "commands",
                "autonomy_transition_created",
                &json!({
                    "transition_id": t.transition_id,
                    "from": t.previous_level,
                    "to": t.new_level,
                    "status": t.status.as_str(),
                }),
                "medium",
            );
        }
        Ok(transition)
    }

    pub fn autonomy_level(&self, agent_id: &str, action_name: &str) -> Result<i64> {
        autonomy::current_level(&self.store, agent_id, action_name)
    }

    pub fn pending_transitions(&self) -> Result<Vec<AutonomyTransition>> {
        autonomy::pending_transitions(&self.store)
    }

    /// Approve or reject a pending promotion.
    pub fn resolve_transition(
        &self,
        transition_id: &str,
        approver: &str,
        approve: bool,
    ) -> Result<AutonomyTransition> {
        let t = autonomy::resolve_transition(&self.store, transition_id, approver, approve)?;
        self.log.record(
            "commands",
            "autonomy_transition_resolved",
            &json!({
                "transition_id": t.transition_id,
                "status": t.status.as_str(),
                "approver": approver,
            }),
            "medium",
        );
        Ok(t)
    }

    // ---------- learnings & mistake patterns ----------

    pub fn record_learning(
        &self,
        agent_id: &str,
        learning_type: &str,
        content: &str,
        confidence: f64,
    ) -> Result<Learning> {
        autonomy::record_learning(&self.store, agent_id, learning_type, content, confidence)
    }

    pub fn apply_learning(&self, learning_id: &str) -> Result<Learning> {
        autonomy::apply_learning(&self.store, learning_id)
    }

    pub fn resolve_mistake_pattern(&self, pattern_id: &str, notes: &str) -> Result<MistakePattern> {
        autonomy::resolve_pattern(&self.store, pattern_id, notes)
    }
}
