// src/services/mod.rs

pub mod audit;       // JSONL action logbook (best-effort telemetry)
pub mod autonomy;    // trust levels, transitions, mistake patterns, learnings
pub mod calibration; // confidence vs observed success, full recompute
pub mod decay;       // freshness scoring; the only writer of decay_score
pub mod episodes;    // event stream -> bounded, summarized episodes
pub mod graph;       // typed relationship edges, BFS proximity
pub mod index;       // vector index seam + exact cosine backend
pub mod proposals;   // agent proposal state machine
pub mod retriever;   // hybrid ranking: vector + decay + graph
pub mod signals;     // push-model change events
pub mod store;       // the ONLY SQLite writer

// Public API
pub use decay::DecayEngine;
pub use episodes::{EngineEvent, Episode, EventKind, Segmenter};
pub use proposals::{NewProposal, Proposal, ProposalStatus};
pub use retriever::{Retriever, ScoredItem};
pub use signals::{Signal, SignalBus};
pub use store::{KnowledgeItem, NewItem, Store};
