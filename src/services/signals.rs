// src/services/signals.rs
//! Change-event bus: the engine pushes state changes to subscribers instead
//! of being polled. Publishing is non-blocking and best-effort; a subscriber
//! whose receiver is gone is dropped on the next publish.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Signal {
    ProposalCreated {
        proposal_id: String,
        agent_id: String,
        action_name: String,
    },
    ProposalResolved {
        proposal_id: String,
        status: String,
    },
    TransitionCreated {
        transition_id: String,
        agent_id: String,
        action_name: String,
        new_level: i64,
        status: String,
    },
    CalibrationUpdated {
        agent_id: String,
        action_name: String,
        calibration_error: f64,
    },
    EpisodeOpened {
        episode_id: String,
    },
    EpisodeClosed {
        episode_id: String,
    },
}

pub struct SignalBus {
    subscribers: Mutex<Vec<Sender<Signal>>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Receiver<Signal> {
        let (tx, rx) = unbounded();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    pub fn publish(&self, signal: Signal) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|tx| tx.send(signal.clone()).is_ok());
        }
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}
