// src/services/graph.rs
//! Typed relationship graph over knowledge items.
//!
//! - Edges arrive from the graph-authoring boundary (`record_edge`) and are
//!   read-only to the rest of the engine.
//! - `neighbors` is a breadth-first expansion: parallel edges between a pair
//!   sum (capped at 1.0), weights multiply along a path so second-hop
//!   relevance decays naturally, and when several paths reach the same node
//!   the maximum cumulative weight wins (edge count alone buys nothing).

use std::collections::HashMap;

use crate::error::{EngineError, Result};
use crate::services::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeType {
    References,
    Follows,
    Causes,
    Mentions,
    SameProject,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::References => "references",
            EdgeType::Follows => "follows",
            EdgeType::Causes => "causes",
            EdgeType::Mentions => "mentions",
            EdgeType::SameProject => "same-project",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "references" => Some(EdgeType::References),
            "follows" => Some(EdgeType::Follows),
            "causes" => Some(EdgeType::Causes),
            "mentions" => Some(EdgeType::Mentions),
            "same-project" => Some(EdgeType::SameProject),
            _ => None,
        }
    }
}

/// Intake for the external graph-authoring boundary. Rejects self-loops and
/// out-of-range weights; upserts on (source, target, type) so re-delivery is
/// idempotent.
pub fn record_edge(
    store: &Store,
    source_id: &str,
    target_id: &str,
    edge_type: EdgeType,
    weight: f64,
) -> Result<()> {
    if source_id == target_id {
        return Err(EngineError::schema("edge", "self-loops are not allowed"));
    }
    if !(weight > 0.0 && weight <= 1.0) {
        return Err(EngineError::schema("edge", "weight must be in (0, 1]"));
    }
    if !store.item_exists(source_id)? {
        return Err(EngineError::not_found("item", source_id));
    }
    if !store.item_exists(target_id)? {
        return Err(EngineError::not_found("item", target_id));
    }
    store.db.execute(
        "INSERT INTO edges(source_id, target_id, edge_type, weight) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(source_id, target_id, edge_type) DO UPDATE SET weight = excluded.weight",
        (source_id, target_id, edge_type.as_str(), weight),
    )?;
    Ok(())
}

/// Breadth-first expansion from `origin` up to `max_hops`, returning reached
/// item ids with their best cumulative weight. `NotFound` if the origin id is
/// unknown; an empty map when the subgraph has no expansion.
pub fn neighbors(
    store: &Store,
    origin: &str,
    max_hops: u32,
    edge_types: Option<&[EdgeType]>,
) -> Result<HashMap<String, f64>> {
    if !store.item_exists(origin)? {
        return Err(EngineError::not_found("item", origin));
    }

    let mut best: HashMap<String, f64> = HashMap::new();
    let mut frontier: Vec<(String, f64)> = vec![(origin.to_string(), 1.0)];

    for _ in 0..max_hops {
        let mut next = Vec::new();
        for (node, cum) in frontier {
            for (target, weight) in outgoing(store, &node, edge_types)? {
                let reached = cum * weight;
                let entry = best.entry(target.clone()).or_insert(0.0);
                if reached > *entry {
                    *entry = reached;
                    next.push((target, reached));
                }
            }
        }
        if next.is_empty() {
            break;
        }
        frontier = next;
    }

    best.remove(origin);
    Ok(best)
}

/// Outgoing edges from one node with parallel edge types summed per target,
/// capped at 1.0 so stacked relations cannot amplify beyond a direct link.
fn outgoing(
    store: &Store,
    source: &str,
    edge_types: Option<&[EdgeType]>,
) -> Result<Vec<(String, f64)>> {
    let mut stmt = store
        .db
        .prepare("SELECT target_id, edge_type, weight FROM edges WHERE source_id=?1")?;
    let rows = stmt.query_map([source], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, f64>(2)?,
        ))
    })?;

    let mut summed: HashMap<String, f64> = HashMap::new();
    for r in rows {
        let (target, ty, weight) = r?;
        if let Some(filter) = edge_types {
            match EdgeType::parse(&ty) {
                Some(t) if filter.contains(&t) => {}
                _ => continue,
            }
        }
        *summed.entry(target).or_insert(0.0) += weight;
    }
    Ok(summed
        .into_iter()
        .map(|(t, w)| (t, w.min(1.0)))
        .collect())
}
