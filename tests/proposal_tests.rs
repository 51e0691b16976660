use serde_json::json;
use tempfile::TempDir;

use noesis_core::config::StoreConfig;
use noesis_core::error::EngineError;
use noesis_core::services::proposals::{
    self, ActionRegistry, NewProposal, Priority, ProposalStatus, ReviewDecision,
};
use noesis_core::services::store::Store;

fn open_store(dir: &TempDir) -> Store {
    Store::open(&dir.path().join("engine.db"), &StoreConfig::default()).expect("store open")
}

fn new_proposal(action: &str, payload: serde_json::Value, confidence: f64) -> NewProposal {
    NewProposal {
        agent_id: "agent-1".to_string(),
        action_name: action.to_string(),
        title: format!("{action} proposal"),
        description: "do the thing".to_string(),
        reasoning: "the evidence says so".to_string(),
        payload,
        confidence,
        priority: Priority::Medium,
    }
}

fn ok_runner(_p: &proposals::Proposal) -> Result<serde_json::Value, String> {
    Ok(json!({"ok": true}))
}

fn failing_runner(_p: &proposals::Proposal) -> Result<serde_json::Value, String> {
    Err("smtp refused the connection".to_string())
}

#[test]
fn pending_is_an_alias_for_pending_review() {
    assert_eq!(
        ProposalStatus::parse("pending"),
        Some(ProposalStatus::PendingReview)
    );
    assert_eq!(
        ProposalStatus::parse("pending_review"),
        Some(ProposalStatus::PendingReview)
    );
}

#[test]
fn payload_is_validated_against_the_registered_schema() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    let mut registry = ActionRegistry::new();
    registry.register("send_email", &["to", "subject", "body"]);

    let missing = proposals::create(
        &store,
        &registry,
        new_proposal("send_email", json!({"to": "ops@example.com"}), 0.8),
    );
    assert!(matches!(missing, Err(EngineError::Schema { .. })));

    let scalar = proposals::create(&store, &registry, new_proposal("send_email", json!(42), 0.8));
    assert!(matches!(scalar, Err(EngineError::Schema { .. })));

    let ok = proposals::create(
        &store,
        &registry,
        new_proposal(
            "send_email",
            json!({"to": "ops@example.com", "subject": "hi", "body": "text"}),
            0.8,
        ),
    )
    .expect("valid payload");
    assert_eq!(ok.status, ProposalStatus::PendingReview);
}

#[test]
fn confidence_outside_unit_interval_is_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    let registry = ActionRegistry::new();

    let too_high = proposals::create(&store, &registry, new_proposal("noop", json!({}), 1.3));
    assert!(matches!(too_high, Err(EngineError::Schema { .. })));
}

#[test]
fn execute_on_pending_review_is_an_invalid_transition() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    let registry = ActionRegistry::new();
    let p = proposals::create(&store, &registry, new_proposal("noop", json!({}), 0.7))
        .expect("create");

    match proposals::execute(&store, &p.proposal_id, &ok_runner) {
        Err(EngineError::InvalidTransition { from, attempted, .. }) => {
            assert_eq!(from, "pending_review");
            assert_eq!(attempted, "executed");
        }
        other => panic!("expected InvalidTransition, got {other:?}"),
    }
}

#[test]
fn review_on_a_terminal_proposal_is_an_invalid_transition() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    let registry = ActionRegistry::new();
    let p = proposals::create(&store, &registry, new_proposal("noop", json!({}), 0.7))
        .expect("create");

    proposals::review(&store, &p.proposal_id, ReviewDecision::Approve, "alex", None)
        .expect("approve");
    proposals::execute(&store, &p.proposal_id, &ok_runner).expect("execute");

    match proposals::review(&store, &p.proposal_id, ReviewDecision::Reject, "alex", None) {
        Err(EngineError::InvalidTransition { from, .. }) => assert_eq!(from, "executed"),
        other => panic!("expected InvalidTransition, got {other:?}"),
    }
}

#[test]
fn rejected_is_terminal() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    let registry = ActionRegistry::new();
    let p = proposals::create(&store, &registry, new_proposal("noop", json!({}), 0.7))
        .expect("create");

    let rejected = proposals::review(
        &store,
        &p.proposal_id,
        ReviewDecision::Reject,
        "alex",
        Some("not now"),
    )
    .expect("reject");
    assert_eq!(rejected.status, ProposalStatus::Rejected);
    assert_eq!(rejected.review_notes.as_deref(), Some("not now"));

    assert!(matches!(
        proposals::execute(&store, &p.proposal_id, &ok_runner),
        Err(EngineError::InvalidTransition { .. })
    ));
}

#[test]
fn a_failed_execution_is_still_terminal() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    let registry = ActionRegistry::new();
    let p = proposals::create(&store, &registry, new_proposal("send_email", json!({}), 0.9))
        .expect("create");
    proposals::review(&store, &p.proposal_id, ReviewDecision::Approve, "alex", None)
        .expect("approve");

    match proposals::execute(&store, &p.proposal_id, &failing_runner) {
        Err(EngineError::ExecutionFailure(msg)) => {
            assert!(msg.contains("smtp refused"));
        }
        other => panic!("expected ExecutionFailure, got {other:?}"),
    }

    // Execution attempted is a terminal fact, not a retry point.
    let reloaded = proposals::require(&store, &p.proposal_id).expect("reload");
    assert_eq!(reloaded.status, ProposalStatus::Executed);
    assert!(reloaded.execution_result.is_none());
    assert!(reloaded.execution_error.is_some());

    assert!(matches!(
        proposals::execute(&store, &p.proposal_id, &ok_runner),
        Err(EngineError::InvalidTransition { .. })
    ));
}

#[test]
fn success_records_a_result_and_never_an_error() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    let registry = ActionRegistry::new();
    let p = proposals::create(&store, &registry, new_proposal("noop", json!({}), 0.5))
        .expect("create");
    proposals::review(&store, &p.proposal_id, ReviewDecision::Approve, "alex", None)
        .expect("approve");

    let executed = proposals::execute(&store, &p.proposal_id, &ok_runner).expect("execute");
    assert_eq!(executed.status, ProposalStatus::Executed);
    assert_eq!(executed.execution_result, Some(json!({"ok": true})));
    assert!(executed.execution_error.is_none());
    assert_eq!(executed.reviewed_by.as_deref(), Some("alex"));
}

#[test]
fn list_by_status_partitions_the_backlog() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    let registry = ActionRegistry::new();

    let a = proposals::create(&store, &registry, new_proposal("noop", json!({}), 0.5))
        .expect("create a");
    let _b = proposals::create(&store, &registry, new_proposal("noop", json!({}), 0.5))
        .expect("create b");
    proposals::review(&store, &a.proposal_id, ReviewDecision::Approve, "alex", None)
        .expect("approve a");

    let pending =
        proposals::list_by_status(&store, ProposalStatus::PendingReview).expect("pending");
    let approved = proposals::list_by_status(&store, ProposalStatus::Approved).expect("approved");
    assert_eq!(pending.len(), 1);
    assert_eq!(approved.len(), 1);
    assert_eq!(approved[0].proposal_id, a.proposal_id);
}
