use serde_json::json;
use tempfile::TempDir;

use noesis_core::config::{AutonomyConfig, CalibrationConfig, StoreConfig};
use noesis_core::error::EngineError;
use noesis_core::services::autonomy::{self, TransitionStatus, LEVEL_MANUAL, LEVEL_SUPERVISED};
use noesis_core::services::calibration;
use noesis_core::services::proposals::{
    self, ActionRegistry, NewProposal, Priority, Proposal, ReviewDecision,
};
use noesis_core::services::store::Store;

fn open_store(dir: &TempDir) -> Store {
    Store::open(&dir.path().join("engine.db"), &StoreConfig::default()).expect("store open")
}

fn ok_runner(_p: &Proposal) -> Result<serde_json::Value, String> {
    Ok(json!({"ok": true}))
}

fn failing_runner(_p: &Proposal) -> Result<serde_json::Value, String> {
    Err("downstream exploded".to_string())
}

/// Drive one proposal to `executed` with the given outcome, folding the
/// result into mistake-pattern bookkeeping the way the facade does.
fn run_cycle(store: &Store, agent: &str, action: &str, confidence: f64, succeed: bool) {
    let registry = ActionRegistry::new();
    let p = proposals::create(
        store,
        &registry,
        NewProposal {
            agent_id: agent.to_string(),
            action_name: action.to_string(),
            title: format!("{action} cycle"),
            description: String::new(),
            reasoning: String::new(),
            payload: json!({}),
            confidence,
            priority: Priority::Medium,
        },
    )
    .expect("create");
    proposals::review(store, &p.proposal_id, ReviewDecision::Approve, "reviewer", None)
        .expect("approve");

    if succeed {
        proposals::execute(store, &p.proposal_id, &ok_runner).expect("execute");
    } else {
        match proposals::execute(store, &p.proposal_id, &failing_runner) {
            Err(EngineError::ExecutionFailure(_)) => {}
            other => panic!("expected ExecutionFailure, got {other:?}"),
        }
    }

    let terminal = proposals::require(store, &p.proposal_id).expect("reload");
    autonomy::note_execution_outcome(store, &terminal).expect("note outcome");
}

#[test]
fn calibration_error_is_symmetric_in_magnitude() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    let cfg = CalibrationConfig::default();

    // Overconfident pair: high confidence, all failures.
    for _ in 0..4 {
        run_cycle(&store, "agent-over", "deploy", 0.9, false);
    }
    // Underconfident pair: low confidence, all successes.
    for _ in 0..4 {
        run_cycle(&store, "agent-under", "deploy", 0.1, true);
    }

    let over = calibration::recalculate(&store, &cfg, "agent-over", "deploy")
        .expect("recalc")
        .expect("record");
    let under = calibration::recalculate(&store, &cfg, "agent-under", "deploy")
        .expect("recalc")
        .expect("record");

    assert!((over.calibration_error - 0.9).abs() < 1e-9);
    assert!((under.calibration_error - 0.9).abs() < 1e-9);
    assert!(over.overconfidence_rate > 0.99 && over.underconfidence_rate == 0.0);
    assert!(under.underconfidence_rate > 0.99 && under.overconfidence_rate == 0.0);

    // The damped adjustment points in opposite directions, same magnitude.
    assert!(over.confidence_adjustment < 0.0);
    assert!(under.confidence_adjustment > 0.0);
    assert!((over.confidence_adjustment + under.confidence_adjustment).abs() < 1e-9);
}

#[test]
fn no_executed_proposals_means_no_record_not_an_error() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    let cfg = CalibrationConfig::default();

    let none = calibration::recalculate(&store, &cfg, "agent-x", "anything").expect("recalc");
    assert!(none.is_none());
    assert!(calibration::latest(&store, "agent-x", "anything")
        .expect("latest")
        .is_none());
}

#[test]
fn adjusted_confidence_is_a_clamped_correction() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    let cfg = CalibrationConfig::default();
    for _ in 0..4 {
        run_cycle(&store, "agent-over", "deploy", 0.9, false);
    }
    let record = calibration::recalculate(&store, &cfg, "agent-over", "deploy")
        .expect("recalc")
        .expect("record");

    let shown = record.adjusted_confidence(0.9);
    assert!(shown < 0.9, "overconfidence corrects downward");
    assert!((0.0..=1.0).contains(&shown));
}

#[test]
fn a_pair_with_no_transitions_sits_at_level_one() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    assert_eq!(
        autonomy::current_level(&store, "nobody", "nothing").expect("level"),
        LEVEL_MANUAL
    );
}

#[test]
fn promotions_are_created_pending_and_take_effect_only_on_approval() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    let cal_cfg = CalibrationConfig::default();
    let auto_cfg = AutonomyConfig::default();

    for _ in 0..6 {
        run_cycle(&store, "agent-1", "send_email", 0.95, true);
    }
    calibration::recalculate(&store, &cal_cfg, "agent-1", "send_email").expect("recalc");

    let t = autonomy::evaluate(&store, &auto_cfg, "agent-1", "send_email")
        .expect("evaluate")
        .expect("promotion candidate");
    assert_eq!(t.status, TransitionStatus::Pending);
    assert_eq!(t.previous_level, LEVEL_MANUAL);
    assert_eq!(t.new_level, LEVEL_SUPERVISED);

    // Not in force yet, and evaluate stays idempotent while one is pending.
    assert_eq!(
        autonomy::current_level(&store, "agent-1", "send_email").expect("level"),
        LEVEL_MANUAL
    );
    assert!(autonomy::evaluate(&store, &auto_cfg, "agent-1", "send_email")
        .expect("re-evaluate")
        .is_none());

    let approved =
        autonomy::resolve_transition(&store, &t.transition_id, "alex", true).expect("approve");
    assert_eq!(approved.status, TransitionStatus::Approved);
    assert_eq!(approved.approved_by.as_deref(), Some("alex"));
    assert_eq!(
        autonomy::current_level(&store, "agent-1", "send_email").expect("level"),
        LEVEL_SUPERVISED
    );
}

#[test]
fn rejecting_a_promotion_leaves_the_level_alone() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    let cal_cfg = CalibrationConfig::default();
    let auto_cfg = AutonomyConfig::default();

    for _ in 0..6 {
        run_cycle(&store, "agent-1", "send_email", 0.95, true);
    }
    calibration::recalculate(&store, &cal_cfg, "agent-1", "send_email").expect("recalc");
    let t = autonomy::evaluate(&store, &auto_cfg, "agent-1", "send_email")
        .expect("evaluate")
        .expect("promotion");

    let rejected =
        autonomy::resolve_transition(&store, &t.transition_id, "alex", false).expect("reject");
    assert_eq!(rejected.status, TransitionStatus::Rejected);
    assert_eq!(
        autonomy::current_level(&store, "agent-1", "send_email").expect("level"),
        LEVEL_MANUAL
    );

    // Resolving twice is a caller bug.
    assert!(matches!(
        autonomy::resolve_transition(&store, &t.transition_id, "alex", true),
        Err(EngineError::InvalidTransition { .. })
    ));
}

#[test]
fn scant_data_never_promotes() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    let cal_cfg = CalibrationConfig::default();
    let auto_cfg = AutonomyConfig::default();

    // Perfectly calibrated but below the minimum sample.
    for _ in 0..2 {
        run_cycle(&store, "agent-1", "send_email", 1.0, true);
    }
    calibration::recalculate(&store, &cal_cfg, "agent-1", "send_email").expect("recalc");
    assert!(autonomy::evaluate(&store, &auto_cfg, "agent-1", "send_email")
        .expect("evaluate")
        .is_none());
}

#[test]
fn demotions_are_auto_approved_and_immediate() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    let cal_cfg = CalibrationConfig::default();
    let auto_cfg = AutonomyConfig::default();

    // Earn level 2 first.
    for _ in 0..6 {
        run_cycle(&store, "agent-1", "send_email", 0.95, true);
    }
    calibration::recalculate(&store, &cal_cfg, "agent-1", "send_email").expect("recalc");
    let promo = autonomy::evaluate(&store, &auto_cfg, "agent-1", "send_email")
        .expect("evaluate")
        .expect("promotion");
    autonomy::resolve_transition(&store, &promo.transition_id, "alex", true).expect("approve");

    // Three consecutive failures cross the mistake threshold; the demotion
    // lands pre-approved without waiting for a calibration cycle.
    for _ in 0..3 {
        run_cycle(&store, "agent-1", "send_email", 0.95, false);
    }
    let demo = autonomy::evaluate(&store, &auto_cfg, "agent-1", "send_email")
        .expect("evaluate")
        .expect("demotion");
    assert_eq!(demo.status, TransitionStatus::Approved);
    assert_eq!(demo.previous_level, LEVEL_SUPERVISED);
    assert_eq!(demo.new_level, LEVEL_MANUAL);
    assert_eq!(
        autonomy::current_level(&store, "agent-1", "send_email").expect("level"),
        LEVEL_MANUAL
    );
}

#[test]
fn a_demotion_never_drops_below_manual() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    let auto_cfg = AutonomyConfig::default();

    // Already at level 1 with a raging mistake pattern: no transition.
    for _ in 0..4 {
        run_cycle(&store, "agent-1", "send_email", 0.95, false);
    }
    assert!(autonomy::evaluate(&store, &auto_cfg, "agent-1", "send_email")
        .expect("evaluate")
        .is_none());
}

#[test]
fn an_active_mistake_pattern_blocks_promotion() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    let cal_cfg = CalibrationConfig::default();
    let auto_cfg = AutonomyConfig::default();

    // One early failure leaves an active pattern; plenty of later successes
    // bring calibration into range, but the pattern gates the promotion.
    run_cycle(&store, "agent-1", "send_email", 0.9, false);
    for _ in 0..11 {
        run_cycle(&store, "agent-1", "send_email", 0.9, true);
    }
    calibration::recalculate(&store, &cal_cfg, "agent-1", "send_email").expect("recalc");
    assert!(autonomy::evaluate(&store, &auto_cfg, "agent-1", "send_email")
        .expect("evaluate")
        .is_none());

    // Resolving the pattern clears the path.
    let pattern = autonomy::active_pattern(&store, "agent-1", "send_email")
        .expect("pattern")
        .expect("exists");
    autonomy::resolve_pattern(&store, &pattern.pattern_id, "root cause fixed").expect("resolve");
    let t = autonomy::evaluate(&store, &auto_cfg, "agent-1", "send_email")
        .expect("evaluate")
        .expect("promotion after resolution");
    assert_eq!(t.status, TransitionStatus::Pending);
}

#[test]
fn learnings_accumulate_applications() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);

    let l = autonomy::record_learning(
        &store,
        "agent-1",
        "failure_mode",
        "rate limits bite after 100 sends",
        0.7,
    )
    .expect("record");
    assert_eq!(l.applied_count, 0);
    assert!(l.last_applied_at.is_none());

    let l = autonomy::apply_learning(&store, &l.learning_id).expect("apply");
    let l = autonomy::apply_learning(&store, &l.learning_id).expect("apply again");
    assert_eq!(l.applied_count, 2);
    assert!(l.last_applied_at.is_some());

    assert!(matches!(
        autonomy::apply_learning(&store, "ghost"),
        Err(EngineError::NotFound { .. })
    ));
}
