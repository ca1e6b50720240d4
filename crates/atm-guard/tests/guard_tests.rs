use atm_guard::{
    ConstraintVerifier, DetectorKind, LoopDetector, LoopDetectorConfig, Observation, RunHistory,
};
use atm_state::{AgentState, Constraint, ContentHash, Fact, GoalTree, PlannerConfig, ToolStatus};
use chrono::Utc;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::json;

proptest! {
    #[test]
    fn prop_every_failing_constraint_is_reported(
        codes in prop::collection::vec("[0-9]{5}", 1..6),
        observed in prop::collection::vec("[0-9]{5}", 1..6),
    ) {
        let constraints: Vec<Constraint> = observed
            .iter()
            .enumerate()
            .map(|(i, _)| {
                Constraint::geo_membership(format!("fips_{i}"), codes.iter().cloned())
            })
            .collect();
        let mut result = serde_json::Map::new();
        for (i, value) in observed.iter().enumerate() {
            result.insert(format!("fips_{i}"), json!(value));
        }

        let verdict = ConstraintVerifier::with_defaults().check(&result.into(), &constraints);
        let expected_failures = observed.iter().filter(|v| !codes.contains(v)).count();
        prop_assert_eq!(verdict.reasons.len(), expected_failures);
        prop_assert_eq!(verdict.ok, expected_failures == 0);
    }

    #[test]
    fn prop_verdicts_are_deterministic(city in "[A-Za-z]{1,10}") {
        let verifier = ConstraintVerifier::with_defaults();
        let constraints = [Constraint::field_equals("city", "Seattle")];
        let result = json!({ "city": city });
        prop_assert_eq!(
            verifier.check(&result, &constraints),
            verifier.check(&result, &constraints)
        );
    }

    #[test]
    fn prop_cycle_needs_a_full_window(calls in 0usize..6) {
        let config = LoopDetectorConfig { cycle_window: 4, ..LoopDetectorConfig::default() };
        let detector = LoopDetector::new(config);
        let mut history = detector.history();
        for _ in 0..calls {
            history.push(Observation::new(
                "search", "same query", "same answer", ToolStatus::Ok, Some("leaf".into()), Utc::now(),
            ));
        }
        let fired = detector.evaluate(&history, Utc::now()).fired(DetectorKind::Cycle);
        prop_assert_eq!(fired, calls >= 4);
    }
}

#[test]
fn cycle_threshold_must_be_exceeded() {
    let observe = |input: &str| {
        Observation::new("search", input, "", ToolStatus::Ok, Some("leaf".into()), Utc::now())
    };
    let fires_at = |threshold: f64| {
        let detector = LoopDetector::new(LoopDetectorConfig {
            cycle_window: 2,
            cycle_similarity_threshold: threshold,
            ..LoopDetectorConfig::default()
        });
        let mut history = detector.history();
        // {alpha, beta, tool:search} vs {alpha, gamma, tool:search}: 2 / 4
        history.push(observe("alpha beta"));
        history.push(observe("alpha gamma"));
        detector.evaluate(&history, Utc::now()).fired(DetectorKind::Cycle)
    };

    assert!(!fires_at(0.5));
    assert!(fires_at(0.49));
}

#[test]
fn check_facts_only_sees_constraints_with_evidence() {
    let source = ContentHash::compute(b"tool output");
    let mut state = AgentState::new(GoalTree::new("root", "find parcel"), PlannerConfig::default())
        .with_constraint(Constraint::field_equals("city", "Seattle"))
        .with_constraint(Constraint::geo_membership("county_fips", ["53033"]));
    state
        .facts
        .push(Fact::new("parcel", "county_fips", "53057", source));

    let verdict = ConstraintVerifier::with_defaults().check_facts(&state);
    assert!(!verdict.ok);
    assert_eq!(verdict.violations.len(), 1);
    assert_eq!(verdict.violations[0].constraint, "county_fips");
}

#[test]
fn unlocked_constraints_are_not_rechecked() {
    let source = ContentHash::compute(b"tool output");
    let mut state = AgentState::new(GoalTree::new("root", "find parcel"), PlannerConfig::default())
        .with_constraint(Constraint::field_equals("city", "Seattle").unlocked());
    state.facts.push(Fact::new("parcel", "city", "Tacoma", source));

    assert!(ConstraintVerifier::with_defaults().check_facts(&state).ok);
}

#[test]
fn history_from_detector_holds_the_no_progress_window() {
    let detector = LoopDetector::new(LoopDetectorConfig {
        no_progress_calls: 40,
        history_capacity: 8,
        ..LoopDetectorConfig::default()
    });
    let mut history: RunHistory = detector.history();
    for i in 0..40 {
        history.push(Observation::new(
            "search",
            &format!("query number {i}"),
            "",
            ToolStatus::Ok,
            Some(format!("leaf {i}")),
            Utc::now(),
        ));
    }
    assert_eq!(history.len(), 40);
    assert!(detector
        .evaluate(&history, Utc::now())
        .fired(DetectorKind::NoProgress));
}
