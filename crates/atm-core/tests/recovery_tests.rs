use atm_core::{
    allowed_transitions, validate_transition, Perturbation, RecoveryConfig, RecoveryController,
    RecoveryState,
};
use atm_guard::{DetectorKind, DetectorTrigger, LoopReport, Verdict};
use atm_test_utils::seattle_state;
use proptest::prelude::*;

#[test]
fn test_active_transitions() {
    assert!(validate_transition(RecoveryState::Active, RecoveryState::RolledBack).is_ok());

    // Branching and suspension always go through a rollback
    assert!(validate_transition(RecoveryState::Active, RecoveryState::Branched).is_err());
    assert!(validate_transition(RecoveryState::Active, RecoveryState::ClarificationNeeded).is_err());
}

#[test]
fn test_clarification_only_exits_to_active() {
    assert_eq!(
        allowed_transitions(RecoveryState::ClarificationNeeded),
        vec![RecoveryState::Active]
    );
    assert!(
        validate_transition(RecoveryState::ClarificationNeeded, RecoveryState::RolledBack).is_err()
    );
}

fn any_state() -> impl Strategy<Value = RecoveryState> {
    prop_oneof![
        Just(RecoveryState::Active),
        Just(RecoveryState::RolledBack),
        Just(RecoveryState::Branched),
        Just(RecoveryState::ClarificationNeeded),
    ]
}

fn any_perturbation() -> impl Strategy<Value = Perturbation> {
    prop_oneof![
        Just(Perturbation::AlternateToolOrder),
        Just(Perturbation::AlternateQueryTemplate),
        Just(Perturbation::LowerTemperature),
        Just(Perturbation::TightenFilter),
    ]
}

/// `true` = violation, `false` = pass
fn outcome_sequence() -> impl Strategy<Value = Vec<(bool, bool)>> {
    prop::collection::vec((any::<bool>(), any::<bool>()), 1..20)
}

proptest! {
    #[test]
    fn prop_all_transitions_are_subset_of_allowed(from in any_state(), to in any_state()) {
        let res = validate_transition(from, to);
        let allowed = allowed_transitions(from);

        if res.is_ok() {
            prop_assert!(allowed.contains(&to));
        } else {
            prop_assert!(!allowed.contains(&to));
        }
    }

    #[test]
    fn prop_perturbation_changes_only_its_dimension(p in any_perturbation()) {
        let cfg = seattle_state().planner_cfg;
        prop_assume!(p.applies_to(&cfg));
        let next = p.apply(&cfg);

        prop_assert_ne!(&next, &cfg);
        prop_assert_eq!(next.seed, cfg.seed);
        prop_assert_eq!(&next.tool_allowlist, &cfg.tool_allowlist);
        prop_assert_eq!(next.budgets, cfg.budgets);
        let changed = [
            next.tool_order != cfg.tool_order,
            next.query_templates != cfg.query_templates,
            next.temperature != cfg.temperature,
            next.filter_level != cfg.filter_level,
        ];
        prop_assert_eq!(changed.iter().filter(|c| **c).count(), 1);
    }

    #[test]
    fn prop_controller_never_exceeds_perturbation_cap(
        outcomes in outcome_sequence(),
        cap in 1usize..=2,
    ) {
        let head = seattle_state();
        let mut controller = RecoveryController::new(RecoveryConfig {
            clarification_after_rollbacks: u32::MAX,
            max_perturbations: cap,
        });

        for (violated, looped) in outcomes {
            let verdict = if violated {
                Verdict { ok: false, reasons: vec!["bad".into()], violations: vec![] }
            } else {
                Verdict::pass()
            };
            let report = LoopReport {
                triggers: if looped {
                    vec![DetectorTrigger { kind: DetectorKind::Cycle, reason: "same call".into() }]
                } else {
                    vec![]
                },
            };
            match controller.assess(&verdict, &report, &head).unwrap() {
                atm_core::Directive::Integrate => {
                    prop_assert!(!violated && !looped);
                    prop_assert_eq!(controller.consecutive_rollbacks(), 0);
                }
                atm_core::Directive::Rollback { cause } => {
                    let (_, applied) = controller.branch(&head.planner_cfg, &cause).unwrap();
                    prop_assert!(!applied.is_empty());
                    prop_assert!(applied.len() <= cap);
                }
                atm_core::Directive::Clarify { .. } => prop_assert!(false, "threshold is unreachable"),
            }
            prop_assert_eq!(controller.state(), RecoveryState::Active);
        }
    }

    #[test]
    fn prop_clarification_after_threshold(threshold in 1u32..5) {
        let head = seattle_state();
        let mut controller = RecoveryController::new(RecoveryConfig {
            clarification_after_rollbacks: threshold,
            ..RecoveryConfig::default()
        });
        let bad = Verdict { ok: false, reasons: vec!["bad".into()], violations: vec![] };

        for _ in 1..threshold {
            let directive = controller.assess(&bad, &LoopReport::default(), &head).unwrap();
            let atm_core::Directive::Rollback { cause } = directive else {
                return Err(TestCaseError::fail("expected rollback before the threshold"));
            };
            controller.branch(&head.planner_cfg, &cause).unwrap();
        }
        let directive = controller.assess(&bad, &LoopReport::default(), &head).unwrap();
        let is_clarify = matches!(directive, atm_core::Directive::Clarify { .. });
        prop_assert!(is_clarify);
        prop_assert_eq!(controller.state(), RecoveryState::ClarificationNeeded);
        prop_assert_eq!(controller.consecutive_rollbacks(), threshold);
    }
}
