use atm_state::{
    AgentState, Constraint, ContentHash, Fact, GoalTree, Integration, PlannerConfig, RunId,
    SnapshotId, ToolCallId, ToolCallRecord, ToolStatus,
};
use atm_store::{GcPolicy, SnapshotStore, StoreConfig, StoreError};
use chrono::Utc;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Step {
    Summary(String),
    Fact(String, String),
    Temperature(f64),
    Constraint(String),
    CompleteLeaf,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        "[a-z ]{0,24}".prop_map(Step::Summary),
        ("[a-z_]{1,8}", "[A-Za-z0-9]{1,8}").prop_map(|(p, v)| Step::Fact(p, v)),
        (0.0..=1.0f64).prop_map(Step::Temperature),
        "[A-Za-z]{1,8}".prop_map(Step::Constraint),
        Just(Step::CompleteLeaf),
    ]
}

fn initial_state() -> AgentState {
    AgentState::new(
        GoalTree::new("root", "objective")
            .with_task("a", "first", "root")
            .with_task("b", "second", "root"),
        PlannerConfig::default().with_tool("search").with_seed(11),
    )
    .with_constraint(Constraint::field_equals("city", "Seattle"))
}

fn tool_call(output: &[u8]) -> ToolCallRecord {
    ToolCallRecord {
        id: ToolCallId::new(),
        snapshot_id: SnapshotId::new(),
        name: "search".to_string(),
        input_digest: ContentHash::compute(b"query"),
        output_digest: ContentHash::compute(output),
        status: ToolStatus::Ok,
        latency: Duration::from_millis(3),
        url: Some("https://example.org/result".to_string()),
        created_at: Utc::now(),
    }
}

fn advance(state: &AgentState, step: &Step) -> AgentState {
    match step {
        Step::Summary(s) => state
            .integrate(Integration {
                scratch_summary: Some(s.clone()),
                ..Integration::default()
            })
            .unwrap(),
        Step::Fact(predicate, value) => {
            let call = tool_call(value.as_bytes());
            let digest = call.output_digest;
            state
                .integrate(Integration {
                    tool_calls: vec![call],
                    facts: vec![Fact::new("subject", predicate.as_str(), value.as_str(), digest)],
                    ..Integration::default()
                })
                .unwrap()
        }
        Step::Temperature(t) => {
            let cfg = state.planner_cfg.clone().with_temperature(*t);
            state.with_planner_cfg(cfg)
        }
        Step::Constraint(city) => {
            state.update_constraint(Constraint::field_equals("city", city.as_str()))
        }
        Step::CompleteLeaf => state
            .integrate(Integration {
                complete_active_leaf: true,
                ..Integration::default()
            })
            .unwrap(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_reconstruct_roundtrips_any_chain(
        steps in prop::collection::vec(step_strategy(), 1..24),
        max_delta_depth in 1u32..6,
    ) {
        let store = SnapshotStore::in_memory(StoreConfig::default().with_max_delta_depth(max_delta_depth));
        let run = RunId::new();

        let mut state = initial_state();
        let mut parent = store.snapshot(run, &state, None).unwrap();
        let mut expected = vec![(parent, state.clone())];
        for step in &steps {
            state = advance(&state, step);
            parent = store.snapshot(run, &state, Some(parent)).unwrap();
            expected.push((parent, state.clone()));
        }

        for (id, state) in &expected {
            let rebuilt = store.reconstruct(*id).unwrap();
            prop_assert_eq!(&rebuilt, state);
            prop_assert_eq!(rebuilt.digest().unwrap(), store.get_snapshot(*id).unwrap().state_digest);
            prop_assert!(store.get_snapshot(*id).unwrap().encoding.chain_depth() <= max_delta_depth);
        }
    }
}

#[test]
fn delta_chain_with_unrounded_temperatures_reconstructs_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let run = RunId::new();
    let temperatures = [0.985_690_694_632_869_5, 0.1 + 0.2, 1.0 / 3.0, 0.7];

    let expected = {
        let store = SnapshotStore::open(dir.path(), StoreConfig::default()).unwrap();
        let mut state = initial_state();
        let mut parent = store.snapshot(run, &state, None).unwrap();
        let mut expected = vec![(parent, state.clone())];
        for t in temperatures {
            state = advance(&state, &Step::Temperature(t));
            parent = store.snapshot(run, &state, Some(parent)).unwrap();
            assert!(!store.get_snapshot(parent).unwrap().encoding.is_full());
            expected.push((parent, state.clone()));
        }
        for (id, state) in &expected {
            assert_eq!(&store.reconstruct(*id).unwrap(), state);
        }
        expected
    };

    let store = SnapshotStore::open(dir.path(), StoreConfig::default()).unwrap();
    for (id, state) in &expected {
        let rebuilt = store.reconstruct(*id).unwrap();
        assert_eq!(
            rebuilt.planner_cfg.temperature.to_bits(),
            state.planner_cfg.temperature.to_bits()
        );
        assert_eq!(rebuilt.digest().unwrap(), store.get_snapshot(*id).unwrap().state_digest);
    }
}

#[test]
fn non_finite_temperature_is_refused_before_anything_is_written() {
    let store = SnapshotStore::in_memory(StoreConfig::default());
    let run = RunId::new();
    let s0 = initial_state();
    let id0 = store.snapshot(run, &s0, None).unwrap();

    let bad = advance(&s0, &Step::Temperature(f64::NAN));
    assert!(store.snapshot(run, &bad, Some(id0)).is_err());
    assert_eq!(store.list_run(run).len(), 1);
    assert_eq!(store.head(run), Some(id0));
}

#[test]
fn milestones_mark_new_facts_and_constraint_changes() {
    let store = SnapshotStore::in_memory(StoreConfig::default());
    let run = RunId::new();
    let s0 = initial_state();
    let s1 = advance(&s0, &Step::Summary("thinking".into()));
    let s2 = advance(&s1, &Step::Fact("city".into(), "Seattle".into()));
    let s3 = advance(&s2, &Step::Constraint("Tacoma".into()));

    let id0 = store.snapshot(run, &s0, None).unwrap();
    let id1 = store.snapshot(run, &s1, Some(id0)).unwrap();
    let id2 = store.snapshot(run, &s2, Some(id1)).unwrap();
    let id3 = store.snapshot(run, &s3, Some(id2)).unwrap();

    let flags: Vec<bool> = [id0, id1, id2, id3]
        .iter()
        .map(|id| store.get_snapshot(*id).unwrap().is_milestone)
        .collect();
    assert_eq!(flags, vec![true, false, true, true]);
}

#[test]
fn fs_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let run = RunId::new();
    let s0 = initial_state();
    let s1 = advance(&s0, &Step::Summary("persisted".into()));
    let s2 = advance(&s1, &Step::Fact("county_fips".into(), "53033".into()));

    let (id0, id1, id2) = {
        let store = SnapshotStore::open(dir.path(), StoreConfig::default()).unwrap();
        let id0 = store.snapshot(run, &s0, None).unwrap();
        let id1 = store.snapshot(run, &s1, Some(id0)).unwrap();
        let id2 = store.snapshot(run, &s2, Some(id1)).unwrap();
        store.rollback(run, id1).unwrap();
        store
            .record_tool_calls(run, s2.tool_ledger.clone())
            .unwrap();
        (id0, id1, id2)
    };

    let store = SnapshotStore::open(dir.path(), StoreConfig::default()).unwrap();
    assert_eq!(store.reconstruct(id0).unwrap(), s0);
    assert_eq!(store.reconstruct(id1).unwrap(), s1);
    assert_eq!(store.reconstruct(id2).unwrap(), s2);
    assert_eq!(store.head(run), Some(id1));
    assert_eq!(store.last_snapshot_id(run), Some(id2));
    assert_eq!(store.tool_ledger(run), s2.tool_ledger);
    assert_eq!(store.facts(run).len(), 1);

    let root_blob = store.get_snapshot(id0).unwrap().encoding.blob();
    assert_eq!(store.content().ref_count(&root_blob), 1);
}

#[test]
fn ledgered_outputs_stay_pinned_across_reopen_and_gc() {
    let dir = tempfile::tempdir().unwrap();
    let run = RunId::new();
    let output = b"{\"county_fips\":\"53033\"}";

    let digest = {
        let store = SnapshotStore::open(dir.path(), StoreConfig::default()).unwrap();
        let digest = store.content().put_retained(output).unwrap();
        store.record_tool_calls(run, vec![tool_call(output)]).unwrap();
        store.snapshot(run, &initial_state(), None).unwrap();
        assert_eq!(store.content().ref_count(&digest), 1);
        digest
    };

    let store = SnapshotStore::open(dir.path(), StoreConfig::default()).unwrap();
    assert_eq!(store.content().ref_count(&digest), 1);
    store
        .collect_garbage(&GcPolicy::aggressive(), Utc::now())
        .unwrap();
    assert_eq!(store.content().get(&digest).unwrap(), output);
}

#[test]
fn missing_ancestor_blob_surfaces_as_not_found() {
    let store = SnapshotStore::in_memory(StoreConfig::default());
    let run = RunId::new();
    let s0 = initial_state();
    let id0 = store.snapshot(run, &s0, None).unwrap();
    let id1 = store
        .snapshot(run, &advance(&s0, &Step::Summary("x".into())), Some(id0))
        .unwrap();

    let root_blob = store.get_snapshot(id0).unwrap().encoding.blob();
    while store.content().ref_count(&root_blob) > 0 {
        store.content().release(&root_blob).unwrap();
    }

    let err = store.reconstruct(id1).unwrap_err();
    assert!(matches!(err, StoreError::BlobNotFound(d) if d == root_blob));
}
