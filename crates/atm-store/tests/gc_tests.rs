use atm_state::{
    AgentState, ContentHash, Fact, GoalTree, Integration, PlannerConfig, RunId, SnapshotId,
    ToolCallId, ToolCallRecord, ToolStatus,
};
use atm_store::{GcPolicy, SnapshotStore, StoreConfig};
use chrono::Utc;
use std::collections::HashSet;
use std::time::Duration;

fn state(summary: &str) -> AgentState {
    AgentState::new(GoalTree::new("root", "objective"), PlannerConfig::default())
        .integrate(Integration {
            scratch_summary: Some(summary.to_string()),
            ..Integration::default()
        })
        .unwrap()
}

fn with_fact(base: &AgentState, value: &str) -> AgentState {
    let call = ToolCallRecord {
        id: ToolCallId::new(),
        snapshot_id: SnapshotId::new(),
        name: "lookup".to_string(),
        input_digest: ContentHash::compute(value.as_bytes()),
        output_digest: ContentHash::compute(value.as_bytes()),
        status: ToolStatus::Ok,
        latency: Duration::ZERO,
        url: None,
        created_at: Utc::now(),
    };
    let digest = call.output_digest;
    base.integrate(Integration {
        tool_calls: vec![call],
        facts: vec![Fact::new("parcel", "owner", value, digest)],
        ..Integration::default()
    })
    .unwrap()
}

/// Every snapshot that must survive: milestones, heads and their ancestors
fn protected(store: &SnapshotStore, run: RunId) -> HashSet<SnapshotId> {
    let mut out = HashSet::new();
    let mut anchors: Vec<SnapshotId> = store
        .list_run(run)
        .into_iter()
        .filter(|r| r.is_milestone)
        .map(|r| r.id)
        .collect();
    anchors.extend(store.head(run));
    for anchor in anchors {
        out.extend(store.ancestors(anchor).unwrap());
    }
    out
}

/// Builds:
///
/// ```text
/// root ─ a1 ─ a2 ─ a3(milestone) ─ a4
///      └ b1 ─ b2
///      └ c1 ─ c2 ─ c3 (head)
/// ```
fn branch_tree(store: &SnapshotStore, run: RunId) -> Vec<(&'static str, SnapshotId)> {
    let root = store.snapshot(run, &state("root"), None).unwrap();
    let a1 = store.snapshot(run, &state("a1"), Some(root)).unwrap();
    let a2 = store.snapshot(run, &state("a2"), Some(a1)).unwrap();
    let a3 = store
        .snapshot(run, &with_fact(&state("a2"), "alice"), Some(a2))
        .unwrap();
    let a4 = store
        .snapshot(run, &with_fact(&state("a4"), "alice"), Some(a3))
        .unwrap();
    store.rollback(run, root).unwrap();
    let b1 = store.snapshot(run, &state("b1"), Some(root)).unwrap();
    let b2 = store.snapshot(run, &state("b2"), Some(b1)).unwrap();
    store.rollback(run, root).unwrap();
    let c1 = store.snapshot(run, &state("c1"), Some(root)).unwrap();
    let c2 = store.snapshot(run, &state("c2"), Some(c1)).unwrap();
    let c3 = store.snapshot(run, &state("c3"), Some(c2)).unwrap();
    vec![
        ("root", root),
        ("a1", a1),
        ("a2", a2),
        ("a3", a3),
        ("a4", a4),
        ("b1", b1),
        ("b2", b2),
        ("c1", c1),
        ("c2", c2),
        ("c3", c3),
    ]
}

#[test]
fn gc_preserves_milestone_and_head_ancestry() {
    let store = SnapshotStore::in_memory(StoreConfig::default());
    let run = RunId::new();
    let tree = branch_tree(&store, run);
    let before = protected(&store, run);

    let report = store
        .collect_garbage(&GcPolicy::aggressive(), Utc::now())
        .unwrap();
    assert!(!report.skipped);

    let after = protected(&store, run);
    assert_eq!(before, after);
    for id in &before {
        assert!(store.contains(*id));
        assert!(store.reconstruct(*id).is_ok());
    }

    let removed: HashSet<&str> = tree
        .iter()
        .filter(|(_, id)| !store.contains(*id))
        .map(|(name, _)| *name)
        .collect();
    assert_eq!(removed, HashSet::from(["a4", "b1", "b2"]));
}

#[test]
fn gc_is_stable_when_repeated() {
    let store = SnapshotStore::in_memory(StoreConfig::default());
    let run = RunId::new();
    branch_tree(&store, run);

    store
        .collect_garbage(&GcPolicy::aggressive(), Utc::now())
        .unwrap();
    let survivors: HashSet<SnapshotId> = store.list_run(run).into_iter().map(|r| r.id).collect();

    let second = store
        .collect_garbage(&GcPolicy::aggressive(), Utc::now())
        .unwrap();
    assert!(second.removed.is_empty());
    let again: HashSet<SnapshotId> = store.list_run(run).into_iter().map(|r| r.id).collect();
    assert_eq!(survivors, again);
}

#[test]
fn gc_keeps_shared_blobs_referenced_elsewhere() {
    let store = SnapshotStore::in_memory(StoreConfig::default());
    let run_a = RunId::new();
    let run_b = RunId::new();

    let a0 = store.snapshot(run_a, &state("same"), None).unwrap();
    let b0 = store.snapshot(run_b, &state("same"), None).unwrap();
    let a1 = store.snapshot(run_a, &state("side"), Some(a0)).unwrap();
    let b1 = store.snapshot(run_b, &state("side"), Some(b0)).unwrap();
    assert_eq!(
        store.get_snapshot(a1).unwrap().encoding.blob(),
        store.get_snapshot(b1).unwrap().encoding.blob()
    );

    store.rollback(run_a, a0).unwrap();
    let report = store
        .collect_garbage(&GcPolicy::aggressive(), Utc::now())
        .unwrap();
    assert_eq!(report.removed, vec![a1]);
    assert_eq!(report.blobs_released, 0);
    assert_eq!(store.reconstruct(b1).unwrap(), state("side"));
}

#[test]
fn gc_removals_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let run = RunId::new();
    let dead = {
        let store = SnapshotStore::open(dir.path(), StoreConfig::default()).unwrap();
        let root = store.snapshot(run, &state("root"), None).unwrap();
        let dead = store.snapshot(run, &state("dead"), Some(root)).unwrap();
        store.rollback(run, root).unwrap();
        let report = store
            .collect_garbage(&GcPolicy::aggressive(), Utc::now())
            .unwrap();
        assert_eq!(report.removed, vec![dead]);
        dead
    };

    let store = SnapshotStore::open(dir.path(), StoreConfig::default()).unwrap();
    assert!(!store.contains(dead));
    assert_eq!(store.stats().unwrap().snapshots, 1);
    assert_eq!(store.stats().unwrap().blobs, 1);
}
