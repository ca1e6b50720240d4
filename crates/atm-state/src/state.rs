//! Point-in-time agent state
//!
//! [`AgentState`] is an immutable value once snapshotted: every integration
//! step goes through [`AgentState::integrate`] and yields a new value.
//!
//! # Invariants
//! - Every [`Fact`] references the output digest of a [`ToolCallRecord`] in
//!   the same state's ledger (checked by [`AgentState::validate`]).
//! - The tool ledger is append-only; integration never edits existing records.
//! - Constraints only change through [`AgentState::update_constraint`], which
//!   bumps the constraint's revision.

use crate::error::StateError;
use crate::hash::{ContentHash, HashError};
use crate::ids::{SnapshotId, ToolCallId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;

/// A node in the goal tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalNode {
    /// Stable node id
    pub id: String,
    /// What the node is about
    pub description: String,
    /// Parent node, `None` for the root objective
    pub parent: Option<String>,
    /// Whether the task is done
    pub done: bool,
}

/// Hierarchical decomposition of the objective with an active-leaf pointer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalTree {
    /// Nodes in declaration order
    pub nodes: Vec<GoalNode>,
    /// Currently active leaf task
    pub active_leaf: Option<String>,
}

impl GoalTree {
    /// Tree with a single root objective, which is also the active leaf
    #[must_use]
    pub fn new(root_id: impl Into<String>, description: impl Into<String>) -> Self {
        let id = root_id.into();
        Self {
            nodes: vec![GoalNode {
                id: id.clone(),
                description: description.into(),
                parent: None,
                done: false,
            }],
            active_leaf: Some(id),
        }
    }

    /// Add a subtask under `parent`
    #[must_use]
    pub fn with_task(
        mut self,
        id: impl Into<String>,
        description: impl Into<String>,
        parent: impl Into<String>,
    ) -> Self {
        self.nodes.push(GoalNode {
            id: id.into(),
            description: description.into(),
            parent: Some(parent.into()),
            done: false,
        });
        self.active_leaf = self.next_open_leaf();
        self
    }

    /// Look up a node
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&GoalNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// The active leaf node, if any
    #[must_use]
    pub fn active(&self) -> Option<&GoalNode> {
        self.active_leaf.as_deref().and_then(|id| self.node(id))
    }

    /// Mark the active leaf done and advance the pointer.
    ///
    /// A parent is completed automatically once all its children are done.
    #[must_use]
    pub fn complete_active(&self) -> Self {
        let mut next = self.clone();
        if let Some(active) = next.active_leaf.clone() {
            next.mark_done(&active);
            let mut parent = next.node(&active).and_then(|n| n.parent.clone());
            while let Some(p) = parent {
                let all_children_done = next
                    .nodes
                    .iter()
                    .filter(|n| n.parent.as_deref() == Some(p.as_str()))
                    .all(|n| n.done);
                if !all_children_done {
                    break;
                }
                next.mark_done(&p);
                parent = next.node(&p).and_then(|n| n.parent.clone());
            }
        }
        next.active_leaf = next.next_open_leaf();
        next
    }

    fn mark_done(&mut self, id: &str) {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.id == id) {
            node.done = true;
        }
    }

    /// First open node without open children, in declaration order
    fn next_open_leaf(&self) -> Option<String> {
        self.nodes
            .iter()
            .filter(|n| !n.done)
            .find(|n| {
                !self
                    .nodes
                    .iter()
                    .any(|c| !c.done && c.parent.as_deref() == Some(n.id.as_str()))
            })
            .map(|n| n.id.clone())
    }
}

/// Constraint kinds understood by the default verifier.
///
/// `Other` carries kinds this build does not know about; verifiers must treat
/// them as violations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    /// Result field must equal a literal value
    FieldEquals,
    /// Result field must be one of a set of administrative codes
    GeoMembership,
    /// Result field must be a date inside `[from, to]`
    DateRange,
    /// Result entity type must be one of a set of types
    EntityType,
    /// Unrecognized kind
    Other(String),
}

impl ConstraintKind {
    /// Registry name of the kind
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::FieldEquals => "field_equals",
            Self::GeoMembership => "geo_membership",
            Self::DateRange => "date_range",
            Self::EntityType => "entity_type",
            Self::Other(name) => name,
        }
    }
}

/// A named predicate over result data plus the literal parameters it was
/// instantiated with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    /// Constraint name (map key in [`AgentState::constraints`])
    pub name: String,
    /// Which check evaluates it
    pub kind: ConstraintKind,
    /// Literal parameters (`field`, `value`, `allowed`, `from`, `to`, ...)
    pub params: BTreeMap<String, Value>,
    /// Locked for the run unless explicitly updated
    pub locked: bool,
    /// Bumped on every tracked update
    pub revision: u32,
}

impl Constraint {
    /// New locked constraint
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ConstraintKind) -> Self {
        Self {
            name: name.into(),
            kind,
            params: BTreeMap::new(),
            locked: true,
            revision: 0,
        }
    }

    /// `field_equals` constraint on a field named like the constraint
    #[must_use]
    pub fn field_equals(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(name, ConstraintKind::FieldEquals).with_param("value", value)
    }

    /// `geo_membership` constraint on a field named like the constraint
    #[must_use]
    pub fn geo_membership<I, S>(name: impl Into<String>, allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let allowed: Vec<Value> = allowed.into_iter().map(|s| Value::String(s.into())).collect();
        Self::new(name, ConstraintKind::GeoMembership).with_param("allowed", Value::Array(allowed))
    }

    /// Set a parameter
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Mark as not locked
    #[must_use]
    pub fn unlocked(mut self) -> Self {
        self.locked = false;
        self
    }

    /// Result field this constraint inspects (`field` param, else the name)
    #[must_use]
    pub fn field(&self) -> &str {
        self.params
            .get("field")
            .and_then(Value::as_str)
            .unwrap_or(&self.name)
    }
}

/// Outcome class of a tool call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolStatus {
    /// Completed
    Ok,
    /// Failed with an error class (timeout, http_5xx, not_allowed, ...)
    Error {
        /// Error class used for failure signatures
        class: String,
    },
}

impl ToolStatus {
    /// Whether the call succeeded
    #[inline]
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// One external tool invocation. Never edited once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Call id
    pub id: ToolCallId,
    /// Head snapshot the call was made from
    pub snapshot_id: SnapshotId,
    /// Tool name
    pub name: String,
    /// Digest of the canonicalized input
    pub input_digest: ContentHash,
    /// Digest of the output (or error text) blob
    pub output_digest: ContentHash,
    /// Outcome
    pub status: ToolStatus,
    /// Wall time spent, zero on a cache hit
    pub latency: Duration,
    /// Source locator, when the tool has one
    pub url: Option<String>,
    /// When the call finished
    pub created_at: DateTime<Utc>,
}

/// A sourced statement about the world
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    /// Subject
    pub subject: String,
    /// Predicate; constraint fields are matched against predicates
    pub predicate: String,
    /// Object value
    pub object: Value,
    /// Output digest of the tool call this fact came from
    pub source_digest: ContentHash,
    /// Confidence in `[0, 1]`
    pub confidence: f64,
    /// When it was integrated
    pub added_at: DateTime<Utc>,
}

impl Fact {
    /// New fact stamped now with full confidence
    #[must_use]
    pub fn new(
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<Value>,
        source_digest: ContentHash,
    ) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
            source_digest,
            confidence: 1.0,
            added_at: Utc::now(),
        }
    }

    /// Set confidence (clamped to `[0, 1]`, NaN becomes 0)
    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        self
    }

    /// Same subject, predicate and object
    #[must_use]
    pub fn same_claim(&self, other: &Fact) -> bool {
        self.subject == other.subject
            && self.predicate == other.predicate
            && self.object == other.object
    }
}

/// Execution budgets for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budgets {
    /// Maximum tool calls across the run
    pub max_tool_calls: u32,
    /// Maximum wall time for the run
    pub max_wall_time: Duration,
    /// Maximum rollbacks across the run
    pub max_rollbacks: u32,
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            max_tool_calls: 200,
            max_wall_time: Duration::from_secs(30 * 60),
            max_rollbacks: 10,
        }
    }
}

/// Planner knobs; also the replay handle recorded with every snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Sampling seed
    pub seed: u64,
    /// Sampling temperature
    pub temperature: f64,
    /// Tools the planner may call
    pub tool_allowlist: BTreeSet<String>,
    /// Preferred tool order
    pub tool_order: Vec<String>,
    /// Query templates, the first one is active
    pub query_templates: Vec<String>,
    /// Result filter strictness, higher is stricter
    pub filter_level: u8,
    /// Versioned template/index hashes active at this point
    pub template_hashes: BTreeMap<String, ContentHash>,
    /// Budgets
    pub budgets: Budgets,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            temperature: 0.7,
            tool_allowlist: BTreeSet::new(),
            tool_order: Vec::new(),
            query_templates: Vec::new(),
            filter_level: 0,
            template_hashes: BTreeMap::new(),
            budgets: Budgets::default(),
        }
    }
}

impl PlannerConfig {
    /// Allow a tool and append it to the preferred order
    #[must_use]
    pub fn with_tool(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if self.tool_allowlist.insert(name.clone()) {
            self.tool_order.push(name);
        }
        self
    }

    /// Set the seed
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    /// Add a query template
    #[must_use]
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        let template = template.into();
        let digest = ContentHash::compute(template.as_bytes());
        self.template_hashes
            .insert(format!("template:{}", self.query_templates.len()), digest);
        self.query_templates.push(template);
        self
    }

    /// Set budgets
    #[must_use]
    pub fn with_budgets(mut self, budgets: Budgets) -> Self {
        self.budgets = budgets;
        self
    }
}

/// What one successful step adds to a state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Integration {
    /// Tool calls made during the step
    pub tool_calls: Vec<ToolCallRecord>,
    /// Facts extracted from their outputs
    pub facts: Vec<Fact>,
    /// Whether the active goal leaf is complete
    pub complete_active_leaf: bool,
    /// Replacement scratch summary
    pub scratch_summary: Option<String>,
}

/// Full point-in-time agent state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    /// Goal decomposition
    pub goal_tree: GoalTree,
    /// Named constraints
    pub constraints: BTreeMap<String, Constraint>,
    /// Sourced facts in integration order
    pub facts: Vec<Fact>,
    /// Append-only tool ledger
    pub tool_ledger: Vec<ToolCallRecord>,
    /// Planner configuration
    pub planner_cfg: PlannerConfig,
    /// Free-form working summary
    pub scratch_summary: String,
}

impl AgentState {
    /// Initial state for a run
    #[must_use]
    pub fn new(goal_tree: GoalTree, planner_cfg: PlannerConfig) -> Self {
        Self {
            goal_tree,
            planner_cfg,
            ..Self::default()
        }
    }

    /// Add a constraint (run setup only; later changes go through
    /// [`update_constraint`](Self::update_constraint))
    #[must_use]
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.insert(constraint.name.clone(), constraint);
        self
    }

    /// Canonical serialization
    ///
    /// # Errors
    /// Returns [`HashError::NonFinite`] if the temperature or a confidence is
    /// NaN or infinite (JSON would write `null` and the state could not be
    /// decoded), or another error if serialization fails
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, HashError> {
        self.check_finite()?;
        ContentHash::canonical_bytes(self)
    }

    /// Digest of the canonical serialization
    ///
    /// # Errors
    /// Same as [`canonical_bytes`](Self::canonical_bytes)
    pub fn digest(&self) -> Result<ContentHash, HashError> {
        Ok(ContentHash::compute(&self.canonical_bytes()?))
    }

    fn check_finite(&self) -> Result<(), HashError> {
        if !self.planner_cfg.temperature.is_finite() {
            return Err(HashError::NonFinite("planner_cfg.temperature".to_string()));
        }
        match self.facts.iter().find(|f| !f.confidence.is_finite()) {
            Some(fact) => Err(HashError::NonFinite(format!(
                "confidence of fact '{} {}'",
                fact.subject, fact.predicate
            ))),
            None => Ok(()),
        }
    }

    /// Decode a canonical serialization
    ///
    /// # Errors
    /// Returns error if the bytes are not a valid state
    pub fn from_canonical_bytes(bytes: &[u8]) -> Result<Self, StateError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Constraints that are locked for the run
    pub fn locked_constraints(&self) -> impl Iterator<Item = &Constraint> {
        self.constraints.values().filter(|c| c.locked)
    }

    /// Whether `digest` is the output of a call in the ledger
    #[must_use]
    pub fn has_output(&self, digest: &ContentHash) -> bool {
        self.tool_ledger.iter().any(|r| r.output_digest == *digest)
    }

    /// Check the sourcing invariant for every fact
    ///
    /// # Errors
    /// Returns [`StateError::SourcelessFact`] for the first unsourced fact
    pub fn validate(&self) -> Result<(), StateError> {
        let outputs: HashSet<ContentHash> =
            self.tool_ledger.iter().map(|r| r.output_digest).collect();
        match self.facts.iter().find(|f| !outputs.contains(&f.source_digest)) {
            Some(fact) => Err(StateError::sourceless(fact)),
            None => Ok(()),
        }
    }

    /// Produce the successor state for a verified step.
    ///
    /// Facts must cite an output digest of a call already in the ledger or in
    /// `integration.tool_calls`; otherwise the whole integration is rejected.
    /// Claims already present are not duplicated.
    ///
    /// # Errors
    /// Returns [`StateError::SourcelessFact`] or
    /// [`StateError::DuplicateToolCall`]
    pub fn integrate(&self, integration: Integration) -> Result<Self, StateError> {
        let mut next = self.clone();

        for record in integration.tool_calls {
            if next.tool_ledger.iter().any(|r| r.id == record.id) {
                return Err(StateError::DuplicateToolCall(record.id));
            }
            next.tool_ledger.push(record);
        }

        for fact in integration.facts {
            if !next.has_output(&fact.source_digest) {
                return Err(StateError::sourceless(&fact));
            }
            if !next.facts.iter().any(|f| f.same_claim(&fact)) {
                next.facts.push(fact);
            }
        }

        if integration.complete_active_leaf {
            next.goal_tree = next.goal_tree.complete_active();
        }
        if let Some(summary) = integration.scratch_summary {
            next.scratch_summary = summary;
        }
        Ok(next)
    }

    /// Tracked constraint update: returns a new state with the constraint
    /// replaced and its revision bumped past the previous one.
    #[must_use]
    pub fn update_constraint(&self, mut constraint: Constraint) -> Self {
        let mut next = self.clone();
        constraint.revision = self
            .constraints
            .get(&constraint.name)
            .map_or(0, |c| c.revision + 1);
        next.constraints.insert(constraint.name.clone(), constraint);
        next
    }

    /// New state with a different planner configuration
    #[must_use]
    pub fn with_planner_cfg(&self, planner_cfg: PlannerConfig) -> Self {
        Self {
            planner_cfg,
            ..self.clone()
        }
    }

    /// Whether this state adds at least one fact or constraint change over
    /// `parent` (the milestone criterion)
    #[must_use]
    pub fn adds_knowledge_over(&self, parent: &AgentState) -> bool {
        let new_fact = self
            .facts
            .iter()
            .any(|f| !parent.facts.iter().any(|p| p.same_claim(f)));
        new_fact || self.constraints != parent.constraints
    }

    /// Facts in this state whose claim is absent from `parent`
    #[must_use]
    pub fn new_facts_since<'a>(&'a self, parent: &AgentState) -> Vec<&'a Fact> {
        self.facts
            .iter()
            .filter(|f| !parent.facts.iter().any(|p| p.same_claim(f)))
            .collect()
    }

    /// Latest value of each predicate, as a JSON object.
    ///
    /// Used to re-verify a state's own evidence against its constraints.
    #[must_use]
    pub fn fact_view(&self) -> Value {
        let mut view = serde_json::Map::new();
        for fact in &self.facts {
            view.insert(fact.predicate.clone(), fact.object.clone());
        }
        Value::Object(view)
    }
}
