//! Structural deltas between agent states
//!
//! A [`StateDelta`] is a field-level patch, not a byte diff. It records the
//! digest of the state it applies to and the digest it must produce, so a
//! delta chain can be replayed and checked link by link.

use crate::hash::{ContentHash, HashError};
use crate::state::{AgentState, Constraint, Fact, GoalTree, PlannerConfig, ToolCallRecord};
use serde::{Deserialize, Serialize};

/// One field-level operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum DeltaOp {
    /// Replace the goal tree
    SetGoalTree(GoalTree),
    /// Insert or replace a constraint
    PutConstraint(Constraint),
    /// Remove a constraint by name
    RemoveConstraint(String),
    /// Append facts after the existing ones
    AppendFacts(Vec<Fact>),
    /// Replace the whole fact list (target does not extend the base)
    ReplaceFacts(Vec<Fact>),
    /// Append ledger records
    AppendToolCalls(Vec<ToolCallRecord>),
    /// Replace the whole ledger (only across branches, never within one)
    ReplaceToolCalls(Vec<ToolCallRecord>),
    /// Replace the planner configuration
    SetPlannerConfig(PlannerConfig),
    /// Replace the scratch summary
    SetScratchSummary(String),
}

impl DeltaOp {
    /// Name of the state field the operation touches
    #[must_use]
    pub fn field(&self) -> &'static str {
        match self {
            Self::SetGoalTree(_) => "goal_tree",
            Self::PutConstraint(_) | Self::RemoveConstraint(_) => "constraints",
            Self::AppendFacts(_) | Self::ReplaceFacts(_) => "facts",
            Self::AppendToolCalls(_) | Self::ReplaceToolCalls(_) => "tool_ledger",
            Self::SetPlannerConfig(_) => "planner_cfg",
            Self::SetScratchSummary(_) => "scratch_summary",
        }
    }
}

/// Structural patch from one state to another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    /// Digest the patch applies to
    pub base_digest: ContentHash,
    /// Digest the patch produces
    pub target_digest: ContentHash,
    /// Operations in application order
    pub ops: Vec<DeltaOp>,
}

impl StateDelta {
    /// Compute the patch turning `base` into `target`
    ///
    /// # Errors
    /// Returns error if either state cannot be digested
    pub fn between(base: &AgentState, target: &AgentState) -> Result<Self, HashError> {
        let mut ops = Vec::new();

        if base.goal_tree != target.goal_tree {
            ops.push(DeltaOp::SetGoalTree(target.goal_tree.clone()));
        }

        for name in base.constraints.keys() {
            if !target.constraints.contains_key(name) {
                ops.push(DeltaOp::RemoveConstraint(name.clone()));
            }
        }
        for (name, constraint) in &target.constraints {
            if base.constraints.get(name) != Some(constraint) {
                ops.push(DeltaOp::PutConstraint(constraint.clone()));
            }
        }

        if let Some(op) = list_op(&base.facts, &target.facts, DeltaOp::AppendFacts, DeltaOp::ReplaceFacts) {
            ops.push(op);
        }
        if let Some(op) = list_op(
            &base.tool_ledger,
            &target.tool_ledger,
            DeltaOp::AppendToolCalls,
            DeltaOp::ReplaceToolCalls,
        ) {
            ops.push(op);
        }

        if base.planner_cfg != target.planner_cfg {
            ops.push(DeltaOp::SetPlannerConfig(target.planner_cfg.clone()));
        }
        if base.scratch_summary != target.scratch_summary {
            ops.push(DeltaOp::SetScratchSummary(target.scratch_summary.clone()));
        }

        Ok(Self {
            base_digest: base.digest()?,
            target_digest: target.digest()?,
            ops,
        })
    }

    /// Whether the two states were identical
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Distinct fields touched, in op order
    #[must_use]
    pub fn touched_fields(&self) -> Vec<&'static str> {
        let mut fields: Vec<&'static str> = Vec::new();
        for op in &self.ops {
            let field = op.field();
            if !fields.contains(&field) {
                fields.push(field);
            }
        }
        fields
    }

    /// Check the patch targets `base`
    ///
    /// # Errors
    /// Returns [`DeltaError::BaseMismatch`] if the digests differ
    pub fn validate_base(&self, base: &AgentState) -> Result<(), DeltaError> {
        let actual = base.digest()?;
        if actual != self.base_digest {
            return Err(DeltaError::BaseMismatch {
                expected: self.base_digest,
                actual,
            });
        }
        Ok(())
    }

    /// Apply to `base`, producing a new state.
    ///
    /// # Errors
    /// Returns [`DeltaError::BaseMismatch`] if `base` is not the state the patch
    /// was computed against, or [`DeltaError::TargetMismatch`] if the result
    /// does not hash to `target_digest`.
    pub fn apply(&self, base: &AgentState) -> Result<AgentState, DeltaError> {
        self.validate_base(base)?;

        let mut next = base.clone();
        for op in &self.ops {
            match op {
                DeltaOp::SetGoalTree(tree) => next.goal_tree = tree.clone(),
                DeltaOp::PutConstraint(c) => {
                    next.constraints.insert(c.name.clone(), c.clone());
                }
                DeltaOp::RemoveConstraint(name) => {
                    next.constraints.remove(name);
                }
                DeltaOp::AppendFacts(facts) => next.facts.extend(facts.iter().cloned()),
                DeltaOp::ReplaceFacts(facts) => next.facts = facts.clone(),
                DeltaOp::AppendToolCalls(calls) => next.tool_ledger.extend(calls.iter().cloned()),
                DeltaOp::ReplaceToolCalls(calls) => next.tool_ledger = calls.clone(),
                DeltaOp::SetPlannerConfig(cfg) => next.planner_cfg = cfg.clone(),
                DeltaOp::SetScratchSummary(s) => next.scratch_summary = s.clone(),
            }
        }

        let actual = next.digest()?;
        if actual != self.target_digest {
            return Err(DeltaError::TargetMismatch {
                expected: self.target_digest,
                actual,
            });
        }
        Ok(next)
    }
}

/// Append when `target` extends `base`, replace otherwise
fn list_op<T: Clone + PartialEq>(
    base: &[T],
    target: &[T],
    append: fn(Vec<T>) -> DeltaOp,
    replace: fn(Vec<T>) -> DeltaOp,
) -> Option<DeltaOp> {
    if base == target {
        None
    } else if target.len() > base.len() && target.starts_with(base) {
        Some(append(target[base.len()..].to_vec()))
    } else {
        Some(replace(target.to_vec()))
    }
}

/// Errors applying a delta
#[derive(Debug, thiserror::Error)]
pub enum DeltaError {
    /// Patch applied to the wrong base
    #[error("base digest mismatch: expected {expected}, got {actual}")]
    BaseMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },

    /// Patch produced an unexpected state
    #[error("target digest mismatch: expected {expected}, got {actual}")]
    TargetMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },

    /// Digest computation failed
    #[error("digest error: {0}")]
    Hash(#[from] HashError),
}
