//! ATM State Model
//!
//! Point-in-time agent state with canonical serialization, content digests
//! and structural deltas.
//!
//! # Core Concepts
//!
//! - [`AgentState`]: goal tree, constraints, facts, tool ledger, planner config
//! - [`ContentHash`]: 32-byte Blake3 digest of canonical bytes
//! - [`StateDelta`]: field-level patch with base/target digests
//!
//! # Example
//!
//! ```rust,ignore
//! use atm_state::{AgentState, GoalTree, PlannerConfig, StateDelta};
//!
//! let s0 = AgentState::new(GoalTree::new("root", "find parcel"), PlannerConfig::default());
//! let s1 = s0.integrate(integration)?;
//! let delta = StateDelta::between(&s0, &s1)?;
//! assert_eq!(delta.apply(&s0)?, s1);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod delta;
mod error;
mod hash;
mod ids;
mod state;

pub use delta::{DeltaError, DeltaOp, StateDelta};
pub use error::StateError;
pub use hash::{ContentHash, HashError};
pub use ids::{RunId, SnapshotId, ToolCallId};
pub use state::{
    AgentState, Budgets, Constraint, ConstraintKind, Fact, GoalNode, GoalTree, Integration,
    PlannerConfig, ToolCallRecord, ToolStatus,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
