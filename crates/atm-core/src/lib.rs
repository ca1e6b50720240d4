//! ATM Core
//!
//! The run loop that ties the snapshot store, memoization cache, verifier
//! and loop detectors together.
//!
//! # Core Concepts
//!
//! - [`AtmContext`]: shared store, cache, verifier and detector settings
//! - [`Run`]: one run's step loop; every step either integrates, rolls back
//!   to a known-good snapshot and branches, or suspends with one question
//! - [`RecoveryController`]: the `Active → RolledBack → Branched → Active`
//!   state machine with its `ClarificationNeeded` exit
//! - [`Planner`] / [`Executor`] / [`ToolRunner`]: the external collaborators
//!
//! # Example
//!
//! ```rust,ignore
//! use atm_core::{AtmConfig, AtmContext, StepOutcome};
//!
//! let ctx = AtmContext::open("/var/lib/atm", AtmConfig::load("atm.toml")?)?;
//! let mut run = ctx.start_run(initial, planner, executor, tools)?;
//! loop {
//!     match run.step().await? {
//!         StepOutcome::ClarificationNeeded { request, .. } => ask(&request.question),
//!         StepOutcome::BudgetExhausted(_) => break,
//!         _ => {}
//!     }
//! }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod config;
mod context;
mod error;
mod external;
mod recovery;
mod run;
pub mod telemetry;

pub use config::{AtmConfig, LoggingConfig, RecoveryConfig, RunConfig};
pub use context::AtmContext;
pub use error::{AtmError, AtmResult};
pub use external::{
    CallTrace, ExecutionResult, Executor, Plan, Planner, ToolFailure, ToolGateway, ToolOutput,
    ToolResponse, ToolRunner,
};
pub use recovery::{
    allowed_transitions, validate_transition, ClarificationRequest, Directive, Perturbation,
    RecoveryCause, RecoveryController, RecoveryState,
};
pub use run::{BudgetKind, ClarificationAnswer, Run, StepOutcome, USER_CLARIFICATION};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
