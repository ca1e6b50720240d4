//! Error types for the run loop
//!
//! Storage I/O and integrity failures escalate to the caller. Constraint
//! violations, loop triggers and clarification requests are absorbed by the
//! recovery controller and only appear here when a caller asks for them as
//! errors (see [`StepOutcome::into_result`](crate::StepOutcome::into_result)).

use crate::recovery::RecoveryState;
use atm_memo::CacheError;
use atm_state::StateError;
use atm_store::StoreError;

/// Main ATM error type
#[derive(Debug, thiserror::Error)]
pub enum AtmError {
    /// Disk or transport failure
    #[error("storage io failure: {0}")]
    StorageIo(#[source] StoreError),

    /// Stored data does not reproduce its digest
    #[error("integrity failure: {0}")]
    HashMismatch(#[source] StoreError),

    /// Missing digest or snapshot, or a snapshot of another run
    #[error("not found: {0}")]
    NotFound(#[source] StoreError),

    /// Result violated locked constraints
    #[error("constraint violation: {}", .reasons.join("; "))]
    ConstraintViolation { reasons: Vec<String> },

    /// Loop, stall or repeated failure detected
    #[error("loop detected: {}", .reasons.join("; "))]
    LoopTrigger { reasons: Vec<String> },

    /// Run is suspended until the question is answered
    #[error("clarification required: {question}")]
    ClarificationRequired { question: String },

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Planner, executor or tool failure
    #[error("collaborator failed: {0:#}")]
    Collaborator(anyhow::Error),

    /// Recovery state machine misuse
    #[error("invalid recovery transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: RecoveryState,
        to: RecoveryState,
    },

    /// Memoization cache failure
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// State model rejected an operation
    #[error("state error: {0}")]
    State(#[from] StateError),
}

impl From<StoreError> for AtmError {
    fn from(e: StoreError) -> Self {
        if e.is_integrity() {
            Self::HashMismatch(e)
        } else if e.is_not_found() || matches!(e, StoreError::ForeignSnapshot { .. }) {
            Self::NotFound(e)
        } else {
            Self::StorageIo(e)
        }
    }
}

impl AtmError {
    /// Escalates to the run's caller
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::StorageIo(_)
            | Self::HashMismatch(_)
            | Self::NotFound(_)
            | Self::Config(_)
            | Self::Collaborator(_)
            | Self::InvalidTransition { .. }
            | Self::State(_) => true,
            Self::Cache(e) => e.store_error().is_some(),
            Self::ConstraintViolation { .. }
            | Self::LoopTrigger { .. }
            | Self::ClarificationRequired { .. } => false,
        }
    }

    /// Handled locally by rollback, branching or suspension
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConstraintViolation { .. }
                | Self::LoopTrigger { .. }
                | Self::ClarificationRequired { .. }
        )
    }

    /// Integrity violation
    #[inline]
    #[must_use]
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::HashMismatch(_))
    }
}

/// Result alias for run operations
pub type AtmResult<T> = Result<T, AtmError>;
