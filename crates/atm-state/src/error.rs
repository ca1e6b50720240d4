//! Error types for the state model

use crate::hash::{ContentHash, HashError};
use crate::ids::ToolCallId;
use crate::state::Fact;

/// Errors raised while building or decoding states
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// A fact cites an output digest that no tool call produced
    #[error("fact '{subject} {predicate}' has no valid source: {source_digest}")]
    SourcelessFact {
        subject: String,
        predicate: String,
        source_digest: ContentHash,
    },

    /// A tool call id is already in the ledger
    #[error("tool call {0} already recorded")]
    DuplicateToolCall(ToolCallId),

    /// State bytes failed to decode
    #[error("state decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    /// Digest computation failed
    #[error("digest error: {0}")]
    Hash(#[from] HashError),
}

impl StateError {
    pub(crate) fn sourceless(fact: &Fact) -> Self {
        Self::SourcelessFact {
            subject: fact.subject.clone(),
            predicate: fact.predicate.clone(),
            source_digest: fact.source_digest,
        }
    }
}
