//! Adviser decisions.
//!
//! An adviser is consulted exactly once per terminal transition of a node
//! execution; its `AdviserResponse` is recorded on the record before the
//! engine acts on it.

use serde::{Deserialize, Serialize};

/// Scope a rollback applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RollbackStrategy {
    Stage,
    StepGroup,
}

/// What the engine should do after a node execution concludes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdviserResponse {
    /// Start the given sibling node next.
    Advance { next_node_id: String },
    /// Retry the node after the wait interval.
    Retry {
        wait_interval_ms: u64,
        /// Zero-based index of the retry about to be made.
        retry_index: u32,
    },
    /// Run the rollback node for the given scope.
    Rollback {
        rollback_node_id: String,
        strategy: RollbackStrategy,
    },
    /// Park the node until an operator intervenes (retry, mark, abort).
    WaitIntervention {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    /// Treat the failure as success for propagation, optionally advancing.
    Ignore {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_node_id: Option<String>,
    },
    /// Conclude the node as succeeded, optionally advancing.
    MarkSuccess {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_node_id: Option<String>,
    },
    /// Conclude the node as failed and stop advancing.
    MarkFailure,
}

impl AdviserResponse {
    pub fn decision_name(&self) -> &'static str {
        match self {
            AdviserResponse::Advance { .. } => "ADVANCE",
            AdviserResponse::Retry { .. } => "RETRY",
            AdviserResponse::Rollback { .. } => "ROLLBACK",
            AdviserResponse::WaitIntervention { .. } => "WAIT_INTERVENTION",
            AdviserResponse::Ignore { .. } => "IGNORE",
            AdviserResponse::MarkSuccess { .. } => "MARK_SUCCESS",
            AdviserResponse::MarkFailure => "MARK_FAILURE",
        }
    }
}
