//! Orchestration events.
//!
//! `OrchestrationEvent` is broadcast on the engine's event bus. Executors
//! subscribe to `AbortRequested` / `ExpireRequested` to cancel their work and
//! acknowledge through the continuation registry; operator tooling follows
//! node lifecycle events.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::Status;
use crate::interrupt::{InterruptKind, InterruptState};

/// Events emitted while plan executions progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    /// A node execution record was created.
    NodeQueued {
        plan_execution_id: Uuid,
        node_execution_id: Uuid,
        node_id: String,
    },

    /// A node execution changed status.
    NodeStatusChanged {
        plan_execution_id: Uuid,
        node_execution_id: Uuid,
        status: Status,
    },

    /// One correlation id of a multi-id wait was satisfied.
    CallbackProgress {
        node_execution_id: Uuid,
        correlation_id: String,
    },

    /// A task was handed to the task queue.
    TaskEnqueued {
        node_execution_id: Uuid,
        task_id: String,
        category: String,
    },

    /// The owning executor should stop the work of a node and acknowledge
    /// by delivering `ack_correlation_id`.
    AbortRequested {
        node_execution_id: Uuid,
        ack_correlation_id: String,
    },

    /// Same as `AbortRequested`, for a timeout.
    ExpireRequested {
        node_execution_id: Uuid,
        ack_correlation_id: String,
    },

    /// A plan execution reached a terminal status.
    PlanExecutionEnded {
        plan_execution_id: Uuid,
        status: Status,
    },

    /// An interrupt finished processing.
    InterruptProcessed {
        interrupt_id: Uuid,
        kind: InterruptKind,
        state: InterruptState,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_snake_case_tag() {
        let event = OrchestrationEvent::AbortRequested {
            node_execution_id: Uuid::now_v7(),
            ack_correlation_id: "ack".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "abort_requested");
    }
}
