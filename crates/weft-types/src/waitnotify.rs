//! Continuation (wait/notify) records.
//!
//! A `WaitInstance` durably associates a set of correlation ids with a
//! callback descriptor. Callbacks are plain data so that they survive a
//! process restart; the engine interprets them when the wait fires.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::interrupt::InterruptKind;
use crate::plan::ExecutionMode;

/// Serialized continuation to run when a wait fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyCallback {
    /// Resume the strategy of a node execution with the collected results.
    Resume {
        node_execution_id: Uuid,
        /// `Ambiance::to_bytes` of the target record.
        ambiance: Vec<u8>,
        /// Step parameters of the target node.
        step_parameters: Vec<u8>,
        mode: ExecutionMode,
    },
    /// Individual per-id wake-up; carries no resumption.
    Progress {
        node_execution_id: Uuid,
        correlation_id: String,
    },
    /// Finalize an interrupt once the executor acknowledged cancellation.
    InterruptFinalize {
        node_execution_id: Uuid,
        interrupt_id: Uuid,
        kind: InterruptKind,
    },
}

impl NotifyCallback {
    pub fn node_execution_id(&self) -> Uuid {
        match self {
            NotifyCallback::Resume {
                node_execution_id, ..
            }
            | NotifyCallback::Progress {
                node_execution_id, ..
            }
            | NotifyCallback::InterruptFinalize {
                node_execution_id, ..
            } => *node_execution_id,
        }
    }
}

/// Durable association of correlation ids with a callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitInstance {
    pub id: Uuid,
    pub correlation_ids: Vec<String>,
    pub callback: NotifyCallback,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_callback: Option<NotifyCallback>,
    /// Informational only; expiry is enforced by the timeout tracker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub fired: bool,
}

impl WaitInstance {
    pub fn new(correlation_ids: Vec<String>, callback: NotifyCallback) -> Self {
        Self {
            id: Uuid::now_v7(),
            correlation_ids,
            callback,
            progress_callback: None,
            timeout_ms: None,
            created_at: Utc::now(),
            fired: false,
        }
    }

    pub fn with_progress(mut self, callback: NotifyCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    pub fn with_timeout(mut self, timeout_ms: Option<u64>) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Whether every correlation id appears in `satisfied`.
    pub fn is_satisfied_by(&self, satisfied: &HashSet<String>) -> bool {
        self.correlation_ids.iter().all(|id| satisfied.contains(id))
    }
}

/// Result delivered for one correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyResponse {
    pub correlation_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Delivered as an error result.
    #[serde(default)]
    pub error: bool,
    pub created_at: DateTime<Utc>,
}

impl NotifyResponse {
    pub fn new(correlation_id: impl Into<String>, payload: serde_json::Value, error: bool) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            payload,
            error,
            created_at: Utc::now(),
        }
    }
}

/// Aggregated id -> result map handed to a fired callback.
pub type ResponseMap = HashMap<String, NotifyResponse>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn satisfied_only_when_all_ids_present() {
        let wait = WaitInstance::new(
            vec!["a".to_string(), "b".to_string()],
            NotifyCallback::Progress {
                node_execution_id: Uuid::now_v7(),
                correlation_id: "a".to_string(),
            },
        );
        let mut satisfied = HashSet::new();
        satisfied.insert("a".to_string());
        assert!(!wait.is_satisfied_by(&satisfied));
        satisfied.insert("b".to_string());
        assert!(wait.is_satisfied_by(&satisfied));
    }

    #[test]
    fn callback_serializes_with_type_tag() {
        let id = Uuid::now_v7();
        let cb = NotifyCallback::InterruptFinalize {
            node_execution_id: id,
            interrupt_id: Uuid::now_v7(),
            kind: InterruptKind::Abort,
        };
        let json = serde_json::to_value(&cb).unwrap();
        assert_eq!(json["type"], "interrupt_finalize");
        assert_eq!(cb.node_execution_id(), id);
    }
}
