//! Delegated task descriptors.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Work handed to an external executor through the task queue. The task
/// id returned by the queue is the correlation id its result is delivered
/// under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub node_execution_id: Uuid,
    pub category: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub log_keys: Vec<String>,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl TaskDescriptor {
    pub fn new(category: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            node_execution_id: Uuid::nil(),
            category: category.into(),
            capabilities: Vec::new(),
            log_keys: Vec::new(),
            parameters,
            timeout_ms: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_log_keys(mut self, log_keys: Vec<String>) -> Self {
        self.log_keys = log_keys;
        self
    }
}
