//! Step handlers: the per-step-type business logic behind each strategy.
//!
//! A handler is registered per step type in the [`StepRegistry`] under one
//! of six protocol traits. Handlers return `anyhow::Result`; errors and
//! panics are converted into failure outcomes at the strategy boundary.

pub mod handler;
pub mod registry;
pub mod section;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use weft_types::ambiance::Ambiance;
use weft_types::execution::{FailureInfo, Status};
use weft_types::plan::StepType;

pub use handler::{
    AsyncChainExecutable, AsyncExecutable, ChildChainExecutable, ChildrenExecutable,
    SyncExecutable, TaskExecutable,
};
pub use registry::{StepError, StepHandler, StepRegistry};

/// What a handler sees of the node execution it runs for.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub node_execution_id: Uuid,
    pub ambiance: Ambiance,
    pub step_type: StepType,
    pub identifier: String,
    /// Resolved input instance values, if any.
    pub inputs: Option<serde_json::Value>,
}

impl StepContext {
    pub fn retry_index(&self) -> u32 {
        self.ambiance
            .current_level()
            .map(|l| l.retry_index)
            .unwrap_or(0)
    }
}

/// Result of an async start: the callback ids to wait on.
#[derive(Debug, Clone, Default)]
pub struct AsyncStart {
    pub callback_ids: Vec<String>,
    pub timeout_ms: Option<u64>,
    pub log_keys: Vec<String>,
}

/// One link of an async chain.
#[derive(Debug, Clone)]
pub struct ChainLink {
    pub callback_id: String,
    /// When set, the next resume finalizes instead of starting a new link.
    pub chain_end: bool,
    /// State carried to the next resume.
    pub pass_through: serde_json::Value,
}

/// Next child of a child chain.
#[derive(Debug, Clone)]
pub struct ChildLink {
    pub child_node_id: String,
    pub last_link: bool,
    pub pass_through: serde_json::Value,
}

/// What a child chain does after one child concluded.
#[derive(Debug, Clone)]
pub enum ChildChainDecision {
    Next(ChildLink),
    Finish(weft_types::execution::StepResponse),
}

/// What a task step asks the engine to do.
#[derive(Debug, Clone)]
pub enum TaskRequest {
    /// Complete immediately without dispatching, recording `message`.
    Skip { message: String },
    Dispatch(weft_types::task::TaskDescriptor),
}

/// Concluded child as delivered to its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildOutcome {
    pub node_execution_id: Uuid,
    pub node_id: String,
    pub identifier: String,
    /// Effective status for propagation (ignored failures count as success).
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<serde_json::Value>,
}
