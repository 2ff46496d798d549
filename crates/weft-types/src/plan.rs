//! Compiled plan types.
//!
//! A `Plan` is the static graph produced by the plan compiler: a map of
//! immutable `PlanNode`s keyed by setup id (the definition node's `__uuid`)
//! plus the node the engine starts from. Nodes reference each other only by
//! id -- children through their step parameters, siblings through adviser
//! obtainments.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Step type
// ---------------------------------------------------------------------------

/// Where a node sits in the pipeline hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCategory {
    Pipeline,
    Stage,
    StepGroup,
    Fork,
    Step,
}

/// Declared step type of a node: the handler key plus its category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepType {
    /// Handler key in the step registry (e.g. "ShellScript", "SECTION_CHAIN").
    #[serde(rename = "type")]
    pub step_type: String,
    pub category: StepCategory,
}

impl StepType {
    pub fn new(step_type: impl Into<String>, category: StepCategory) -> Self {
        Self {
            step_type: step_type.into(),
            category,
        }
    }
}

// ---------------------------------------------------------------------------
// Execution mode
// ---------------------------------------------------------------------------

/// Concurrency protocol a node is executed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    /// Work happens in-line; `start` yields the terminal outcome.
    Sync,
    /// One start, one aggregate resume once every callback id is satisfied.
    Async,
    /// Repeated resume, one per link, until the chain signals its end.
    AsyncChain,
    /// Fan-out to child nodes; resume once all children are terminal.
    Children,
    /// Children run one after another; resume after each.
    ChildChain,
    /// Work delegated to an external executor through the task queue.
    Task,
}

impl ExecutionMode {
    /// Modes whose work is other plan nodes rather than external work.
    pub fn is_parent(self) -> bool {
        matches!(self, ExecutionMode::Children | ExecutionMode::ChildChain)
    }

    /// Modes that can hold outstanding external work (callbacks or tasks).
    pub fn awaits_external_work(self) -> bool {
        matches!(
            self,
            ExecutionMode::Async | ExecutionMode::AsyncChain | ExecutionMode::Task
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Sync => "SYNC",
            ExecutionMode::Async => "ASYNC",
            ExecutionMode::AsyncChain => "ASYNC_CHAIN",
            ExecutionMode::Children => "CHILDREN",
            ExecutionMode::ChildChain => "CHILD_CHAIN",
            ExecutionMode::Task => "TASK",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Adviser obtainments and timeouts
// ---------------------------------------------------------------------------

/// Binding of an adviser to a node: the adviser type key in the adviser
/// registry plus its serialized parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdviserObtainment {
    pub adviser_type: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl AdviserObtainment {
    pub fn new(adviser_type: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            adviser_type: adviser_type.into(),
            parameters,
        }
    }
}

/// Timeout attached to a node. When it elapses the node is expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSpec {
    pub duration_ms: u64,
    /// End the whole execution tree on expiry instead of running advisers.
    #[serde(default)]
    pub end_execution_on_expiry: bool,
}

// ---------------------------------------------------------------------------
// PlanNode
// ---------------------------------------------------------------------------

/// One compiled, immutable unit of planned work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    /// Setup id; equals the `__uuid` stamped on the definition node.
    pub uuid: String,
    pub identifier: String,
    pub name: String,
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub execution_mode: ExecutionMode,
    /// Opaque parameters handed to the step handler.
    #[serde(default)]
    pub step_parameters: serde_json::Value,
    #[serde(default)]
    pub adviser_obtainments: Vec<AdviserObtainment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutSpec>,
}

impl PlanNode {
    /// Child node ids listed in the step parameters of container nodes.
    pub fn child_node_ids(&self) -> Vec<String> {
        self.step_parameters
            .get("children")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// The compiled, static graph of execution nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub start_node_id: String,
    pub nodes: HashMap<String, PlanNode>,
    /// Definition tree after compiler rewrites (uuid-stamped).
    #[serde(default)]
    pub definition: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn node(&self, node_id: &str) -> Option<&PlanNode> {
        self.nodes.get(node_id)
    }

    pub fn start_node(&self) -> Option<&PlanNode> {
        self.nodes.get(&self.start_node_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn container() -> PlanNode {
        PlanNode {
            uuid: "stage-1".to_string(),
            identifier: "build".to_string(),
            name: "Build".to_string(),
            step_type: StepType::new("SECTION_CHILDREN", StepCategory::Stage),
            group: Some("STAGE".to_string()),
            execution_mode: ExecutionMode::Children,
            step_parameters: json!({ "children": ["a", "b"] }),
            adviser_obtainments: vec![],
            when_condition: None,
            skip_condition: None,
            timeout: None,
        }
    }

    #[test]
    fn child_node_ids_read_from_parameters() {
        assert_eq!(container().child_node_ids(), vec!["a", "b"]);
    }

    #[test]
    fn child_node_ids_empty_for_atomic_step() {
        let mut node = container();
        node.step_parameters = json!({ "script": "echo hi" });
        assert!(node.child_node_ids().is_empty());
    }

    #[test]
    fn execution_mode_serializes_screaming_snake() {
        let json = serde_json::to_string(&ExecutionMode::ChildChain).unwrap();
        assert_eq!(json, "\"CHILD_CHAIN\"");
        assert_eq!(ExecutionMode::AsyncChain.to_string(), "ASYNC_CHAIN");
    }

    #[test]
    fn execution_mode_classification() {
        assert!(ExecutionMode::Children.is_parent());
        assert!(!ExecutionMode::Task.is_parent());
        assert!(ExecutionMode::Task.awaits_external_work());
        assert!(!ExecutionMode::Sync.awaits_external_work());
    }

    #[test]
    fn plan_node_serde_roundtrip() {
        let node = container();
        let json = serde_json::to_string(&node).unwrap();
        let parsed: PlanNode = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, node);
    }
}
