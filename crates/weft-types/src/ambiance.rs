//! Execution context chain.
//!
//! An `Ambiance` is the ordered stack of levels (pipeline -> stage ->
//! step-group -> step) addressing one runtime node execution. It is the
//! correlation key for execution records and continuation callbacks, and is
//! carried as bytes inside persisted callbacks so resumption after a restart
//! needs nothing but the record store.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::plan::{StepCategory, StepType};

// ---------------------------------------------------------------------------
// Level
// ---------------------------------------------------------------------------

/// One entry in the execution context chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    /// Compiled plan node id.
    pub setup_id: String,
    /// Node execution record id for this instantiation.
    pub runtime_id: Uuid,
    pub identifier: String,
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default)]
    pub retry_index: u32,
    pub start_ts: DateTime<Utc>,
}

impl Level {
    pub fn new(
        setup_id: impl Into<String>,
        runtime_id: Uuid,
        identifier: impl Into<String>,
        step_type: StepType,
        group: Option<String>,
    ) -> Self {
        Self {
            setup_id: setup_id.into(),
            runtime_id,
            identifier: identifier.into(),
            step_type,
            group,
            retry_index: 0,
            start_ts: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Ambiance
// ---------------------------------------------------------------------------

/// Ordered nesting path of one node execution within a plan execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ambiance {
    pub plan_execution_id: Uuid,
    pub plan_id: Uuid,
    /// Free-form values inherited by every level (account, project, ...).
    #[serde(default)]
    pub setup_abstractions: HashMap<String, String>,
    #[serde(default)]
    pub levels: Vec<Level>,
}

impl Ambiance {
    /// Root ambiance of a plan execution, with no levels.
    pub fn new(plan_execution_id: Uuid, plan_id: Uuid) -> Self {
        Self {
            plan_execution_id,
            plan_id,
            setup_abstractions: HashMap::new(),
            levels: Vec::new(),
        }
    }

    pub fn with_abstraction(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.setup_abstractions.insert(key.into(), value.into());
        self
    }

    /// Copy of this chain with `level` appended.
    pub fn clone_for_child(&self, level: Level) -> Self {
        let mut cloned = self.clone();
        cloned.levels.push(level);
        cloned
    }

    /// Copy of this chain with the last level dropped: the parent's view.
    pub fn clone_for_finish(&self) -> Self {
        let keep = self.levels.len().saturating_sub(1);
        self.truncated(keep)
    }

    /// Copy of this chain keeping only the first `levels_to_keep` levels.
    pub fn truncated(&self, levels_to_keep: usize) -> Self {
        let mut cloned = self.clone();
        cloned.levels.truncate(levels_to_keep);
        cloned
    }

    /// Copy of this chain addressing a retry of the current level: the last
    /// level gets a new runtime id, a fresh start time and the next retry
    /// index. Returns `None` for a root ambiance.
    pub fn clone_for_retry(&self, new_runtime_id: Uuid) -> Option<Self> {
        let mut cloned = self.clone();
        let last = cloned.levels.last_mut()?;
        last.runtime_id = new_runtime_id;
        last.retry_index += 1;
        last.start_ts = Utc::now();
        Some(cloned)
    }

    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    pub fn current_runtime_id(&self) -> Option<Uuid> {
        self.current_level().map(|l| l.runtime_id)
    }

    pub fn current_setup_id(&self) -> Option<&str> {
        self.current_level().map(|l| l.setup_id.as_str())
    }

    pub fn step_identifier(&self) -> Option<&str> {
        self.current_level().map(|l| l.identifier.as_str())
    }

    pub fn current_step_type(&self) -> Option<&StepType> {
        self.current_level().map(|l| &l.step_type)
    }

    pub fn current_group(&self) -> Option<&str> {
        self.current_level().and_then(|l| l.group.as_deref())
    }

    /// Dotted identifier path, e.g. `pipeline.stages.build.steps.compile`.
    pub fn fqn(&self) -> String {
        self.levels
            .iter()
            .map(|l| l.identifier.as_str())
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Nearest enclosing stage level, if any.
    pub fn stage_level(&self) -> Option<&Level> {
        self.levels
            .iter()
            .rev()
            .find(|l| l.step_type.category == StepCategory::Stage)
    }

    /// Whether `other` is nested at or below this chain (runtime ids match
    /// level by level).
    pub fn is_prefix_of(&self, other: &Ambiance) -> bool {
        self.plan_execution_id == other.plan_execution_id
            && self.levels.len() <= other.levels.len()
            && self
                .levels
                .iter()
                .zip(other.levels.iter())
                .all(|(a, b)| a.runtime_id == b.runtime_id)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
