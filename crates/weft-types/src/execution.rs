//! Node execution records, statuses and step outcomes.
//!
//! `NodeExecution` is the mutable, persisted runtime instance of one compiled
//! `PlanNode`. Every change goes through `NodeExecution::try_apply` with an
//! `UpdatePredicate`; repositories perform that call atomically so the
//! predicate/update pair is the only mutual exclusion the engine relies on.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::advise::AdviserResponse;
use crate::ambiance::Ambiance;
use crate::interrupt::InterruptEffect;
use crate::plan::ExecutionMode;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a node or plan execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Queued,
    Running,
    AsyncWaiting,
    TaskWaiting,
    InterventionWaiting,
    Succeeded,
    Failed,
    Expired,
    Aborted,
    Skipped,
    ApprovalRejected,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Succeeded
                | Status::Failed
                | Status::Expired
                | Status::Aborted
                | Status::Skipped
                | Status::ApprovalRejected
        )
    }

    /// Terminal statuses that count as success for propagation.
    pub fn is_positive(self) -> bool {
        matches!(self, Status::Succeeded | Status::Skipped)
    }

    /// Terminal statuses that count as failure for propagation.
    pub fn is_broken(self) -> bool {
        matches!(
            self,
            Status::Failed | Status::Expired | Status::Aborted | Status::ApprovalRejected
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Queued => "QUEUED",
            Status::Running => "RUNNING",
            Status::AsyncWaiting => "ASYNC_WAITING",
            Status::TaskWaiting => "TASK_WAITING",
            Status::InterventionWaiting => "INTERVENTION_WAITING",
            Status::Succeeded => "SUCCEEDED",
            Status::Failed => "FAILED",
            Status::Expired => "EXPIRED",
            Status::Aborted => "ABORTED",
            Status::Skipped => "SKIPPED",
            Status::ApprovalRejected => "APPROVAL_REJECTED",
        }
    }

    pub fn non_terminal() -> &'static [Status] {
        &[
            Status::Queued,
            Status::Running,
            Status::AsyncWaiting,
            Status::TaskWaiting,
            Status::InterventionWaiting,
        ]
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reduce child statuses into one parent status.
///
/// Priority: ABORTED > EXPIRED > FAILED > APPROVAL_REJECTED > SUCCEEDED.
/// All-SKIPPED (and empty) reduces to SKIPPED / SUCCEEDED respectively; any
/// non-terminal child keeps the parent RUNNING.
pub fn calculate_status(statuses: &[Status]) -> Status {
    if statuses.is_empty() {
        return Status::Succeeded;
    }
    if statuses.iter().any(|s| !s.is_terminal()) {
        return Status::Running;
    }
    for candidate in [
        Status::Aborted,
        Status::Expired,
        Status::Failed,
        Status::ApprovalRejected,
    ] {
        if statuses.contains(&candidate) {
            return candidate;
        }
    }
    if statuses.iter().all(|s| *s == Status::Skipped) {
        Status::Skipped
    } else {
        Status::Succeeded
    }
}

// ---------------------------------------------------------------------------
// Failures and step responses
// ---------------------------------------------------------------------------

/// Machine-checkable failure category, matched by failure strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    Unexpected,
    Connectivity,
    Authentication,
    Authorization,
    Validation,
    Timeout,
    ApprovalRejection,
    UserMarkedFailure,
    TaskDispatch,
}

/// Human message plus failure categories attached to a broken outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub message: String,
    #[serde(default)]
    pub failure_types: Vec<FailureType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl FailureInfo {
    pub fn new(message: impl Into<String>, failure_types: Vec<FailureType>) -> Self {
        Self {
            message: message.into(),
            failure_types,
            details: None,
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(message, vec![FailureType::Unexpected])
    }

    pub fn has_type(&self, failure_type: FailureType) -> bool {
        self.failure_types.contains(&failure_type)
    }
}

/// Outcome of running a step, produced by strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<serde_json::Value>,
}

impl StepResponse {
    pub fn succeeded() -> Self {
        Self {
            status: Status::Succeeded,
            failure_info: None,
            outcome: None,
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: Status::Skipped,
            failure_info: None,
            outcome: None,
        }
    }

    pub fn failed(failure_info: FailureInfo) -> Self {
        Self::broken(Status::Failed, failure_info)
    }

    pub fn broken(status: Status, failure_info: FailureInfo) -> Self {
        Self {
            status,
            failure_info: Some(failure_info),
            outcome: None,
        }
    }

    pub fn with_outcome(mut self, outcome: serde_json::Value) -> Self {
        self.outcome = Some(outcome);
        self
    }
}

// ---------------------------------------------------------------------------
// Executable responses
// ---------------------------------------------------------------------------

/// A spawned child recorded in a CHILDREN response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildEntry {
    pub node_id: String,
    pub runtime_id: Uuid,
}

/// One start/resume cycle of a node, tagged by protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutableResponse {
    Sync {
        #[serde(default)]
        log_keys: Vec<String>,
    },
    Async {
        callback_ids: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
        #[serde(default)]
        log_keys: Vec<String>,
    },
    AsyncChain {
        callback_id: String,
        link_index: u32,
        #[serde(default)]
        chain_end: bool,
        #[serde(default)]
        pass_through: serde_json::Value,
    },
    Children {
        children: Vec<ChildEntry>,
    },
    ChildChain {
        child_node_id: String,
        runtime_id: Uuid,
        #[serde(default)]
        last_link: bool,
        #[serde(default)]
        pass_through: serde_json::Value,
    },
    Task {
        task_id: String,
        category: String,
        #[serde(default)]
        log_keys: Vec<String>,
    },
    Skip {
        message: String,
    },
}

impl ExecutableResponse {
    /// Correlation ids this response is still waiting on.
    pub fn correlation_ids(&self) -> Vec<String> {
        match self {
            ExecutableResponse::Async { callback_ids, .. } => callback_ids.clone(),
            ExecutableResponse::AsyncChain { callback_id, .. } => vec![callback_id.clone()],
            ExecutableResponse::Children { children } => {
                children.iter().map(|c| c.runtime_id.to_string()).collect()
            }
            ExecutableResponse::ChildChain { runtime_id, .. } => vec![runtime_id.to_string()],
            ExecutableResponse::Task { task_id, .. } => vec![task_id.clone()],
            ExecutableResponse::Sync { .. } | ExecutableResponse::Skip { .. } => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// NodeExecution
// ---------------------------------------------------------------------------

/// Runtime instance of one compiled plan node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: Uuid,
    pub plan_execution_id: Uuid,
    pub node_id: String,
    pub identifier: String,
    pub execution_mode: ExecutionMode,
    pub ambiance: Ambiance,
    pub status: Status,
    #[serde(default)]
    pub executable_responses: Vec<ExecutableResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<serde_json::Value>,
    #[serde(default)]
    pub interrupt_history: Vec<InterruptEffect>,
    /// Ids of prior attempts this record supersedes, oldest first.
    #[serde(default)]
    pub retry_ids: Vec<Uuid>,
    /// Set once a retry of this record has been created.
    #[serde(default)]
    pub old_retry: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retried_by: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_id: Option<Uuid>,
    /// Correlation id the enclosing parent waits on; inherited along a
    /// chain of advanced siblings. `None` for the plan's root node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_id: Option<String>,
    /// Record whose failure started the rollback chain this record is in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_of: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adviser_response: Option<AdviserResponse>,
    /// Claimed terminal outcome awaiting the adviser.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_outcome: Option<StepResponse>,
    /// Terminal status the record would have had before it was parked in
    /// INTERVENTION_WAITING.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intervention_prior_status: Option<Status>,
    #[serde(default)]
    pub timeout_instance_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_inputs: Option<serde_json::Value>,
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ts: Option<DateTime<Utc>>,
}

impl NodeExecution {
    /// New QUEUED record addressed by the last level of `ambiance`.
    pub fn queued(
        id: Uuid,
        ambiance: Ambiance,
        node_id: impl Into<String>,
        identifier: impl Into<String>,
        execution_mode: ExecutionMode,
    ) -> Self {
        Self {
            id,
            plan_execution_id: ambiance.plan_execution_id,
            node_id: node_id.into(),
            identifier: identifier.into(),
            execution_mode,
            ambiance,
            status: Status::Queued,
            executable_responses: Vec::new(),
            failure_info: None,
            outcome: None,
            interrupt_history: Vec::new(),
            retry_ids: Vec::new(),
            old_retry: false,
            retried_by: None,
            parent_id: None,
            previous_id: None,
            next_id: None,
            notify_id: None,
            rollback_of: None,
            adviser_response: None,
            pending_outcome: None,
            intervention_prior_status: None,
            timeout_instance_ids: Vec::new(),
            resolved_inputs: None,
            version: 0,
            created_at: Utc::now(),
            start_ts: None,
            end_ts: None,
        }
    }

    pub fn last_executable_response(&self) -> Option<&ExecutableResponse> {
        self.executable_responses.last()
    }

    /// Outstanding external task id, if the last cycle dispatched a task.
    pub fn outstanding_task_id(&self) -> Option<&str> {
        match self.last_executable_response() {
            Some(ExecutableResponse::Task { task_id, .. }) => Some(task_id.as_str()),
            _ => None,
        }
    }

    /// Whether the record is waiting on external work that must be
    /// cooperatively cancelled before an interrupt may finalize it.
    pub fn holds_external_work(&self) -> bool {
        !self.status.is_terminal()
            && self.execution_mode.awaits_external_work()
            && self
                .last_executable_response()
                .is_some_and(|r| !r.correlation_ids().is_empty())
    }

    /// Attempt a conditional update. Returns `false` without touching the
    /// record when the predicate fails or the update would move a terminal
    /// status.
    pub fn try_apply(&mut self, predicate: &UpdatePredicate, update: &NodeExecutionUpdate) -> bool {
        if !predicate.matches(self) {
            return false;
        }
        if let Some(status) = update.status
            && self.status.is_terminal()
            && status != self.status
        {
            return false;
        }
        update.apply(self);
        self.version += 1;
        true
    }
}

// ---------------------------------------------------------------------------
// Conditional updates
// ---------------------------------------------------------------------------

/// Condition a record must satisfy for an update to be applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdatePredicate {
    pub statuses: Option<Vec<Status>>,
    pub non_terminal: bool,
    pub no_pending_outcome: bool,
    pub pending_outcome: bool,
    pub not_retried: bool,
}

impl UpdatePredicate {
    /// Matches every record.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn non_terminal() -> Self {
        Self {
            non_terminal: true,
            ..Self::default()
        }
    }

    pub fn in_statuses(statuses: &[Status]) -> Self {
        Self {
            statuses: Some(statuses.to_vec()),
            ..Self::default()
        }
    }

    pub fn without_pending_outcome(mut self) -> Self {
        self.no_pending_outcome = true;
        self
    }

    pub fn with_pending_outcome(mut self) -> Self {
        self.pending_outcome = true;
        self
    }

    pub fn not_retried(mut self) -> Self {
        self.not_retried = true;
        self
    }

    pub fn matches(&self, record: &NodeExecution) -> bool {
        if let Some(statuses) = &self.statuses
            && !statuses.contains(&record.status)
        {
            return false;
        }
        if self.non_terminal && record.status.is_terminal() {
            return false;
        }
        if self.no_pending_outcome && record.pending_outcome.is_some() {
            return false;
        }
        if self.pending_outcome && record.pending_outcome.is_none() {
            return false;
        }
        if self.not_retried && record.old_retry {
            return false;
        }
        true
    }
}

/// Field-level changes applied by a conditional update. `None` leaves a
/// field untouched; the `push_*` fields append.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeExecutionUpdate {
    pub status: Option<Status>,
    pub push_executable_responses: Vec<ExecutableResponse>,
    pub failure_info: Option<FailureInfo>,
    pub outcome: Option<serde_json::Value>,
    pub push_interrupt_effect: Option<InterruptEffect>,
    pub old_retry: Option<bool>,
    pub retried_by: Option<Uuid>,
    pub next_id: Option<Uuid>,
    pub adviser_response: Option<AdviserResponse>,
    /// `Some(None)` clears the pending outcome.
    pub pending_outcome: Option<Option<StepResponse>>,
    /// `Some(None)` clears the remembered prior status.
    pub intervention_prior_status: Option<Option<Status>>,
    pub push_timeout_instance_ids: Vec<String>,
    pub resolved_inputs: Option<serde_json::Value>,
    pub start_ts: Option<DateTime<Utc>>,
    pub end_ts: Option<DateTime<Utc>>,
}

impl NodeExecutionUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn push_response(mut self, response: ExecutableResponse) -> Self {
        self.push_executable_responses.push(response);
        self
    }

    pub fn failure_info(mut self, info: FailureInfo) -> Self {
        self.failure_info = Some(info);
        self
    }

    pub fn outcome(mut self, outcome: serde_json::Value) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn push_interrupt_effect(mut self, effect: InterruptEffect) -> Self {
        self.push_interrupt_effect = Some(effect);
        self
    }

    pub fn retried_by(mut self, new_id: Uuid) -> Self {
        self.old_retry = Some(true);
        self.retried_by = Some(new_id);
        self
    }

    pub fn next_id(mut self, next_id: Uuid) -> Self {
        self.next_id = Some(next_id);
        self
    }

    pub fn adviser_response(mut self, response: AdviserResponse) -> Self {
        self.adviser_response = Some(response);
        self
    }

    pub fn pending_outcome(mut self, outcome: Option<StepResponse>) -> Self {
        self.pending_outcome = Some(outcome);
        self
    }

    pub fn intervention_prior_status(mut self, status: Option<Status>) -> Self {
        self.intervention_prior_status = Some(status);
        self
    }

    pub fn push_timeout_instance(mut self, id: impl Into<String>) -> Self {
        self.push_timeout_instance_ids.push(id.into());
        self
    }

    pub fn resolved_inputs(mut self, inputs: serde_json::Value) -> Self {
        self.resolved_inputs = Some(inputs);
        self
    }

    pub fn started_now(mut self) -> Self {
        self.start_ts = Some(Utc::now());
        self
    }

    pub fn ended_now(mut self) -> Self {
        self.end_ts = Some(Utc::now());
        self
    }

    /// Copy the status, failure info and outcome of a step response.
    pub fn concluding(mut self, response: &StepResponse) -> Self {
        self.status = Some(response.status);
        self.failure_info = response.failure_info.clone();
        self.outcome = response.outcome.clone();
        self
    }

    fn apply(&self, record: &mut NodeExecution) {
        if let Some(status) = self.status {
            record.status = status;
        }
        record
            .executable_responses
            .extend(self.push_executable_responses.iter().cloned());
        if let Some(info) = &self.failure_info {
            record.failure_info = Some(info.clone());
        }
        if let Some(outcome) = &self.outcome {
            record.outcome = Some(outcome.clone());
        }
        if let Some(effect) = &self.push_interrupt_effect {
            record.interrupt_history.push(effect.clone());
        }
        if let Some(old_retry) = self.old_retry {
            record.old_retry = old_retry;
        }
        if let Some(retried_by) = self.retried_by {
            record.retried_by = Some(retried_by);
        }
        if let Some(next_id) = self.next_id {
            record.next_id = Some(next_id);
        }
        if let Some(resp) = &self.adviser_response {
            record.adviser_response = Some(resp.clone());
        }
        if let Some(pending) = &self.pending_outcome {
            record.pending_outcome = pending.clone();
        }
        if let Some(prior) = self.intervention_prior_status {
            record.intervention_prior_status = prior;
        }
        record
            .timeout_instance_ids
            .extend(self.push_timeout_instance_ids.iter().cloned());
        if let Some(inputs) = &self.resolved_inputs {
            record.resolved_inputs = Some(inputs.clone());
        }
        if let Some(ts) = self.start_ts {
            record.start_ts = Some(ts);
        }
        if let Some(ts) = self.end_ts {
            record.end_ts = Some(ts);
        }
    }
}

// ---------------------------------------------------------------------------
// PlanExecution and input instances
// ---------------------------------------------------------------------------

/// One run of a compiled plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanExecution {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub status: Status,
    pub ambiance: Ambiance,
    pub start_ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ts: Option<DateTime<Utc>>,
}

/// Input document stored per node execution; cloned forward on retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputInstance {
    pub id: Uuid,
    pub node_execution_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default)]
    pub values: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl InputInstance {
    pub fn new(node_execution_id: Uuid, values: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            node_execution_id,
            template: None,
            values,
            created_at: Utc::now(),
        }
    }

    /// Copy of this instance re-pointed to another node execution.
    pub fn clone_for(&self, node_execution_id: Uuid) -> Self {
        Self {
            id: Uuid::now_v7(),
            node_execution_id,
            template: self.template.clone(),
            values: self.values.clone(),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
