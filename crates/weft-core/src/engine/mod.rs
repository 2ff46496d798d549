//! Orchestration engine: drives node executions through their lifecycle.
//!
//! The engine owns no threads of its own. Every transition runs on the tokio
//! runtime, triggered by a plan start, a delivered callback, a fired timer or
//! an interrupt. All state lives in the repository; mutual exclusion between
//! concurrent triggers is exclusively the repository's atomic conditional
//! update (`update_node_execution_if`).
//!
//! # Lifecycle
//!
//! 1. A QUEUED record is claimed (QUEUED -> RUNNING).
//! 2. When/skip conditions are evaluated; the node timeout is armed.
//! 3. The mode's strategy `start`s and returns an effect, which the engine
//!    applies (record the executable response, register waits, spawn
//!    children, enqueue a task).
//! 4. Fired waits `resume` the strategy until it completes.
//! 5. Conclusion: claim the outcome, consult advisers once, commit, then
//!    act on the decision (advance, retry, rollback, park, propagate).
//!
//! Spawned and recursive paths go through `*_boxed` methods returning
//! `BoxFuture<'static, _>` so the async state machines stay finite.

mod interrupt;
mod lifecycle;
mod recovery;

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;
use weft_types::ambiance::{Ambiance, Level};
use weft_types::config::EngineConfig;
use weft_types::error::RepositoryError;
use weft_types::event::OrchestrationEvent;
use weft_types::execution::{InputInstance, NodeExecution, PlanExecution, Status};
use weft_types::interrupt::{Interrupt, InterruptEffect};
use weft_types::plan::{Plan, PlanNode};

use crate::advise::AdviserRegistry;
use crate::continuation::{ContinuationError, ContinuationRegistry};
use crate::event::EventBus;
use crate::repository::OrchestrationStore;
use crate::step::StepRegistry;
use crate::strategy::StrategyRegistry;
use crate::task_queue::TaskDispatcherDyn;
use crate::timeout::TimeoutTracker;

pub use interrupt::{EXPIRE_MESSAGE, InterruptError};
pub use recovery::{LOST_ON_RESTART_MESSAGE, RecoveryReport};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors returned by the engine's public API.
///
/// Failures inside a node's execution never surface here; they become
/// failure outcomes on the node.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("continuation error: {0}")]
    Continuation(#[from] ContinuationError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unknown plan {0}")]
    UnknownPlan(Uuid),

    #[error("plan {plan_id} has no node '{node_id}'")]
    UnknownNode { plan_id: Uuid, node_id: String },

    #[error("unknown node execution {0}")]
    UnknownNodeExecution(Uuid),

    #[error("unknown plan execution {0}")]
    UnknownPlanExecution(Uuid),

    #[error("no strategy registered for mode {0}")]
    MissingStrategy(weft_types::plan::ExecutionMode),
}

// ---------------------------------------------------------------------------
// NodeLinks
// ---------------------------------------------------------------------------

/// Relations stamped on a new record at creation.
#[derive(Debug, Clone, Default)]
pub(crate) struct NodeLinks {
    pub parent_id: Option<Uuid>,
    pub previous_id: Option<Uuid>,
    pub notify_id: Option<String>,
    pub rollback_of: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// OrchestrationEngine
// ---------------------------------------------------------------------------

/// The execution engine. Shared as `Arc<OrchestrationEngine<R>>`.
pub struct OrchestrationEngine<R: OrchestrationStore> {
    repo: Arc<R>,
    continuations: ContinuationRegistry<R>,
    strategies: StrategyRegistry,
    advisers: AdviserRegistry,
    dispatcher: Arc<dyn TaskDispatcherDyn>,
    timeouts: TimeoutTracker,
    event_bus: EventBus,
    config: EngineConfig,
    plans: DashMap<Uuid, Arc<Plan>>,
}

impl<R: OrchestrationStore> OrchestrationEngine<R> {
    /// Engine with the standard strategies and built-in advisers.
    pub fn new(
        repo: Arc<R>,
        steps: Arc<StepRegistry>,
        dispatcher: Arc<dyn TaskDispatcherDyn>,
        config: EngineConfig,
    ) -> Self {
        Self {
            continuations: ContinuationRegistry::new(Arc::clone(&repo)),
            repo,
            strategies: StrategyRegistry::standard(steps),
            advisers: AdviserRegistry::with_builtins(),
            dispatcher,
            timeouts: TimeoutTracker::new(),
            event_bus: EventBus::new(config.event_bus_capacity),
            config,
            plans: DashMap::new(),
        }
    }

    /// Replace the adviser registry.
    pub fn with_advisers(mut self, advisers: AdviserRegistry) -> Self {
        self.advisers = advisers;
        self
    }

    /// Replace the strategy table.
    pub fn with_strategies(mut self, strategies: StrategyRegistry) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<OrchestrationEvent> {
        self.event_bus.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repo
    }

    // -----------------------------------------------------------------------
    // Plans
    // -----------------------------------------------------------------------

    /// Persist a compiled plan and cache it.
    pub async fn register_plan(&self, plan: Plan) -> Result<Arc<Plan>, EngineError> {
        self.repo.save_plan(&plan).await?;
        let plan = Arc::new(plan);
        self.plans.insert(plan.id, Arc::clone(&plan));
        tracing::info!(plan_id = %plan.id, nodes = plan.nodes.len(), "plan registered");
        Ok(plan)
    }

    pub(crate) async fn load_plan(&self, plan_id: Uuid) -> Result<Arc<Plan>, EngineError> {
        if let Some(plan) = self.plans.get(&plan_id) {
            return Ok(Arc::clone(plan.value()));
        }
        let plan = self
            .repo
            .get_plan(&plan_id)
            .await?
            .ok_or(EngineError::UnknownPlan(plan_id))?;
        let plan = Arc::new(plan);
        self.plans.insert(plan_id, Arc::clone(&plan));
        Ok(plan)
    }

    pub(crate) async fn plan_node(&self, plan_id: Uuid, node_id: &str) -> Result<PlanNode, EngineError> {
        let plan = self.load_plan(plan_id).await?;
        plan.node(node_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownNode {
                plan_id,
                node_id: node_id.to_string(),
            })
    }

    /// Start a new execution of a registered plan at its start node.
    pub async fn start_plan_execution(
        self: &Arc<Self>,
        plan_id: Uuid,
        abstractions: HashMap<String, String>,
    ) -> Result<PlanExecution, EngineError> {
        let plan = self.load_plan(plan_id).await?;
        let start = plan.start_node().cloned().ok_or_else(|| EngineError::UnknownNode {
            plan_id,
            node_id: plan.start_node_id.clone(),
        })?;

        let plan_execution_id = Uuid::now_v7();
        let mut ambiance = Ambiance::new(plan_execution_id, plan_id);
        ambiance.setup_abstractions = abstractions;

        let execution = PlanExecution {
            id: plan_execution_id,
            plan_id,
            status: Status::Running,
            ambiance: ambiance.clone(),
            start_ts: chrono::Utc::now(),
            end_ts: None,
        };
        self.repo.create_plan_execution(&execution).await?;

        let root = self
            .create_node_record(Uuid::now_v7(), &ambiance, &start, NodeLinks::default())
            .await?;
        tracing::info!(
            plan_execution_id = %plan_execution_id,
            plan_id = %plan_id,
            root = %root.id,
            "plan execution started"
        );
        self.spawn_start(root.id);
        Ok(execution)
    }

    /// Create a QUEUED record for `node` one level below `base`.
    pub(crate) async fn create_node_record(
        &self,
        id: Uuid,
        base: &Ambiance,
        node: &PlanNode,
        links: NodeLinks,
    ) -> Result<NodeExecution, EngineError> {
        let level = Level::new(
            node.uuid.clone(),
            id,
            node.identifier.clone(),
            node.step_type.clone(),
            node.group.clone(),
        );
        let mut record = NodeExecution::queued(
            id,
            base.clone_for_child(level),
            node.uuid.clone(),
            node.identifier.clone(),
            node.execution_mode,
        );
        record.parent_id = links.parent_id;
        record.previous_id = links.previous_id;
        record.notify_id = links.notify_id;
        record.rollback_of = links.rollback_of;

        self.repo.create_node_execution(&record).await?;
        if let Some(inputs) = node.step_parameters.get("inputs") {
            self.repo
                .save_input_instance(&InputInstance::new(id, inputs.clone()))
                .await?;
        }

        tracing::debug!(
            node_execution_id = %id,
            plan_execution_id = %record.plan_execution_id,
            node_id = %record.node_id,
            "node execution queued"
        );
        self.event_bus.publish(OrchestrationEvent::NodeQueued {
            plan_execution_id: record.plan_execution_id,
            node_execution_id: id,
            node_id: record.node_id.clone(),
        });
        Ok(record)
    }

    pub(crate) fn publish_status(&self, record: &NodeExecution) {
        self.event_bus.publish(OrchestrationEvent::NodeStatusChanged {
            plan_execution_id: record.plan_execution_id,
            node_execution_id: record.id,
            status: record.status,
        });
    }

    /// Retire the unfired waits of a record forced terminal.
    pub(crate) async fn retire_waits(&self, node_execution_id: Uuid) {
        if let Err(e) = self.continuations.cancel_waits_for(node_execution_id).await {
            tracing::warn!(node_execution_id = %node_execution_id, error = %e, "failed to retire waits");
        }
    }

    /// Conclude a plan execution once; publishes `PlanExecutionEnded`.
    pub(crate) async fn end_plan_execution(
        &self,
        plan_execution_id: Uuid,
        status: Status,
    ) -> Result<bool, EngineError> {
        let concluded = self
            .repo
            .conclude_plan_execution(&plan_execution_id, status)
            .await?;
        if concluded {
            tracing::info!(plan_execution_id = %plan_execution_id, status = %status, "plan execution ended");
            self.event_bus.publish(OrchestrationEvent::PlanExecutionEnded {
                plan_execution_id,
                status,
            });
        }
        Ok(concluded)
    }

    // -----------------------------------------------------------------------
    // Deliveries
    // -----------------------------------------------------------------------

    /// Deliver an external result for `correlation_id`. Returns the number
    /// of callbacks that fired. Duplicates are dropped.
    pub async fn deliver(
        self: &Arc<Self>,
        correlation_id: &str,
        payload: serde_json::Value,
        is_error: bool,
    ) -> usize {
        let fired = self
            .continuations
            .deliver(correlation_id, payload, is_error)
            .await;
        let count = fired.len();
        self.dispatch_fired(fired);
        count
    }

    /// Report progress for one correlation id of a pending wait.
    pub async fn deliver_progress(
        self: &Arc<Self>,
        correlation_id: &str,
        data: serde_json::Value,
    ) -> Result<usize, EngineError> {
        let fired = self.continuations.deliver_progress(correlation_id, data).await?;
        let count = fired.len();
        self.dispatch_fired(fired);
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn node_execution(&self, id: Uuid) -> Result<Option<NodeExecution>, EngineError> {
        Ok(self.repo.get_node_execution(&id).await?)
    }

    pub async fn plan_execution(&self, id: Uuid) -> Result<Option<PlanExecution>, EngineError> {
        Ok(self.repo.get_plan_execution(&id).await?)
    }

    pub async fn node_executions(&self, plan_execution_id: Uuid) -> Result<Vec<NodeExecution>, EngineError> {
        Ok(self.repo.list_by_plan_execution(&plan_execution_id).await?)
    }

    pub async fn children(
        &self,
        parent_id: Uuid,
        include_old_retries: bool,
    ) -> Result<Vec<NodeExecution>, EngineError> {
        Ok(self.repo.list_children(&parent_id, include_old_retries).await?)
    }

    /// Every record nested below `node_execution_id`.
    pub async fn descendants(&self, node_execution_id: Uuid) -> Result<Vec<NodeExecution>, EngineError> {
        let record = self
            .repo
            .get_node_execution(&node_execution_id)
            .await?
            .ok_or(EngineError::UnknownNodeExecution(node_execution_id))?;
        Ok(self.repo.list_descendants(&record.ambiance).await?)
    }

    pub async fn interrupts(&self, plan_execution_id: Uuid) -> Result<Vec<Interrupt>, EngineError> {
        Ok(self.repo.list_interrupts(&plan_execution_id).await?)
    }

    pub async fn interrupt_history(&self, node_execution_id: Uuid) -> Result<Vec<InterruptEffect>, EngineError> {
        let record = self
            .repo
            .get_node_execution(&node_execution_id)
            .await?
            .ok_or(EngineError::UnknownNodeExecution(node_execution_id))?;
        Ok(record.interrupt_history)
    }
}
