//! Start, resume and conclusion of node executions.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use uuid::Uuid;
use weft_types::advise::AdviserResponse;
use weft_types::event::OrchestrationEvent;
use weft_types::execution::{
    ChildEntry, ExecutableResponse, FailureInfo, FailureType, NodeExecution, NodeExecutionUpdate,
    Status, StepResponse, UpdatePredicate,
};
use weft_types::interrupt::{InterruptConfig, InterruptKind, IssuedBy};
use weft_types::plan::PlanNode;
use weft_types::waitnotify::{NotifyCallback, ResponseMap};

use super::{EngineError, NodeLinks, OrchestrationEngine};
use crate::advise::AdvisingEvent;
use crate::condition::{ConditionContext, ConditionEvaluator};
use crate::continuation::FiredCallback;
use crate::repository::OrchestrationStore;
use crate::step::{ChildOutcome, StepContext};
use crate::strategy::{ExecutionEffect, ExecutionStrategy, ResumeOutcome, guarded};

impl<R: OrchestrationStore> OrchestrationEngine<R> {
    // -----------------------------------------------------------------------
    // Spawn points
    // -----------------------------------------------------------------------

    pub(crate) fn spawn_start(self: &Arc<Self>, node_execution_id: Uuid) {
        tokio::spawn(Arc::clone(self).start_boxed(node_execution_id));
    }

    fn start_boxed(self: Arc<Self>, node_execution_id: Uuid) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if let Err(e) = self.start_node(node_execution_id).await {
                tracing::error!(node_execution_id = %node_execution_id, error = %e, "node start failed");
                self.abandon(node_execution_id, e).await;
            }
        })
    }

    pub(crate) fn dispatch_fired(self: &Arc<Self>, fired: Vec<FiredCallback>) {
        for callback in fired {
            tokio::spawn(Arc::clone(self).run_callback_boxed(callback));
        }
    }

    fn run_callback_boxed(self: Arc<Self>, fired: FiredCallback) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            match fired.callback {
                NotifyCallback::Resume {
                    node_execution_id,
                    mode,
                    ..
                } => {
                    if let Err(e) = self.resume_node(node_execution_id, mode, fired.responses).await {
                        tracing::error!(node_execution_id = %node_execution_id, error = %e, "node resume failed");
                        self.abandon(node_execution_id, e).await;
                    }
                }
                NotifyCallback::Progress {
                    node_execution_id,
                    correlation_id,
                } => {
                    tracing::debug!(node_execution_id = %node_execution_id, correlation_id = %correlation_id, "callback progress");
                    self.event_bus.publish(OrchestrationEvent::CallbackProgress {
                        node_execution_id,
                        correlation_id,
                    });
                }
                NotifyCallback::InterruptFinalize {
                    node_execution_id,
                    interrupt_id,
                    kind,
                } => {
                    if let Err(e) = self.finalize_acknowledged(interrupt_id, node_execution_id).await {
                        tracing::warn!(
                            node_execution_id = %node_execution_id,
                            interrupt_id = %interrupt_id,
                            kind = %kind,
                            error = %e,
                            "interrupt finalization failed"
                        );
                    }
                }
            }
        })
    }

    fn delayed_retry_boxed(
        self: Arc<Self>,
        plan_execution_id: Uuid,
        node_execution_id: Uuid,
        wait: Duration,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
            let config = InterruptConfig::issued_by(IssuedBy::Adviser).with_reason("retry advised");
            if let Err(e) = self
                .handle_interrupt(InterruptKind::Retry, plan_execution_id, Some(node_execution_id), config)
                .await
            {
                tracing::warn!(node_execution_id = %node_execution_id, error = %e, "advised retry failed");
            }
        })
    }

    fn expire_on_timeout_boxed(
        self: Arc<Self>,
        plan_execution_id: Uuid,
        node_execution_id: Uuid,
        end_execution: bool,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let mut config = InterruptConfig::issued_by(IssuedBy::Timeout).with_reason("node timeout elapsed");
            if end_execution {
                config = config.ending_execution();
            }
            if let Err(e) = self
                .handle_interrupt(InterruptKind::Expire, plan_execution_id, Some(node_execution_id), config)
                .await
            {
                tracing::debug!(node_execution_id = %node_execution_id, error = %e, "timeout expiry not applied");
            }
        })
    }

    /// Arm a timer that expires the record when it elapses.
    pub(crate) async fn arm_timeout(
        self: &Arc<Self>,
        record: &NodeExecution,
        after: Duration,
        end_execution: bool,
    ) {
        let engine = Arc::downgrade(self);
        let plan_execution_id = record.plan_execution_id;
        let node_execution_id = record.id;
        let instance_id = self.timeouts.arm(
            node_execution_id,
            after,
            Box::new(move || -> BoxFuture<'static, ()> {
                match engine.upgrade() {
                    Some(engine) => {
                        engine.expire_on_timeout_boxed(plan_execution_id, node_execution_id, end_execution)
                    }
                    None => Box::pin(std::future::ready(())),
                }
            }),
        );

        let update = NodeExecutionUpdate::new().push_timeout_instance(instance_id);
        if let Err(e) = self
            .repo
            .update_node_execution_if(&node_execution_id, &UpdatePredicate::any(), &update)
            .await
        {
            tracing::warn!(node_execution_id = %node_execution_id, error = %e, "failed to record timeout instance");
        }
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    async fn start_node(self: &Arc<Self>, node_execution_id: Uuid) -> Result<(), EngineError> {
        let claim = NodeExecutionUpdate::new().status(Status::Running).started_now();
        let Some(record) = self
            .repo
            .update_node_execution_if(
                &node_execution_id,
                &UpdatePredicate::in_statuses(&[Status::Queued]),
                &claim,
            )
            .await?
        else {
            tracing::debug!(node_execution_id = %node_execution_id, "node already started");
            return Ok(());
        };
        self.publish_status(&record);

        let node = self
            .plan_node(record.ambiance.plan_id, &record.node_id)
            .await?;
        let ctx = self.step_context(&record, &node).await?;

        if let Some(response) = self.evaluate_conditions(&record, &node, ctx.inputs.clone()).await? {
            return self.conclude(record, &node, response).await;
        }

        if let Some(timeout) = node.timeout {
            self.arm_timeout(
                &record,
                Duration::from_millis(timeout.duration_ms),
                timeout.end_execution_on_expiry,
            )
            .await;
        }

        let strategy = self.strategy_for(&record)?;
        match guarded(strategy.start(&ctx, &node.step_parameters)).await {
            Ok(effect) => self.apply_effect(record, &node, effect).await,
            Err(failure) => {
                self.conclude(record, &node, StepResponse::failed(failure))
                    .await
            }
        }
    }

    fn strategy_for(&self, record: &NodeExecution) -> Result<Arc<dyn ExecutionStrategy>, EngineError> {
        self.strategies
            .get(record.execution_mode)
            .ok_or(EngineError::MissingStrategy(record.execution_mode))
    }

    pub(crate) async fn step_context(
        &self,
        record: &NodeExecution,
        node: &PlanNode,
    ) -> Result<StepContext, EngineError> {
        let inputs = self
            .repo
            .get_input_instance(&record.id)
            .await?
            .map(|instance| instance.values);
        Ok(StepContext {
            node_execution_id: record.id,
            ambiance: record.ambiance.clone(),
            step_type: node.step_type.clone(),
            identifier: record.identifier.clone(),
            inputs,
        })
    }

    /// `Some(response)` when the node must not run: SKIPPED for a false
    /// `when` or true skip condition, FAILED for an unevaluable one.
    async fn evaluate_conditions(
        &self,
        record: &NodeExecution,
        node: &PlanNode,
        inputs: Option<serde_json::Value>,
    ) -> Result<Option<StepResponse>, EngineError> {
        if node.when_condition.is_none() && node.skip_condition.is_none() {
            return Ok(None);
        }

        let mut context = ConditionContext::for_node(&record.identifier, &record.ambiance, inputs);
        for other in self
            .repo
            .list_by_plan_execution(&record.plan_execution_id)
            .await?
        {
            if other.status.is_terminal() && !other.old_retry {
                context = context.with_outcome(other.identifier, other.status, other.outcome);
            }
        }
        let context = context.to_expression_context();
        let evaluator = ConditionEvaluator::new();

        if let Some(when) = &node.when_condition {
            match evaluator.evaluate_bool(when, &context) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(node_execution_id = %record.id, condition = %when, "when condition false, skipping");
                    return Ok(Some(StepResponse::skipped()));
                }
                Err(e) => return Ok(Some(condition_failure(when, e))),
            }
        }
        if let Some(skip) = &node.skip_condition {
            match evaluator.evaluate_bool(skip, &context) {
                Ok(false) => {}
                Ok(true) => {
                    tracing::debug!(node_execution_id = %record.id, condition = %skip, "skip condition true, skipping");
                    return Ok(Some(StepResponse::skipped()));
                }
                Err(e) => return Ok(Some(condition_failure(skip, e))),
            }
        }
        Ok(None)
    }

    // -----------------------------------------------------------------------
    // Effects
    // -----------------------------------------------------------------------

    async fn apply_effect(
        self: &Arc<Self>,
        record: NodeExecution,
        node: &PlanNode,
        effect: ExecutionEffect,
    ) -> Result<(), EngineError> {
        match effect {
            ExecutionEffect::Complete {
                response,
                executable,
            } => {
                if let Some(executable) = executable {
                    let update = NodeExecutionUpdate::new().push_response(executable);
                    self.repo
                        .update_node_execution_if(&record.id, &UpdatePredicate::non_terminal(), &update)
                        .await?;
                }
                self.conclude(record, node, response).await
            }

            ExecutionEffect::AwaitCallbacks {
                executable,
                callback_ids,
                timeout_ms,
                per_id,
            } => {
                let update = NodeExecutionUpdate::new()
                    .status(Status::AsyncWaiting)
                    .push_response(executable);
                let Some(waiting) = self.transition(&record, &update).await? else {
                    return Ok(());
                };
                if let Some(ms) = timeout_ms {
                    self.arm_timeout(&waiting, Duration::from_millis(ms), false).await;
                }

                let resume = self.resume_callback(&waiting, node)?;
                let mut fired = self
                    .continuations
                    .wait_for_all(callback_ids.clone(), resume, None, timeout_ms)
                    .await?;
                if per_id {
                    let id = waiting.id;
                    fired.extend(
                        self.continuations
                            .wait_for_each(&callback_ids, |correlation_id| NotifyCallback::Progress {
                                node_execution_id: id,
                                correlation_id: correlation_id.to_string(),
                            })
                            .await?,
                    );
                }
                self.dispatch_fired(fired);
                Ok(())
            }

            ExecutionEffect::SpawnChildren { child_node_ids } => {
                let plan = self.load_plan(record.ambiance.plan_id).await?;
                let mut children = Vec::with_capacity(child_node_ids.len());
                for node_id in &child_node_ids {
                    let child = plan.node(node_id).cloned().ok_or_else(|| EngineError::UnknownNode {
                        plan_id: plan.id,
                        node_id: node_id.clone(),
                    })?;
                    children.push((Uuid::now_v7(), child));
                }

                let executable = ExecutableResponse::Children {
                    children: children
                        .iter()
                        .map(|(runtime_id, child)| ChildEntry {
                            node_id: child.uuid.clone(),
                            runtime_id: *runtime_id,
                        })
                        .collect(),
                };
                let correlation_ids = executable.correlation_ids();
                let update = NodeExecutionUpdate::new().push_response(executable);
                let Some(parent) = self.transition(&record, &update).await? else {
                    return Ok(());
                };

                // The wait exists before any child can conclude.
                let resume = self.resume_callback(&parent, node)?;
                let fired = self
                    .continuations
                    .wait_for_all(correlation_ids, resume, None, None)
                    .await?;

                for (runtime_id, child) in &children {
                    self.create_node_record(*runtime_id, &parent.ambiance, child, NodeLinks {
                        parent_id: Some(parent.id),
                        notify_id: Some(runtime_id.to_string()),
                        ..NodeLinks::default()
                    })
                    .await?;
                    self.spawn_start(*runtime_id);
                }
                self.dispatch_fired(fired);
                Ok(())
            }

            ExecutionEffect::SpawnChild {
                child_node_id,
                last_link,
                pass_through,
            } => {
                let child = self.plan_node(record.ambiance.plan_id, &child_node_id).await?;
                let runtime_id = Uuid::now_v7();
                let update = NodeExecutionUpdate::new().push_response(ExecutableResponse::ChildChain {
                    child_node_id,
                    runtime_id,
                    last_link,
                    pass_through,
                });
                let Some(parent) = self.transition(&record, &update).await? else {
                    return Ok(());
                };

                let resume = self.resume_callback(&parent, node)?;
                let fired = self
                    .continuations
                    .wait_for_all(vec![runtime_id.to_string()], resume, None, None)
                    .await?;
                self.create_node_record(runtime_id, &parent.ambiance, &child, NodeLinks {
                    parent_id: Some(parent.id),
                    notify_id: Some(runtime_id.to_string()),
                    ..NodeLinks::default()
                })
                .await?;
                self.spawn_start(runtime_id);
                self.dispatch_fired(fired);
                Ok(())
            }

            ExecutionEffect::DispatchTask { descriptor } => {
                let task_id = match self.dispatcher.enqueue_boxed(descriptor.clone()).await {
                    Ok(task_id) => task_id,
                    Err(e) => {
                        tracing::warn!(node_execution_id = %record.id, error = %e, "task dispatch failed");
                        let failure = FailureInfo::new(
                            format!("task dispatch failed: {e}"),
                            vec![FailureType::TaskDispatch],
                        );
                        return self.conclude(record, node, StepResponse::failed(failure)).await;
                    }
                };

                let update = NodeExecutionUpdate::new()
                    .status(Status::TaskWaiting)
                    .push_response(ExecutableResponse::Task {
                        task_id: task_id.clone(),
                        category: descriptor.category.clone(),
                        log_keys: descriptor.log_keys.clone(),
                    });
                let Some(waiting) = self.transition(&record, &update).await? else {
                    // Interrupted while enqueueing: the task is orphaned.
                    if let Err(e) = self.dispatcher.abort_boxed(&task_id).await {
                        tracing::warn!(task_id = %task_id, error = %e, "failed to abort orphaned task");
                    }
                    return Ok(());
                };

                self.event_bus.publish(OrchestrationEvent::TaskEnqueued {
                    node_execution_id: waiting.id,
                    task_id: task_id.clone(),
                    category: descriptor.category.clone(),
                });
                if let Some(ms) = descriptor.timeout_ms {
                    self.arm_timeout(&waiting, Duration::from_millis(ms), false).await;
                }

                let resume = self.resume_callback(&waiting, node)?;
                let fired = self
                    .continuations
                    .wait_for_all(vec![task_id], resume, None, descriptor.timeout_ms)
                    .await?;
                self.dispatch_fired(fired);
                Ok(())
            }
        }
    }

    /// Apply `update` to a non-terminal record; `None` when the record was
    /// concluded (typically by an interrupt) in the meantime.
    async fn transition(
        &self,
        record: &NodeExecution,
        update: &NodeExecutionUpdate,
    ) -> Result<Option<NodeExecution>, EngineError> {
        let updated = self
            .repo
            .update_node_execution_if(&record.id, &UpdatePredicate::non_terminal(), update)
            .await?;
        match &updated {
            Some(updated) => {
                if updated.status != record.status {
                    self.publish_status(updated);
                }
            }
            None => {
                tracing::debug!(node_execution_id = %record.id, "record concluded concurrently, dropping effect");
            }
        }
        Ok(updated)
    }

    pub(crate) fn resume_callback(&self, record: &NodeExecution, node: &PlanNode) -> Result<NotifyCallback, EngineError> {
        Ok(NotifyCallback::Resume {
            node_execution_id: record.id,
            ambiance: record.ambiance.to_bytes()?,
            step_parameters: serde_json::to_vec(&node.step_parameters)?,
            mode: record.execution_mode,
        })
    }

    // -----------------------------------------------------------------------
    // Resume
    // -----------------------------------------------------------------------

    async fn resume_node(
        self: &Arc<Self>,
        node_execution_id: Uuid,
        mode: weft_types::plan::ExecutionMode,
        responses: ResponseMap,
    ) -> Result<(), EngineError> {
        let record = self
            .repo
            .get_node_execution(&node_execution_id)
            .await?
            .ok_or(EngineError::UnknownNodeExecution(node_execution_id))?;
        if record.status.is_terminal() || record.pending_outcome.is_some() {
            tracing::debug!(node_execution_id = %node_execution_id, status = %record.status, "resume for concluded record dropped");
            return Ok(());
        }
        if record.execution_mode != mode {
            tracing::warn!(node_execution_id = %node_execution_id, "resume callback mode does not match record");
        }
        let Some(last) = record.last_executable_response().cloned() else {
            tracing::warn!(node_execution_id = %node_execution_id, "resume without executable response dropped");
            return Ok(());
        };

        let node = self
            .plan_node(record.ambiance.plan_id, &record.node_id)
            .await?;
        let ctx = self.step_context(&record, &node).await?;
        let strategy = self.strategy_for(&record)?;

        match guarded(strategy.resume(&ctx, &node.step_parameters, &last, &responses)).await {
            Ok(ResumeOutcome::Complete(response)) => self.conclude(record, &node, response).await,
            Ok(ResumeOutcome::Continue(effect)) => self.apply_effect(record, &node, effect).await,
            Err(failure) => {
                self.conclude(record, &node, StepResponse::failed(failure))
                    .await
            }
        }
    }

    // -----------------------------------------------------------------------
    // Conclusion
    // -----------------------------------------------------------------------

    /// Claim the terminal outcome of a record. Losing the claim means
    /// another trigger concluded it first.
    pub(crate) async fn conclude(
        self: &Arc<Self>,
        record: NodeExecution,
        node: &PlanNode,
        response: StepResponse,
    ) -> Result<(), EngineError> {
        let claim = NodeExecutionUpdate::new().pending_outcome(Some(response.clone()));
        let Some(claimed) = self
            .repo
            .update_node_execution_if(
                &record.id,
                &UpdatePredicate::non_terminal().without_pending_outcome(),
                &claim,
            )
            .await?
        else {
            tracing::debug!(node_execution_id = %record.id, "conclusion already claimed");
            return Ok(());
        };
        self.finish_conclusion(claimed, node, response).await
    }

    /// Advise and commit a claimed outcome, then act on the decision.
    pub(crate) async fn finish_conclusion(
        self: &Arc<Self>,
        record: NodeExecution,
        node: &PlanNode,
        response: StepResponse,
    ) -> Result<(), EngineError> {
        self.timeouts.cancel_all(record.id);
        let decision = self.advise(&record, node, &response, None);

        let (status, parked) = match &decision {
            Some(AdviserResponse::MarkSuccess { .. }) => (Status::Succeeded, false),
            Some(AdviserResponse::MarkFailure) => (Status::Failed, false),
            Some(AdviserResponse::WaitIntervention { .. }) => (Status::InterventionWaiting, true),
            _ => (response.status, false),
        };

        let mut update = NodeExecutionUpdate::new()
            .concluding(&response)
            .status(status)
            .pending_outcome(None);
        update = if parked {
            update.intervention_prior_status(Some(response.status))
        } else {
            update.ended_now()
        };
        if let Some(decision) = &decision {
            update = update.adviser_response(decision.clone());
        }

        let Some(committed) = self
            .repo
            .update_node_execution_if(
                &record.id,
                &UpdatePredicate::non_terminal().with_pending_outcome(),
                &update,
            )
            .await?
        else {
            tracing::warn!(node_execution_id = %record.id, "lost conditional update committing outcome");
            return Ok(());
        };

        tracing::debug!(
            node_execution_id = %committed.id,
            status = %committed.status,
            decision = decision.as_ref().map(AdviserResponse::decision_name),
            "node execution concluded"
        );
        self.publish_status(&committed);
        self.act_on_decision(committed, decision).await
    }

    /// Consult the node's advisers. Adviser errors count as no decision.
    pub(crate) fn advise(
        &self,
        record: &NodeExecution,
        node: &PlanNode,
        response: &StepResponse,
        from_interrupt: Option<InterruptKind>,
    ) -> Option<AdviserResponse> {
        let event = AdvisingEvent {
            record,
            node,
            response,
            from_interrupt,
        };
        match self.advisers.advise(&event) {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!(node_execution_id = %record.id, error = %e, "adviser failed");
                None
            }
        }
    }

    pub(crate) async fn act_on_decision(
        self: &Arc<Self>,
        record: NodeExecution,
        decision: Option<AdviserResponse>,
    ) -> Result<(), EngineError> {
        match decision {
            Some(AdviserResponse::Advance { next_node_id }) => {
                self.advance(&record, &next_node_id, record.rollback_of).await
            }
            Some(AdviserResponse::Rollback {
                rollback_node_id, ..
            }) => {
                let origin = record.rollback_of.unwrap_or(record.id);
                self.advance(&record, &rollback_node_id, Some(origin)).await
            }
            Some(AdviserResponse::Retry {
                wait_interval_ms, ..
            }) => {
                tokio::spawn(Arc::clone(self).delayed_retry_boxed(
                    record.plan_execution_id,
                    record.id,
                    Duration::from_millis(wait_interval_ms),
                ));
                Ok(())
            }
            Some(AdviserResponse::WaitIntervention { timeout_ms }) => {
                tracing::info!(node_execution_id = %record.id, "node parked for intervention");
                if let Some(ms) = timeout_ms {
                    self.arm_timeout(&record, Duration::from_millis(ms), false).await;
                }
                Ok(())
            }
            Some(AdviserResponse::Ignore { next_node_id })
            | Some(AdviserResponse::MarkSuccess { next_node_id }) => match next_node_id {
                Some(next) => self.advance(&record, &next, record.rollback_of).await,
                None => self.chain_end(&record, Status::Succeeded).await,
            },
            Some(AdviserResponse::MarkFailure) => self.chain_end(&record, Status::Failed).await,
            None => self.chain_end(&record, record.status).await,
        }
    }

    /// Start `next_node_id` as the next sibling of `record`.
    async fn advance(
        self: &Arc<Self>,
        record: &NodeExecution,
        next_node_id: &str,
        rollback_of: Option<Uuid>,
    ) -> Result<(), EngineError> {
        let next = self.plan_node(record.ambiance.plan_id, next_node_id).await?;
        let sibling = self
            .create_node_record(Uuid::now_v7(), &record.ambiance.clone_for_finish(), &next, NodeLinks {
                parent_id: record.parent_id,
                previous_id: Some(record.id),
                notify_id: record.notify_id.clone(),
                rollback_of,
            })
            .await?;
        self.repo
            .update_node_execution_if(
                &record.id,
                &UpdatePredicate::any(),
                &NodeExecutionUpdate::new().next_id(sibling.id),
            )
            .await?;
        self.spawn_start(sibling.id);
        Ok(())
    }

    /// End of a sibling chain: notify the parent, or end the plan execution
    /// at the root.
    pub(crate) async fn chain_end(
        self: &Arc<Self>,
        record: &NodeExecution,
        effective: Status,
    ) -> Result<(), EngineError> {
        let (status, failure_info) = match record.rollback_of {
            // A completed rollback still reports the failure it rolled back.
            Some(origin) if effective.is_positive() => {
                let original = self.repo.get_node_execution(&origin).await?;
                let status = original
                    .as_ref()
                    .map(|o| o.status)
                    .filter(|s| s.is_broken())
                    .unwrap_or(Status::Failed);
                let failure = original
                    .and_then(|o| o.failure_info)
                    .unwrap_or_else(|| FailureInfo::new("rolled back", vec![]));
                (status, Some(failure))
            }
            _ => (
                effective,
                effective
                    .is_broken()
                    .then(|| record.failure_info.clone())
                    .flatten(),
            ),
        };

        match &record.notify_id {
            Some(notify_id) => {
                let outcome = ChildOutcome {
                    node_execution_id: record.id,
                    node_id: record.node_id.clone(),
                    identifier: record.identifier.clone(),
                    status,
                    failure_info,
                    outcome: record.outcome.clone(),
                };
                let payload = serde_json::to_value(&outcome)?;
                let fired = self
                    .continuations
                    .deliver(notify_id, payload, status.is_broken())
                    .await;
                self.dispatch_fired(fired);
            }
            None => {
                self.end_plan_execution(record.plan_execution_id, status).await?;
            }
        }
        Ok(())
    }

    /// Fail a record whose lifecycle hit an engine error and propagate.
    async fn abandon(self: &Arc<Self>, node_execution_id: Uuid, error: EngineError) {
        let failure = FailureInfo::unexpected(error.to_string());
        let update = NodeExecutionUpdate::new()
            .status(Status::Failed)
            .failure_info(failure)
            .pending_outcome(None)
            .ended_now();
        match self
            .repo
            .update_node_execution_if(&node_execution_id, &UpdatePredicate::non_terminal(), &update)
            .await
        {
            Ok(Some(record)) => {
                self.timeouts.cancel_all(record.id);
                self.retire_waits(record.id).await;
                self.publish_status(&record);
                if let Err(e) = self.chain_end(&record, Status::Failed).await {
                    tracing::error!(node_execution_id = %node_execution_id, error = %e, "failed to propagate abandoned node");
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(node_execution_id = %node_execution_id, error = %e, "failed to abandon node");
            }
        }
    }
}

fn condition_failure(expression: &str, error: crate::condition::ConditionError) -> StepResponse {
    StepResponse::failed(FailureInfo::new(
        format!("condition '{expression}' could not be evaluated: {error}"),
        vec![FailureType::Validation],
    ))
}
