//! Interrupt subsystem: abort, expire, retry and forced failure.
//!
//! Every interrupt is persisted and moves REGISTERED -> PROCESSING ->
//! PROCESSED_SUCCESSFULLY | PROCESSED_UNSUCCESSFULLY. Status changes caused
//! by an interrupt carry the `InterruptEffect` in the same conditional
//! update, so the history never disagrees with the final disposition.
//!
//! Cancellation is cooperative first: outstanding tasks are aborted through
//! the dispatcher, the owning executor is asked to stop and the strategy's
//! `abort`/`expire` hook runs. A leaf holding external work is finalized by
//! the `InterruptFinalize` callback once the executor delivers the
//! acknowledgement id carried by `AbortRequested`/`ExpireRequested`. If no
//! acknowledgement arrives within `interrupt_ack_timeout_ms` the interrupt
//! finalizes the record itself and retires the wait.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, join_all};
use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;
use weft_types::advise::AdviserResponse;
use weft_types::error::RepositoryError;
use weft_types::event::OrchestrationEvent;
use weft_types::execution::{
    FailureInfo, FailureType, NodeExecution, NodeExecutionUpdate, Status, StepResponse,
    UpdatePredicate,
};
use weft_types::interrupt::{Interrupt, InterruptConfig, InterruptEffect, InterruptKind, InterruptState};
use weft_types::waitnotify::NotifyCallback;

use super::{EngineError, OrchestrationEngine};
use crate::repository::OrchestrationStore;
use crate::strategy::guarded;

/// Operator-facing message recorded on every expired node execution.
pub const EXPIRE_MESSAGE: &str =
    "Node execution expired: the configured timeout elapsed. Review the timeout configuration of this step.";

const ABORT_MESSAGE: &str = "Node execution aborted";
const FAIL_ALL_MESSAGE: &str = "User initiated failure";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors returned to the caller of an interrupt.
#[derive(Debug, thiserror::Error)]
pub enum InterruptError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("unknown node execution {0}")]
    UnknownNodeExecution(Uuid),

    #[error("unknown plan execution {0}")]
    UnknownPlanExecution(Uuid),

    #[error("{0} interrupt requires a target node execution")]
    MissingTarget(InterruptKind),

    #[error("node execution {node_execution_id} does not belong to plan execution {plan_execution_id}")]
    PlanMismatch {
        node_execution_id: Uuid,
        plan_execution_id: Uuid,
    },

    #[error("node execution {id} is already {status}")]
    AlreadyTerminal { id: Uuid, status: Status },

    #[error("node execution {id} cannot be retried while {status}")]
    NotRetryable { id: Uuid, status: Status },

    #[error("node execution {0} was already retried")]
    AlreadyRetried(Uuid),

    #[error("node execution {0} changed concurrently")]
    Conflict(Uuid),
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

impl<R: OrchestrationStore> OrchestrationEngine<R> {
    /// Register and process an interrupt.
    ///
    /// Node kinds (ABORT, EXPIRE, RETRY) need `node_execution_id`; plan kinds
    /// (ABORT_ALL, USER_MARKED_FAIL_ALL) ignore it.
    pub async fn handle_interrupt(
        self: &Arc<Self>,
        kind: InterruptKind,
        plan_execution_id: Uuid,
        node_execution_id: Option<Uuid>,
        config: InterruptConfig,
    ) -> Result<Interrupt, InterruptError> {
        if self.repo.get_plan_execution(&plan_execution_id).await?.is_none() {
            return Err(InterruptError::UnknownPlanExecution(plan_execution_id));
        }

        let mut interrupt = Interrupt::new(kind, plan_execution_id, node_execution_id, config);
        self.repo.save_interrupt(&interrupt).await?;
        self.repo
            .update_interrupt_state(&interrupt.id, InterruptState::Processing)
            .await?;
        tracing::info!(
            interrupt_id = %interrupt.id,
            kind = %kind,
            plan_execution_id = %plan_execution_id,
            node_execution_id = ?node_execution_id,
            "processing interrupt"
        );

        let result = self.process_interrupt(&interrupt).await;
        let state = match &result {
            Ok(()) => InterruptState::ProcessedSuccessfully,
            Err(e) => {
                tracing::warn!(interrupt_id = %interrupt.id, kind = %kind, error = %e, "interrupt failed");
                InterruptState::ProcessedUnsuccessfully
            }
        };
        self.repo.update_interrupt_state(&interrupt.id, state).await?;
        interrupt.state = state;
        self.event_bus.publish(OrchestrationEvent::InterruptProcessed {
            interrupt_id: interrupt.id,
            kind,
            state,
        });

        result.map(|()| interrupt)
    }

    /// Abort a single node execution.
    pub async fn abort(
        self: &Arc<Self>,
        plan_execution_id: Uuid,
        node_execution_id: Uuid,
        config: InterruptConfig,
    ) -> Result<Interrupt, InterruptError> {
        self.handle_interrupt(InterruptKind::Abort, plan_execution_id, Some(node_execution_id), config)
            .await
    }

    /// Expire a single node execution.
    pub async fn expire(
        self: &Arc<Self>,
        plan_execution_id: Uuid,
        node_execution_id: Uuid,
        config: InterruptConfig,
    ) -> Result<Interrupt, InterruptError> {
        self.handle_interrupt(InterruptKind::Expire, plan_execution_id, Some(node_execution_id), config)
            .await
    }

    /// Retry a concluded or parked node execution.
    pub async fn retry(
        self: &Arc<Self>,
        plan_execution_id: Uuid,
        node_execution_id: Uuid,
        config: InterruptConfig,
    ) -> Result<Interrupt, InterruptError> {
        self.handle_interrupt(InterruptKind::Retry, plan_execution_id, Some(node_execution_id), config)
            .await
    }

    /// Abort every active node of a plan execution.
    pub async fn abort_all(
        self: &Arc<Self>,
        plan_execution_id: Uuid,
        config: InterruptConfig,
    ) -> Result<Interrupt, InterruptError> {
        self.handle_interrupt(InterruptKind::AbortAll, plan_execution_id, None, config)
            .await
    }

    /// Fail every active leaf of a plan execution.
    pub async fn fail_all(
        self: &Arc<Self>,
        plan_execution_id: Uuid,
        config: InterruptConfig,
    ) -> Result<Interrupt, InterruptError> {
        self.handle_interrupt(InterruptKind::UserMarkedFailAll, plan_execution_id, None, config)
            .await
    }

    async fn process_interrupt(self: &Arc<Self>, interrupt: &Interrupt) -> Result<(), InterruptError> {
        match interrupt.kind {
            InterruptKind::Abort | InterruptKind::Expire => {
                let target = self.interrupt_target(interrupt).await?;
                if target.status.is_terminal() {
                    return Err(InterruptError::AlreadyTerminal {
                        id: target.id,
                        status: target.status,
                    });
                }
                if interrupt.kind == InterruptKind::Expire && interrupt.config.expire_and_end_execution {
                    return self.expire_and_end(interrupt).await;
                }
                self.interrupt_node(interrupt, target).await
            }
            InterruptKind::Retry => {
                let target = self.interrupt_target(interrupt).await?;
                self.retry_node(interrupt, target).await.map(|_| ())
            }
            InterruptKind::AbortAll => self.abort_plan(interrupt).await,
            InterruptKind::UserMarkedFailAll => self.fail_plan(interrupt).await,
        }
    }

    async fn interrupt_target(&self, interrupt: &Interrupt) -> Result<NodeExecution, InterruptError> {
        let id = interrupt
            .node_execution_id
            .ok_or(InterruptError::MissingTarget(interrupt.kind))?;
        let record = self
            .repo
            .get_node_execution(&id)
            .await?
            .ok_or(InterruptError::UnknownNodeExecution(id))?;
        if record.plan_execution_id != interrupt.plan_execution_id {
            return Err(InterruptError::PlanMismatch {
                node_execution_id: id,
                plan_execution_id: interrupt.plan_execution_id,
            });
        }
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Cooperative cancel, then finalize
    // -----------------------------------------------------------------------

    fn interrupt_node_boxed(
        self: Arc<Self>,
        interrupt: Interrupt,
        record: NodeExecution,
    ) -> BoxFuture<'static, Result<(), InterruptError>> {
        Box::pin(async move { self.interrupt_node(&interrupt, record).await })
    }

    /// Cancel the outstanding work of one record and finalize it.
    async fn interrupt_node(
        self: &Arc<Self>,
        interrupt: &Interrupt,
        record: NodeExecution,
    ) -> Result<(), InterruptError> {
        if record.status.is_terminal() {
            return Ok(());
        }

        if record.status == Status::TaskWaiting {
            self.abort_task(&record).await;
        }

        if record.execution_mode.is_parent() {
            // Containers finalize first so children concluding in between
            // cannot resume them.
            self.finalize_interrupted(interrupt, record.id).await?;
            for child in self.repo.list_children(&record.id, false).await? {
                if child.status.is_terminal() {
                    continue;
                }
                Arc::clone(self)
                    .interrupt_node_boxed(interrupt.clone(), child)
                    .await?;
            }
            return Ok(());
        }

        if record.status == Status::InterventionWaiting || !record.holds_external_work() {
            self.finalize_interrupted(interrupt, record.id).await?;
            return Ok(());
        }

        // Subscribe before registering the wait so the acknowledged
        // finalization cannot slip past unseen.
        let mut events = self.event_bus.subscribe();
        let ack_correlation_id = format!("{}:{}", interrupt.id, record.id);
        let fired = self
            .continuations
            .wait_for_all(
                vec![ack_correlation_id.clone()],
                NotifyCallback::InterruptFinalize {
                    node_execution_id: record.id,
                    interrupt_id: interrupt.id,
                    kind: interrupt.kind,
                },
                None,
                Some(self.config.interrupt_ack_timeout_ms),
            )
            .await
            .map_err(EngineError::from)?;
        self.dispatch_fired(fired);

        let event = match interrupt.kind {
            InterruptKind::Expire => OrchestrationEvent::ExpireRequested {
                node_execution_id: record.id,
                ack_correlation_id: ack_correlation_id.clone(),
            },
            _ => OrchestrationEvent::AbortRequested {
                node_execution_id: record.id,
                ack_correlation_id: ack_correlation_id.clone(),
            },
        };
        let executors = self.event_bus.publish(event);
        tracing::debug!(
            node_execution_id = %record.id,
            ack_correlation_id = %ack_correlation_id,
            executors,
            "cancellation requested"
        );

        let deadline = Instant::now() + Duration::from_millis(self.config.interrupt_ack_timeout_ms);
        self.cancel_cooperatively(interrupt, &record, deadline).await;

        if self.await_terminal(&mut events, record.id, deadline).await {
            tracing::debug!(
                node_execution_id = %record.id,
                ack_correlation_id = %ack_correlation_id,
                "interrupt acknowledged"
            );
            // A record that concluded on its own still holds the ack wait.
            self.retire_waits(record.id).await;
            return Ok(());
        }

        tracing::warn!(
            node_execution_id = %record.id,
            ack_correlation_id = %ack_correlation_id,
            timeout_ms = self.config.interrupt_ack_timeout_ms,
            "no acknowledgement in time, finalizing"
        );
        // Retires the ack wait too; a late ack is stored and fires nothing.
        self.finalize_interrupted(interrupt, record.id).await?;
        Ok(())
    }

    /// `true` once the record is terminal, `false` if `deadline` passes
    /// first.
    async fn await_terminal(
        &self,
        events: &mut broadcast::Receiver<OrchestrationEvent>,
        node_execution_id: Uuid,
        deadline: Instant,
    ) -> bool {
        let watch = async {
            if self.is_terminal(node_execution_id).await {
                return true;
            }
            loop {
                match events.recv().await {
                    Ok(OrchestrationEvent::NodeStatusChanged {
                        node_execution_id: id,
                        status,
                        ..
                    }) if id == node_execution_id && status.is_terminal() => return true,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(node_execution_id = %node_execution_id, skipped, "event receiver lagged");
                        if self.is_terminal(node_execution_id).await {
                            return true;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        };
        tokio::time::timeout_at(deadline, watch).await.unwrap_or(false)
    }

    async fn is_terminal(&self, node_execution_id: Uuid) -> bool {
        matches!(
            self.repo.get_node_execution(&node_execution_id).await,
            Ok(Some(record)) if record.status.is_terminal()
        )
    }

    /// Run the strategy's cancel hook, bounded by `deadline`.
    async fn cancel_cooperatively(&self, interrupt: &Interrupt, record: &NodeExecution, deadline: Instant) {
        let node = match self.plan_node(record.ambiance.plan_id, &record.node_id).await {
            Ok(node) => node,
            Err(e) => {
                tracing::warn!(node_execution_id = %record.id, error = %e, "cannot resolve node for cancellation");
                return;
            }
        };
        let ctx = match self.step_context(record, &node).await {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::warn!(node_execution_id = %record.id, error = %e, "cannot build context for cancellation");
                return;
            }
        };
        let Some(strategy) = self.strategies.get(record.execution_mode) else {
            return;
        };

        let last = record.last_executable_response();
        let hook = match interrupt.kind {
            InterruptKind::Expire => strategy.expire(&ctx, &node.step_parameters, last),
            _ => strategy.abort(&ctx, &node.step_parameters, last),
        };
        match tokio::time::timeout_at(deadline, guarded(hook)).await {
            Ok(Ok(())) => {}
            Ok(Err(failure)) => {
                tracing::warn!(node_execution_id = %record.id, error = %failure.message, "cancel hook failed");
            }
            Err(_) => {
                tracing::warn!(
                    node_execution_id = %record.id,
                    timeout_ms = self.config.interrupt_ack_timeout_ms,
                    "cancel hook did not return in time"
                );
            }
        }
    }

    /// Best-effort abort of the record's outstanding task.
    async fn abort_task(&self, record: &NodeExecution) {
        let Some(task_id) = record.outstanding_task_id() else {
            return;
        };
        match self.dispatcher.abort_boxed(task_id).await {
            Ok(true) => tracing::debug!(node_execution_id = %record.id, task_id, "task aborted"),
            Ok(false) => tracing::debug!(node_execution_id = %record.id, task_id, "task was not pending"),
            Err(e) => tracing::warn!(node_execution_id = %record.id, task_id, error = %e, "task abort failed"),
        }
    }

    /// Finalization triggered by an executor's acknowledgement.
    pub(crate) async fn finalize_acknowledged(
        self: &Arc<Self>,
        interrupt_id: Uuid,
        node_execution_id: Uuid,
    ) -> Result<(), InterruptError> {
        let Some(interrupt) = self.repo.get_interrupt(&interrupt_id).await? else {
            tracing::warn!(interrupt_id = %interrupt_id, "acknowledgement for unknown interrupt");
            return Ok(());
        };
        self.finalize_interrupted(&interrupt, node_execution_id).await?;
        Ok(())
    }

    /// Move a record to the interrupt's terminal status, recording the
    /// effect in the same update, then propagate. `None` if the record had
    /// already concluded.
    async fn finalize_interrupted(
        self: &Arc<Self>,
        interrupt: &Interrupt,
        node_execution_id: Uuid,
    ) -> Result<Option<NodeExecution>, InterruptError> {
        let (status, failure) = interrupt_outcome(interrupt);
        let update = NodeExecutionUpdate::new()
            .status(status)
            .failure_info(failure.clone())
            .push_interrupt_effect(InterruptEffect::of(interrupt))
            .pending_outcome(None)
            .intervention_prior_status(None)
            .ended_now();
        let Some(record) = self
            .repo
            .update_node_execution_if(&node_execution_id, &UpdatePredicate::non_terminal(), &update)
            .await?
        else {
            tracing::debug!(
                node_execution_id = %node_execution_id,
                interrupt_id = %interrupt.id,
                "record concluded before interrupt finalized"
            );
            return Ok(None);
        };

        self.timeouts.cancel_all(record.id);
        self.retire_waits(record.id).await;
        tracing::info!(
            node_execution_id = %record.id,
            interrupt_id = %interrupt.id,
            status = %record.status,
            "node execution interrupted"
        );
        self.publish_status(&record);

        if interrupt.kind == InterruptKind::UserMarkedFailAll {
            self.notify_failure(&record, &failure).await;
        }

        // Aborts are operator decisions and bypass the advisers. The record
        // is terminal already, so it can no longer be parked.
        let decision = match interrupt.kind {
            InterruptKind::Expire | InterruptKind::UserMarkedFailAll => {
                let node = self.plan_node(record.ambiance.plan_id, &record.node_id).await?;
                let response = StepResponse::broken(status, failure);
                match self.advise(&record, &node, &response, Some(interrupt.kind)) {
                    Some(AdviserResponse::WaitIntervention { .. }) => None,
                    other => other,
                }
            }
            _ => None,
        };
        let record = match &decision {
            Some(decision) => self
                .repo
                .update_node_execution_if(
                    &record.id,
                    &UpdatePredicate::any(),
                    &NodeExecutionUpdate::new().adviser_response(decision.clone()),
                )
                .await?
                .unwrap_or(record),
            None => record,
        };

        self.act_on_decision(record.clone(), decision).await?;
        Ok(Some(record))
    }

    async fn notify_failure(&self, record: &NodeExecution, failure: &FailureInfo) {
        let Ok(node) = self.plan_node(record.ambiance.plan_id, &record.node_id).await else {
            return;
        };
        let Ok(ctx) = self.step_context(record, &node).await else {
            return;
        };
        if let Some(strategy) = self.strategies.get(record.execution_mode)
            && let Err(e) = guarded(strategy.failure(&ctx, &node.step_parameters, failure)).await
        {
            tracing::warn!(node_execution_id = %record.id, error = %e.message, "failure hook failed");
        }
    }

    // -----------------------------------------------------------------------
    // Plan-wide interrupts
    // -----------------------------------------------------------------------

    /// Expire every active record of the plan execution and end it, without
    /// waiting on acknowledgements or running advisers.
    async fn expire_and_end(self: &Arc<Self>, interrupt: &Interrupt) -> Result<(), InterruptError> {
        let (status, failure) = interrupt_outcome(interrupt);
        let mut active = self.active_records(interrupt.plan_execution_id).await?;
        deepest_first(&mut active);

        for record in active {
            if record.status == Status::TaskWaiting {
                self.abort_task(&record).await;
            }
            let update = NodeExecutionUpdate::new()
                .status(status)
                .failure_info(failure.clone())
                .push_interrupt_effect(InterruptEffect::of(interrupt))
                .pending_outcome(None)
                .intervention_prior_status(None)
                .ended_now();
            if let Some(expired) = self
                .repo
                .update_node_execution_if(&record.id, &UpdatePredicate::non_terminal(), &update)
                .await?
            {
                self.timeouts.cancel_all(expired.id);
                self.retire_waits(expired.id).await;
                self.publish_status(&expired);
            }
        }

        self.end_plan_execution(interrupt.plan_execution_id, Status::Expired)
            .await?;
        Ok(())
    }

    /// Leaves first, then containers. Leaves wait for their
    /// acknowledgements concurrently.
    async fn abort_plan(self: &Arc<Self>, interrupt: &Interrupt) -> Result<(), InterruptError> {
        let mut active = self.active_records(interrupt.plan_execution_id).await?;
        deepest_first(&mut active);
        let (containers, leaves): (Vec<_>, Vec<_>) =
            active.into_iter().partition(|r| r.execution_mode.is_parent());

        self.interrupt_leaves(interrupt, leaves, "abort of node failed").await;
        for record in containers {
            let id = record.id;
            if let Err(e) = self.finalize_interrupted(interrupt, id).await {
                tracing::warn!(node_execution_id = %id, interrupt_id = %interrupt.id, error = %e, "abort of node failed");
            }
        }
        Ok(())
    }

    /// Fail every active leaf; containers conclude through propagation.
    async fn fail_plan(self: &Arc<Self>, interrupt: &Interrupt) -> Result<(), InterruptError> {
        let leaves: Vec<_> = self
            .active_records(interrupt.plan_execution_id)
            .await?
            .into_iter()
            .filter(|r| !r.execution_mode.is_parent())
            .collect();
        self.interrupt_leaves(interrupt, leaves, "forced failure of node failed").await;
        Ok(())
    }

    async fn interrupt_leaves(
        self: &Arc<Self>,
        interrupt: &Interrupt,
        leaves: Vec<NodeExecution>,
        failure_message: &'static str,
    ) {
        let ids: Vec<Uuid> = leaves.iter().map(|r| r.id).collect();
        let results = join_all(leaves.into_iter().map(|record| self.interrupt_node(interrupt, record))).await;
        for (id, result) in ids.into_iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(node_execution_id = %id, interrupt_id = %interrupt.id, error = %e, "{failure_message}");
            }
        }
    }

    async fn active_records(&self, plan_execution_id: Uuid) -> Result<Vec<NodeExecution>, InterruptError> {
        Ok(self
            .repo
            .list_by_plan_execution(&plan_execution_id)
            .await?
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .collect())
    }

    // -----------------------------------------------------------------------
    // Retry
    // -----------------------------------------------------------------------

    /// Clone `old` into a new QUEUED attempt and start it.
    async fn retry_node(
        self: &Arc<Self>,
        interrupt: &Interrupt,
        old: NodeExecution,
    ) -> Result<NodeExecution, InterruptError> {
        if old.old_retry {
            return Err(InterruptError::AlreadyRetried(old.id));
        }
        let parked = old.status == Status::InterventionWaiting;
        if !old.status.is_terminal() && !parked {
            return Err(InterruptError::NotRetryable {
                id: old.id,
                status: old.status,
            });
        }

        let new_id = Uuid::now_v7();
        let ambiance = old
            .ambiance
            .clone_for_retry(new_id)
            .ok_or(InterruptError::NotRetryable {
                id: old.id,
                status: old.status,
            })?;

        let mut mark = NodeExecutionUpdate::new()
            .retried_by(new_id)
            .push_interrupt_effect(InterruptEffect::of(interrupt));
        if parked {
            mark = mark
                .status(old.intervention_prior_status.unwrap_or(Status::Failed))
                .intervention_prior_status(None)
                .ended_now();
        } else if old.end_ts.is_none() {
            mark = mark.ended_now();
        }
        let Some(old) = self
            .repo
            .update_node_execution_if(
                &old.id,
                &UpdatePredicate::in_statuses(&[old.status]).not_retried(),
                &mark,
            )
            .await?
        else {
            return Err(InterruptError::Conflict(old.id));
        };
        self.timeouts.cancel_all(old.id);
        if parked {
            self.publish_status(&old);
        }

        let mut retried = NodeExecution::queued(
            new_id,
            ambiance,
            old.node_id.clone(),
            old.identifier.clone(),
            old.execution_mode,
        );
        retried.retry_ids = old.retry_ids.iter().copied().chain([old.id]).collect();
        retried.parent_id = old.parent_id;
        retried.previous_id = old.previous_id;
        retried.notify_id = old.notify_id.clone();
        retried.rollback_of = old.rollback_of;
        self.repo.create_node_execution(&retried).await?;

        if let Some(inputs) = self.repo.get_input_instance(&old.id).await? {
            self.repo.save_input_instance(&inputs.clone_for(new_id)).await?;
        }

        tracing::info!(
            node_execution_id = %new_id,
            retry_of = %old.id,
            retry_index = retried.retry_ids.len(),
            "node execution retried"
        );
        self.event_bus.publish(OrchestrationEvent::NodeQueued {
            plan_execution_id: retried.plan_execution_id,
            node_execution_id: new_id,
            node_id: retried.node_id.clone(),
        });
        self.spawn_start(new_id);
        Ok(retried)
    }
}

/// Terminal status and failure recorded for an interrupt kind.
fn interrupt_outcome(interrupt: &Interrupt) -> (Status, FailureInfo) {
    match interrupt.kind {
        InterruptKind::Expire => (
            Status::Expired,
            FailureInfo::new(EXPIRE_MESSAGE, vec![FailureType::Timeout]),
        ),
        InterruptKind::UserMarkedFailAll => (
            Status::Failed,
            FailureInfo::new(
                interrupt.config.reason.as_deref().unwrap_or(FAIL_ALL_MESSAGE),
                vec![FailureType::UserMarkedFailure],
            ),
        ),
        InterruptKind::Abort | InterruptKind::AbortAll | InterruptKind::Retry => (
            Status::Aborted,
            FailureInfo::new(
                interrupt.config.reason.as_deref().unwrap_or(ABORT_MESSAGE),
                vec![],
            ),
        ),
    }
}

fn deepest_first(records: &mut [NodeExecution]) {
    records.sort_by(|a, b| b.ambiance.levels.len().cmp(&a.ambiance.levels.len()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_types::interrupt::IssuedBy;

    fn interrupt(kind: InterruptKind, config: InterruptConfig) -> Interrupt {
        Interrupt::new(kind, Uuid::now_v7(), Some(Uuid::now_v7()), config)
    }

    #[test]
    fn expire_outcome_uses_fixed_message() {
        let (status, failure) = interrupt_outcome(&interrupt(
            InterruptKind::Expire,
            InterruptConfig::issued_by(IssuedBy::Timeout).with_reason("ignored"),
        ));
        assert_eq!(status, Status::Expired);
        assert_eq!(failure.message, EXPIRE_MESSAGE);
        assert!(failure.has_type(FailureType::Timeout));
    }

    #[test]
    fn fail_all_outcome_is_user_marked() {
        let (status, failure) = interrupt_outcome(&interrupt(
            InterruptKind::UserMarkedFailAll,
            InterruptConfig::issued_by(IssuedBy::User),
        ));
        assert_eq!(status, Status::Failed);
        assert_eq!(failure.message, FAIL_ALL_MESSAGE);
        assert_eq!(failure.failure_types, vec![FailureType::UserMarkedFailure]);
    }

    #[test]
    fn abort_outcome_carries_reason() {
        let (status, failure) = interrupt_outcome(&interrupt(
            InterruptKind::Abort,
            InterruptConfig::issued_by(IssuedBy::User).with_reason("wrong branch"),
        ));
        assert_eq!(status, Status::Aborted);
        assert_eq!(failure.message, "wrong branch");
    }

    #[test]
    fn deepest_records_sort_first() {
        use weft_types::ambiance::{Ambiance, Level};
        use weft_types::plan::{ExecutionMode, StepCategory, StepType};

        let base = Ambiance::new(Uuid::now_v7(), Uuid::now_v7());
        let level = |id: &str| {
            Level::new(id, Uuid::now_v7(), id, StepType::new("Shell", StepCategory::Step), None)
        };
        let shallow = base.clone_for_child(level("stage"));
        let deep = shallow.clone_for_child(level("step"));
        let mut records = vec![
            NodeExecution::queued(Uuid::now_v7(), shallow, "stage", "stage", ExecutionMode::Children),
            NodeExecution::queued(Uuid::now_v7(), deep, "step", "step", ExecutionMode::Task),
        ];
        deepest_first(&mut records);
        assert_eq!(records[0].identifier, "step");
    }
}
