//! Restart recovery and operator repair.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use uuid::Uuid;
use weft_types::advise::AdviserResponse;
use weft_types::execution::{
    FailureInfo, NodeExecution, NodeExecutionUpdate, Status, StepResponse, UpdatePredicate,
};
use weft_types::waitnotify::NotifyCallback;

use super::{EngineError, OrchestrationEngine};
use crate::repository::OrchestrationStore;

/// Failure recorded on a record whose in-flight work was lost in a restart.
pub const LOST_ON_RESTART_MESSAGE: &str = "Node execution was in flight when the engine stopped";

/// What `recover` re-drove.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Satisfied waits that had not fired.
    pub fired: usize,
    /// QUEUED records restarted.
    pub restarted: usize,
    /// Claimed outcomes whose conclusion was interrupted.
    pub concluded: usize,
    /// Waiting records whose node or intervention timeout was re-armed.
    pub rearmed: usize,
    /// Records whose resume wait was lost and registered again.
    pub rewaited: usize,
    /// Running records with nothing left to wait on, concluded FAILED.
    pub failed: usize,
}

impl<R: OrchestrationStore> OrchestrationEngine<R> {
    /// Re-drive every in-flight record after a process restart.
    ///
    /// Timers and spawned tasks do not survive a restart; continuations and
    /// records do. Waits satisfied before the crash fire now, QUEUED records
    /// start, claimed-but-uncommitted outcomes are committed, and waiting
    /// records get their node timeout back for the remaining time. Records
    /// that lost their resume wait wait again on the ids of their last
    /// executable response. Anything else still RUNNING had its work in
    /// this process and is concluded FAILED through the advisers.
    ///
    /// Call once at startup, before the engine takes new work.
    pub async fn recover(self: &Arc<Self>) -> Result<RecoveryReport, EngineError> {
        let mut report = RecoveryReport::default();

        let fired = self.continuations.recover().await?;
        report.fired = fired.len();
        let resuming: HashSet<Uuid> = fired.iter().map(|f| f.callback.node_execution_id()).collect();
        self.dispatch_fired(fired);

        for record in self.repo.list_non_terminal().await? {
            if record.status == Status::Queued {
                self.spawn_start(record.id);
                report.restarted += 1;
                continue;
            }
            if let Some(response) = record.pending_outcome.clone() {
                tokio::spawn(Arc::clone(self).resume_conclusion_boxed(record, response));
                report.concluded += 1;
                continue;
            }
            if record.status == Status::InterventionWaiting {
                if self.rearm_intervention_timeout(&record).await {
                    report.rearmed += 1;
                }
                continue;
            }
            if resuming.contains(&record.id) || self.has_resume_wait(record.id).await? {
                if matches!(record.status, Status::AsyncWaiting | Status::TaskWaiting)
                    && self.rearm_node_timeout(&record).await?
                {
                    report.rearmed += 1;
                }
                continue;
            }

            match self.rewait(&record).await? {
                true => report.rewaited += 1,
                false => {
                    tokio::spawn(Arc::clone(self).fail_lost_boxed(record));
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            fired = report.fired,
            restarted = report.restarted,
            concluded = report.concluded,
            rearmed = report.rearmed,
            rewaited = report.rewaited,
            failed = report.failed,
            "engine recovered"
        );
        Ok(report)
    }

    async fn has_resume_wait(&self, node_execution_id: Uuid) -> Result<bool, EngineError> {
        Ok(self
            .repo
            .unfired_waits_for_node(&node_execution_id)
            .await?
            .iter()
            .any(|w| matches!(w.callback, NotifyCallback::Resume { .. })))
    }

    /// Register the resume wait of a leaf again. Ids delivered before the
    /// restart count, so it may fire at once. `false` when the record has
    /// nothing to wait on.
    async fn rewait(self: &Arc<Self>, record: &NodeExecution) -> Result<bool, EngineError> {
        if record.execution_mode.is_parent() {
            return Ok(false);
        }
        let Some(last) = record.last_executable_response() else {
            return Ok(false);
        };
        let correlation_ids = last.correlation_ids();
        if correlation_ids.is_empty() {
            return Ok(false);
        }

        let node = self.plan_node(record.ambiance.plan_id, &record.node_id).await?;
        let resume = self.resume_callback(record, &node)?;
        tracing::info!(node_execution_id = %record.id, correlation_ids = ?correlation_ids, "resume wait registered again");
        let fired = self
            .continuations
            .wait_for_all(correlation_ids, resume, None, None)
            .await?;
        self.dispatch_fired(fired);
        if matches!(record.status, Status::AsyncWaiting | Status::TaskWaiting) {
            self.rearm_node_timeout(record).await?;
        }
        Ok(true)
    }

    fn fail_lost_boxed(self: Arc<Self>, record: NodeExecution) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let id = record.id;
            tracing::warn!(node_execution_id = %id, status = %record.status, "in-flight work lost in restart");
            let response = StepResponse::failed(FailureInfo::unexpected(LOST_ON_RESTART_MESSAGE));
            let result = match self.plan_node(record.ambiance.plan_id, &record.node_id).await {
                Ok(node) => self.conclude(record, &node, response).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::error!(node_execution_id = %id, error = %e, "failing lost node failed");
            }
        })
    }

    /// Parked records get their full intervention timeout again; the park
    /// time is not recorded.
    async fn rearm_intervention_timeout(self: &Arc<Self>, record: &NodeExecution) -> bool {
        let Some(AdviserResponse::WaitIntervention {
            timeout_ms: Some(ms),
        }) = &record.adviser_response
        else {
            return false;
        };
        self.arm_timeout(record, Duration::from_millis(*ms), false).await;
        true
    }

    fn resume_conclusion_boxed(
        self: Arc<Self>,
        record: NodeExecution,
        response: StepResponse,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let id = record.id;
            let result = match self.plan_node(record.ambiance.plan_id, &record.node_id).await {
                Ok(node) => self.finish_conclusion(record, &node, response).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::error!(node_execution_id = %id, error = %e, "recovered conclusion failed");
            }
        })
    }

    async fn rearm_node_timeout(self: &Arc<Self>, record: &NodeExecution) -> Result<bool, EngineError> {
        let node = self
            .plan_node(record.ambiance.plan_id, &record.node_id)
            .await?;
        let Some(timeout) = node.timeout else {
            return Ok(false);
        };
        let started = record.start_ts.unwrap_or(record.created_at);
        let elapsed = chrono::Utc::now()
            .signed_duration_since(started)
            .to_std()
            .unwrap_or_default();
        let remaining = Duration::from_millis(timeout.duration_ms).saturating_sub(elapsed);
        self.arm_timeout(record, remaining, timeout.end_execution_on_expiry)
            .await;
        Ok(true)
    }

    /// Mark every active record of a plan execution FAILED and end it.
    ///
    /// Repair path for executions stuck on lost external work; no advisers
    /// run and nothing is propagated.
    pub async fn error_out_active_nodes(&self, plan_execution_id: Uuid) -> Result<usize, EngineError> {
        if self.repo.get_plan_execution(&plan_execution_id).await?.is_none() {
            return Err(EngineError::UnknownPlanExecution(plan_execution_id));
        }

        let failure = FailureInfo::unexpected("node execution errored out by operator");
        let mut count = 0;
        for record in self.repo.list_by_plan_execution(&plan_execution_id).await? {
            if record.status.is_terminal() {
                continue;
            }
            let update = NodeExecutionUpdate::new()
                .status(Status::Failed)
                .failure_info(failure.clone())
                .pending_outcome(None)
                .intervention_prior_status(None)
                .ended_now();
            if let Some(failed) = self
                .repo
                .update_node_execution_if(&record.id, &UpdatePredicate::non_terminal(), &update)
                .await?
            {
                self.timeouts.cancel_all(failed.id);
                self.retire_waits(failed.id).await;
                self.publish_status(&failed);
                count += 1;
            }
        }

        tracing::warn!(plan_execution_id = %plan_execution_id, count, "active nodes errored out");
        self.end_plan_execution(plan_execution_id, Status::Failed).await?;
        Ok(count)
    }
}
