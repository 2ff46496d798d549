//! TASK: hand a descriptor to the task queue and resume on its result.
//!
//! Cancellation hooks forward to the handler; enqueueing and dequeueing are
//! the engine's job.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use weft_types::execution::{ExecutableResponse, FailureInfo, StepResponse};
use weft_types::plan::ExecutionMode;
use weft_types::waitnotify::ResponseMap;

use super::{ExecutionEffect, ExecutionStrategy, ResumeOutcome, unexpected_response};
use crate::step::{StepContext, StepRegistry, TaskRequest};

pub struct TaskStrategy {
    steps: Arc<StepRegistry>,
}

impl TaskStrategy {
    pub fn new(steps: Arc<StepRegistry>) -> Self {
        Self { steps }
    }

    fn task_id(last: Option<&ExecutableResponse>) -> Option<&str> {
        match last {
            Some(ExecutableResponse::Task { task_id, .. }) => Some(task_id),
            _ => None,
        }
    }
}

impl ExecutionStrategy for TaskStrategy {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Task
    }

    fn start<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
    ) -> BoxFuture<'a, anyhow::Result<ExecutionEffect>> {
        Box::pin(async move {
            let handler = self.steps.task(&ctx.step_type.step_type)?;
            match handler.obtain_task_boxed(ctx, params).await? {
                TaskRequest::Skip { message } => {
                    let response = StepResponse::skipped();
                    Ok(ExecutionEffect::complete(
                        response,
                        ExecutableResponse::Skip { message },
                    ))
                }
                TaskRequest::Dispatch(mut descriptor) => {
                    descriptor.node_execution_id = ctx.node_execution_id;
                    Ok(ExecutionEffect::DispatchTask { descriptor })
                }
            }
        })
    }

    fn resume<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
        last: &'a ExecutableResponse,
        responses: &'a ResponseMap,
    ) -> BoxFuture<'a, anyhow::Result<ResumeOutcome>> {
        Box::pin(async move {
            if !matches!(last, ExecutableResponse::Task { .. }) {
                return Err(unexpected_response(ExecutionMode::Task, last));
            }
            let handler = self.steps.task(&ctx.step_type.step_type)?;
            let response = handler.handle_task_result_boxed(ctx, params, responses).await?;
            Ok(ResumeOutcome::Complete(response))
        })
    }

    fn abort<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
        last: Option<&'a ExecutableResponse>,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let Some(task_id) = Self::task_id(last) else {
                return Ok(());
            };
            let handler = self.steps.task(&ctx.step_type.step_type)?;
            handler.handle_abort_boxed(ctx, params, task_id).await
        })
    }

    fn expire<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
        last: Option<&'a ExecutableResponse>,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let Some(task_id) = Self::task_id(last) else {
                return Ok(());
            };
            let handler = self.steps.task(&ctx.step_type.step_type)?;
            handler.handle_expire_boxed(ctx, params, task_id).await
        })
    }

    fn failure<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
        failure: &'a FailureInfo,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let handler = self.steps.task(&ctx.step_type.step_type)?;
            handler.handle_failure_boxed(ctx, params, failure).await
        })
    }
}
