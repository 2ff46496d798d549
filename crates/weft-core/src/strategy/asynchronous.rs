//! ASYNC: the handler starts external work and names the callback ids it
//! will be resumed on. Resume happens once, after every id was delivered.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use weft_types::execution::{ExecutableResponse, StepResponse};
use weft_types::plan::ExecutionMode;
use weft_types::waitnotify::ResponseMap;

use super::{ExecutionEffect, ExecutionStrategy, ResumeOutcome, unexpected_response};
use crate::step::{StepContext, StepRegistry};

pub struct AsyncStrategy {
    steps: Arc<StepRegistry>,
}

impl AsyncStrategy {
    pub fn new(steps: Arc<StepRegistry>) -> Self {
        Self { steps }
    }
}

impl ExecutionStrategy for AsyncStrategy {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Async
    }

    fn start<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
    ) -> BoxFuture<'a, anyhow::Result<ExecutionEffect>> {
        Box::pin(async move {
            let handler = self.steps.asynchronous(&ctx.step_type.step_type)?;
            let started = handler.start_boxed(ctx, params).await?;

            let executable = ExecutableResponse::Async {
                callback_ids: started.callback_ids.clone(),
                timeout_ms: started.timeout_ms,
                log_keys: started.log_keys,
            };

            // Nothing to wait for.
            if started.callback_ids.is_empty() {
                tracing::debug!(node_execution_id = %ctx.node_execution_id, "async step returned no callback ids");
                return Ok(ExecutionEffect::complete(StepResponse::skipped(), executable));
            }

            let per_id = started.callback_ids.len() > 1;
            Ok(ExecutionEffect::AwaitCallbacks {
                executable,
                callback_ids: started.callback_ids,
                timeout_ms: started.timeout_ms,
                per_id,
            })
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
            if !matches!(last, ExecutableResponse::Async { .. }) {
                return Err(unexpected_response(ExecutionMode::Async, last));
            }
            let handler = self.steps.asynchronous(&ctx.step_type.step_type)?;
            let response = handler.resume_boxed(ctx, params, responses).await?;
            Ok(ResumeOutcome::Complete(response))
        })
    }

    fn abort<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
        _last: Option<&'a ExecutableResponse>,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let handler = self.steps.asynchronous(&ctx.step_type.step_type)?;
            handler.abort_boxed(ctx, params).await
        })
    }
}
