//! SYNC: the handler returns the terminal outcome in-line.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use weft_types::execution::ExecutableResponse;
use weft_types::plan::ExecutionMode;
use weft_types::waitnotify::ResponseMap;

use super::{ExecutionEffect, ExecutionStrategy, ResumeOutcome, unexpected_response};
use crate::step::{StepContext, StepRegistry};

pub struct SyncStrategy {
    steps: Arc<StepRegistry>,
}

impl SyncStrategy {
    pub fn new(steps: Arc<StepRegistry>) -> Self {
        Self { steps }
    }
}

impl ExecutionStrategy for SyncStrategy {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Sync
    }

    fn start<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
    ) -> BoxFuture<'a, anyhow::Result<ExecutionEffect>> {
        Box::pin(async move {
            let handler = self.steps.sync(&ctx.step_type.step_type)?;
            let response = handler.execute_boxed(ctx, params).await?;
            Ok(ExecutionEffect::complete(
                response,
                ExecutableResponse::Sync { log_keys: Vec::new() },
            ))
        })
    }

    fn resume<'a>(
        &'a self,
        _ctx: &'a StepContext,
        _params: &'a Value,
        last: &'a ExecutableResponse,
        _responses: &'a ResponseMap,
    ) -> BoxFuture<'a, anyhow::Result<ResumeOutcome>> {
        Box::pin(async move { Err(unexpected_response(ExecutionMode::Sync, last)) })
    }
}
