//! ASYNC_CHAIN: a sequence of single-callback links. Every completed link
//! either starts the next one or, after a `chain_end` link, finalizes.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use weft_types::execution::ExecutableResponse;
use weft_types::plan::ExecutionMode;
use weft_types::waitnotify::ResponseMap;

use super::{ExecutionEffect, ExecutionStrategy, ResumeOutcome, unexpected_response};
use crate::step::{ChainLink, StepContext, StepRegistry};

pub struct AsyncChainStrategy {
    steps: Arc<StepRegistry>,
}

impl AsyncChainStrategy {
    pub fn new(steps: Arc<StepRegistry>) -> Self {
        Self { steps }
    }

    fn await_link(link: ChainLink, link_index: u32) -> ExecutionEffect {
        ExecutionEffect::AwaitCallbacks {
            callback_ids: vec![link.callback_id.clone()],
            executable: ExecutableResponse::AsyncChain {
                callback_id: link.callback_id,
                link_index,
                chain_end: link.chain_end,
                pass_through: link.pass_through,
            },
            timeout_ms: None,
            per_id: false,
        }
    }
}

impl ExecutionStrategy for AsyncChainStrategy {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::AsyncChain
    }

    fn start<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
    ) -> BoxFuture<'a, anyhow::Result<ExecutionEffect>> {
        Box::pin(async move {
            let handler = self.steps.async_chain(&ctx.step_type.step_type)?;
            let link = handler.start_chain_link_boxed(ctx, params).await?;
            Ok(Self::await_link(link, 0))
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
            let ExecutableResponse::AsyncChain {
                link_index,
                chain_end,
                pass_through,
                ..
            } = last
            else {
                return Err(unexpected_response(ExecutionMode::AsyncChain, last));
            };

            let handler = self.steps.async_chain(&ctx.step_type.step_type)?;
            if *chain_end {
                let response = handler
                    .finalize_execution_boxed(ctx, params, pass_through, responses)
                    .await?;
                return Ok(ResumeOutcome::Complete(response));
            }

            let link = handler
                .execute_next_link_boxed(ctx, params, pass_through, responses)
                .await?;
            tracing::debug!(
                node_execution_id = %ctx.node_execution_id,
                link_index = link_index + 1,
                chain_end = link.chain_end,
                "async chain advanced"
            );
            Ok(ResumeOutcome::Continue(Self::await_link(link, link_index + 1)))
        })
    }

    fn abort<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
        _last: Option<&'a ExecutableResponse>,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let handler = self.steps.async_chain(&ctx.step_type.step_type)?;
            handler.abort_boxed(ctx, params).await
        })
    }
}
