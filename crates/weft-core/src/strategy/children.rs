//! CHILDREN: spawn every child at once; resume once all have concluded.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use weft_types::execution::{ExecutableResponse, StepResponse};
use weft_types::plan::ExecutionMode;
use weft_types::waitnotify::ResponseMap;

use super::{ExecutionEffect, ExecutionStrategy, ResumeOutcome, unexpected_response};
use crate::step::{ChildOutcome, StepContext, StepRegistry};

pub struct ChildrenStrategy {
    steps: Arc<StepRegistry>,
}

impl ChildrenStrategy {
    pub fn new(steps: Arc<StepRegistry>) -> Self {
        Self { steps }
    }
}

/// Decode the child outcome delivered under `correlation_id`.
pub(crate) fn child_outcome(
    responses: &ResponseMap,
    correlation_id: &str,
) -> anyhow::Result<ChildOutcome> {
    let response = responses
        .get(correlation_id)
        .ok_or_else(|| anyhow::anyhow!("no response for child {correlation_id}"))?;
    serde_json::from_value(response.payload.clone())
        .map_err(|e| anyhow::anyhow!("malformed outcome for child {correlation_id}: {e}"))
}

impl ExecutionStrategy for ChildrenStrategy {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Children
    }

    fn start<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
    ) -> BoxFuture<'a, anyhow::Result<ExecutionEffect>> {
        Box::pin(async move {
            let handler = self.steps.children(&ctx.step_type.step_type)?;
            let child_node_ids = handler.obtain_children_boxed(ctx, params).await?;
            if child_node_ids.is_empty() {
                return Ok(ExecutionEffect::complete(
                    StepResponse::succeeded(),
                    ExecutableResponse::Children { children: Vec::new() },
                ));
            }
            Ok(ExecutionEffect::SpawnChildren { child_node_ids })
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
            let ExecutableResponse::Children { children } = last else {
                return Err(unexpected_response(ExecutionMode::Children, last));
            };

            let outcomes = children
                .iter()
                .map(|child| child_outcome(responses, &child.runtime_id.to_string()))
                .collect::<anyhow::Result<Vec<_>>>()?;

            let handler = self.steps.children(&ctx.step_type.step_type)?;
            let response = handler
                .handle_children_response_boxed(ctx, params, &outcomes)
                .await?;
            Ok(ResumeOutcome::Complete(response))
        })
    }
}
