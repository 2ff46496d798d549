//! CHILD_CHAIN: run children one at a time; the handler picks each next
//! child from the previous child's outcome.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use weft_types::execution::{ExecutableResponse, StepResponse};
use weft_types::plan::ExecutionMode;
use weft_types::waitnotify::ResponseMap;

use super::children::child_outcome;
use super::{ExecutionEffect, ExecutionStrategy, ResumeOutcome, unexpected_response};
use crate::step::{ChildChainDecision, ChildLink, StepContext, StepRegistry};

pub struct ChildChainStrategy {
    steps: Arc<StepRegistry>,
}

impl ChildChainStrategy {
    pub fn new(steps: Arc<StepRegistry>) -> Self {
        Self { steps }
    }

    fn spawn(link: ChildLink) -> ExecutionEffect {
        ExecutionEffect::SpawnChild {
            child_node_id: link.child_node_id,
            last_link: link.last_link,
            pass_through: link.pass_through,
        }
    }
}

impl ExecutionStrategy for ChildChainStrategy {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::ChildChain
    }

    fn start<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
    ) -> BoxFuture<'a, anyhow::Result<ExecutionEffect>> {
        Box::pin(async move {
            let handler = self.steps.child_chain(&ctx.step_type.step_type)?;
            match handler.first_child_boxed(ctx, params).await? {
                Some(link) => Ok(Self::spawn(link)),
                None => Ok(ExecutionEffect::Complete {
                    response: StepResponse::succeeded(),
                    executable: None,
                }),
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
            let ExecutableResponse::ChildChain {
                runtime_id,
                last_link,
                pass_through,
                ..
            } = last
            else {
                return Err(unexpected_response(ExecutionMode::ChildChain, last));
            };

            let outcome = child_outcome(responses, &runtime_id.to_string())?;
            let handler = self.steps.child_chain(&ctx.step_type.step_type)?;
            match handler
                .on_child_concluded_boxed(ctx, params, pass_through, &outcome)
                .await?
            {
                ChildChainDecision::Finish(response) => Ok(ResumeOutcome::Complete(response)),
                ChildChainDecision::Next(link) if *last_link => Err(anyhow::anyhow!(
                    "child chain asked for '{}' after its last link",
                    link.child_node_id
                )),
                ChildChainDecision::Next(link) => Ok(ResumeOutcome::Continue(Self::spawn(link))),
            }
        })
    }
}
