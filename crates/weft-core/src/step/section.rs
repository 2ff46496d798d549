//! Built-in container handlers for pipelines, stages, step groups and forks.
//!
//! Both read their child node ids from `step_parameters.children`.

use serde_json::{Value, json};
use weft_types::execution::{FailureInfo, StepResponse, calculate_status};

use super::{
    ChildChainDecision, ChildChainExecutable, ChildLink, ChildOutcome, ChildrenExecutable,
    StepContext,
};

/// Step type of the fan-out container.
pub const SECTION_CHILDREN: &str = "SECTION_CHILDREN";

/// Step type of the sequential container.
pub const SECTION_CHAIN: &str = "SECTION_CHAIN";

fn children_of(params: &Value) -> Vec<String> {
    params
        .get("children")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Merge the failures of broken children into one `FailureInfo`.
fn merged_failure(outcomes: &[ChildOutcome]) -> Option<FailureInfo> {
    let broken: Vec<&ChildOutcome> = outcomes.iter().filter(|o| o.status.is_broken()).collect();
    if broken.is_empty() {
        return None;
    }

    let mut failure_types = Vec::new();
    let mut messages = Vec::new();
    for outcome in broken {
        match &outcome.failure_info {
            Some(info) => {
                messages.push(format!("{}: {}", outcome.identifier, info.message));
                for t in &info.failure_types {
                    if !failure_types.contains(t) {
                        failure_types.push(*t);
                    }
                }
            }
            None => messages.push(format!("{}: {}", outcome.identifier, outcome.status)),
        }
    }
    Some(FailureInfo::new(messages.join("; "), failure_types))
}

// ---------------------------------------------------------------------------
// SectionChildren
// ---------------------------------------------------------------------------

/// Runs every child concurrently and reduces their statuses.
#[derive(Debug, Clone, Copy, Default)]
pub struct SectionChildren;

impl ChildrenExecutable for SectionChildren {
    async fn obtain_children(&self, _ctx: &StepContext, params: &Value) -> anyhow::Result<Vec<String>> {
        Ok(children_of(params))
    }

    async fn handle_children_response(
        &self,
        _ctx: &StepContext,
        _params: &Value,
        outcomes: &[ChildOutcome],
    ) -> anyhow::Result<StepResponse> {
        let statuses: Vec<_> = outcomes.iter().map(|o| o.status).collect();
        let status = calculate_status(&statuses);
        let summary: serde_json::Map<String, Value> = outcomes
            .iter()
            .map(|o| (o.identifier.clone(), json!(o.status)))
            .collect();

        Ok(StepResponse {
            status,
            failure_info: merged_failure(outcomes),
            outcome: Some(Value::Object(summary)),
        })
    }
}

// ---------------------------------------------------------------------------
// SectionChain
// ---------------------------------------------------------------------------

/// Runs children in order, stopping at the first broken child.
#[derive(Debug, Clone, Copy, Default)]
pub struct SectionChain;

impl SectionChain {
    fn link(children: &[String], index: usize) -> Option<ChildLink> {
        children.get(index).map(|child| ChildLink {
            child_node_id: child.clone(),
            last_link: index + 1 == children.len(),
            pass_through: json!({ "index": index }),
        })
    }
}

impl ChildChainExecutable for SectionChain {
    async fn first_child(&self, _ctx: &StepContext, params: &Value) -> anyhow::Result<Option<ChildLink>> {
        Ok(Self::link(&children_of(params), 0))
    }

    async fn on_child_concluded(
        &self,
        _ctx: &StepContext,
        params: &Value,
        pass_through: &Value,
        child: &ChildOutcome,
    ) -> anyhow::Result<ChildChainDecision> {
        if child.status.is_broken() {
            let failure = child
                .failure_info
                .clone()
                .unwrap_or_else(|| FailureInfo::new(format!("{} {}", child.identifier, child.status), vec![]));
            return Ok(ChildChainDecision::Finish(StepResponse::broken(
                child.status,
                failure,
            )));
        }

        let index = pass_through
            .get("index")
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow::anyhow!("chain state lost its index"))? as usize;

        match Self::link(&children_of(params), index + 1) {
            Some(next) => Ok(ChildChainDecision::Next(next)),
            None => Ok(ChildChainDecision::Finish(StepResponse::succeeded())),
        }
    }
}
