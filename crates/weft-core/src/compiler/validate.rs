//! Structural validation of a compiled plan.
//!
//! Uses `petgraph` to model "runs before/inside" relations as a directed graph:
//! parent -> child edges plus success-path advance edges. The graph must be
//! acyclic, otherwise a node could re-enter itself forever.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde_json::Value;
use weft_types::plan::{Plan, PlanNode};

use super::CompilationError;
use crate::advise::builtin::{ADVISER_NEXT_STEP, ADVISER_ON_SUCCESS};

/// Check node references and acyclicity. Returns every problem found.
pub fn validate_plan(plan: &Plan) -> Result<(), Vec<CompilationError>> {
    let mut errors = Vec::new();

    if !plan.nodes.contains_key(&plan.start_node_id) {
        errors.push(invalid(format!(
            "start node '{}' is not part of the plan",
            plan.start_node_id
        )));
    }

    for (key, node) in &plan.nodes {
        if key != &node.uuid {
            errors.push(invalid(format!("node '{}' is stored under '{key}'", node.uuid)));
        }
        for child in node.child_node_ids() {
            if !plan.nodes.contains_key(&child) {
                errors.push(invalid(format!(
                    "node '{}' references unknown child '{child}'",
                    node.identifier
                )));
            }
        }
        for target in adviser_targets(node) {
            if !plan.nodes.contains_key(&target) {
                errors.push(invalid(format!(
                    "node '{}' advises towards unknown node '{target}'",
                    node.identifier
                )));
            }
        }
    }

    if errors.is_empty()
        && let Err(e) = check_acyclic(plan)
    {
        errors.push(e);
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

fn invalid(message: String) -> CompilationError {
    CompilationError::InvalidPlan(message)
}

/// Every node id an adviser obtainment may route to.
fn adviser_targets(node: &PlanNode) -> Vec<String> {
    let mut targets = Vec::new();
    for obtainment in &node.adviser_obtainments {
        let params = &obtainment.parameters;
        let after_retry = params.get("after_retry");
        for candidate in [
            params.get("next_node_id"),
            params.get("rollback_node_id"),
            after_retry.and_then(|a| a.get("next_node_id")),
            after_retry.and_then(|a| a.get("rollback_node_id")),
        ]
        .into_iter()
        .flatten()
        {
            if let Some(id) = candidate.as_str() {
                targets.push(id.to_string());
            }
        }
    }
    targets
}

fn advance_target(node: &PlanNode) -> impl Iterator<Item = &str> {
    node.adviser_obtainments
        .iter()
        .filter(|o| o.adviser_type == ADVISER_NEXT_STEP || o.adviser_type == ADVISER_ON_SUCCESS)
        .filter_map(|o| o.parameters.get("next_node_id").and_then(Value::as_str))
}

fn check_acyclic(plan: &Plan) -> Result<(), CompilationError> {
    let mut graph = DiGraph::<&str, ()>::new();
    let indices: HashMap<&str, _> = plan
        .nodes
        .keys()
        .map(|id| (id.as_str(), graph.add_node(id.as_str())))
        .collect();

    for (id, node) in &plan.nodes {
        let from = indices[id.as_str()];
        let children = node.child_node_ids();
        let targets = children
            .iter()
            .map(String::as_str)
            .chain(advance_target(node));
        for target in targets {
            if let Some(to) = indices.get(target) {
                graph.add_edge(from, *to, ());
            }
        }
    }

    toposort(&graph, None).map(|_| ()).map_err(|cycle| {
        let node_id = graph[cycle.node_id()];
        let identifier = plan
            .nodes
            .get(node_id)
            .map(|n| n.identifier.as_str())
            .unwrap_or(node_id);
        invalid(format!("cycle detected involving node '{identifier}'"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_types::plan::{AdviserObtainment, ExecutionMode, StepCategory, StepType};

    fn node(uuid: &str, children: &[&str], next: Option<&str>) -> PlanNode {
        PlanNode {
            uuid: uuid.to_string(),
            identifier: uuid.to_string(),
            name: uuid.to_string(),
            step_type: StepType::new("Noop", StepCategory::Step),
            group: None,
            execution_mode: ExecutionMode::Sync,
            step_parameters: json!({ "children": children }),
            adviser_obtainments: next
                .map(|n| vec![AdviserObtainment::new(ADVISER_NEXT_STEP, json!({ "next_node_id": n }))])
                .unwrap_or_default(),
            when_condition: None,
            skip_condition: None,
            timeout: None,
        }
    }

    fn plan(start: &str, nodes: Vec<PlanNode>) -> Plan {
        Plan {
            id: uuid::Uuid::now_v7(),
            start_node_id: start.to_string(),
            nodes: nodes.into_iter().map(|n| (n.uuid.clone(), n)).collect(),
            definition: json!({}),
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn accepts_tree_with_chained_siblings() {
        let plan = plan(
            "root",
            vec![node("root", &["a"], None), node("a", &[], Some("b")), node("b", &[], None)],
        );
        assert!(validate_plan(&plan).is_ok());
    }

    #[test]
    fn rejects_missing_start_and_dangling_references() {
        let plan = plan("nope", vec![node("a", &["ghost"], Some("phantom"))]);
        let errors = validate_plan(&plan).unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn rejects_advance_cycle() {
        let plan = plan(
            "root",
            vec![node("root", &["a"], None), node("a", &[], Some("b")), node("b", &[], Some("a"))],
        );
        let errors = validate_plan(&plan).unwrap_err();
        assert!(matches!(&errors[0], CompilationError::InvalidPlan(m) if m.contains("cycle")));
    }

    #[test]
    fn rejects_node_nested_in_itself() {
        let plan = plan("root", vec![node("root", &["a"], None), node("a", &["root"], None)]);
        assert!(validate_plan(&plan).is_err());
    }
}
