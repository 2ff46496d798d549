//! Plan creator contract.
//!
//! A plan creator compiles one kind of definition node (matched by field
//! name and `type`) into plan nodes, and reports the child definition nodes
//! it needs compiled next as [`Dependency`] entries.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use uuid::Uuid;
use weft_types::plan::PlanNode;

use super::definition::DefinitionPath;
use crate::step::StepRegistry;

/// Wildcard accepted in [`SupportedTypes`].
pub const ANY_TYPE: &str = "__any";

// ---------------------------------------------------------------------------
// SupportedTypes
// ---------------------------------------------------------------------------

/// Field name -> accepted `type` values.
#[derive(Debug, Clone, Default)]
pub struct SupportedTypes {
    fields: HashMap<String, Vec<String>>,
}

impl SupportedTypes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: &str, types: &[&str]) -> Self {
        self.fields
            .entry(field.to_string())
            .or_default()
            .extend(types.iter().map(|t| t.to_string()));
        self
    }

    /// Accept any `type` under `field`.
    pub fn with_any(self, field: &str) -> Self {
        self.with(field, &[ANY_TYPE])
    }

    pub fn matches(&self, field: &str, type_tag: &str) -> bool {
        self.fields
            .get(field)
            .is_some_and(|types| types.iter().any(|t| t == ANY_TYPE || t == type_tag))
    }
}

// ---------------------------------------------------------------------------
// Dependencies and responses
// ---------------------------------------------------------------------------

/// Resolved sibling information handed down to a dependency.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencyMetadata {
    /// Setup id of the sibling to advance to on success.
    pub next_node_uuid: Option<String>,
    /// Setup id of the enclosing stage's rollback section.
    pub stage_rollback_uuid: Option<String>,
    /// Setup id of the enclosing step group's rollback section.
    pub step_group_rollback_uuid: Option<String>,
    /// Failure strategies inherited from enclosing sections, innermost last.
    pub failure_strategies: Vec<Value>,
}

/// A definition node waiting to be compiled.
#[derive(Debug, Clone, PartialEq)]
pub struct Dependency {
    pub node_uuid: String,
    pub path: DefinitionPath,
    pub metadata: DependencyMetadata,
}

impl Dependency {
    pub fn new(node_uuid: impl Into<String>, path: DefinitionPath) -> Self {
        Self {
            node_uuid: node_uuid.into(),
            path,
            metadata: DependencyMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: DependencyMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// What one creator invocation contributes.
#[derive(Debug, Clone, Default)]
pub struct PartialPlanResponse {
    pub nodes: Vec<PlanNode>,
    pub dependencies: Vec<Dependency>,
    /// Rewrites of the definition tree (e.g. injected defaults).
    pub definition_updates: Vec<(DefinitionPath, Value)>,
    pub errors: Vec<String>,
    pub start_node_id: Option<String>,
}

impl PartialPlanResponse {
    pub fn node(node: PlanNode) -> Self {
        Self {
            nodes: vec![node],
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            errors: vec![message.into()],
            ..Self::default()
        }
    }

    pub fn merge(&mut self, other: PartialPlanResponse) {
        self.nodes.extend(other.nodes);
        self.dependencies.extend(other.dependencies);
        self.definition_updates.extend(other.definition_updates);
        self.errors.extend(other.errors);
        if self.start_node_id.is_none() {
            self.start_node_id = other.start_node_id;
        }
    }
}

/// Shared, read-only inputs of a compilation.
#[derive(Debug, Clone)]
pub struct PlanCreationContext {
    pub plan_id: Uuid,
    pub steps: Arc<StepRegistry>,
}

impl PlanCreationContext {
    pub fn new(steps: Arc<StepRegistry>) -> Self {
        Self {
            plan_id: Uuid::now_v7(),
            steps,
        }
    }
}

// ---------------------------------------------------------------------------
// PlanCreator
// ---------------------------------------------------------------------------

/// Compiles one kind of definition node.
pub trait PlanCreator: Send + Sync {
    fn supported_types(&self) -> SupportedTypes;

    /// `node` is the definition value at `dependency.path`.
    fn create_plan(
        &self,
        ctx: &PlanCreationContext,
        node: &Value,
        dependency: &Dependency,
    ) -> impl Future<Output = anyhow::Result<PartialPlanResponse>> + Send;
}

/// Object-safe twin of [`PlanCreator`] for the compiler's creator list.
pub trait PlanCreatorDyn: Send + Sync {
    fn supported_types(&self) -> SupportedTypes;

    fn create_plan_boxed<'a>(
        &'a self,
        ctx: &'a PlanCreationContext,
        node: &'a Value,
        dependency: &'a Dependency,
    ) -> BoxFuture<'a, anyhow::Result<PartialPlanResponse>>;
}

impl<T: PlanCreator> PlanCreatorDyn for T {
    fn supported_types(&self) -> SupportedTypes {
        PlanCreator::supported_types(self)
    }

    fn create_plan_boxed<'a>(
        &'a self,
        ctx: &'a PlanCreationContext,
        node: &'a Value,
        dependency: &'a Dependency,
    ) -> BoxFuture<'a, anyhow::Result<PartialPlanResponse>> {
        Box::pin(self.create_plan(ctx, node, dependency))
    }
}

// ---------------------------------------------------------------------------
// Convenience shapes
// ---------------------------------------------------------------------------

/// A creator producing exactly one node and no dependencies.
pub trait SingleNodeCreator: Send + Sync {
    fn supported_types(&self) -> SupportedTypes;

    fn create_node(
        &self,
        ctx: &PlanCreationContext,
        node: &Value,
        dependency: &Dependency,
    ) -> anyhow::Result<PlanNode>;
}

/// A container creator: computes its children first, then wraps them in a
/// parent node whose children are the compiled entry points.
pub trait ChildrenPlanCreator: Send + Sync {
    fn supported_types(&self) -> SupportedTypes;

    /// Child dependencies plus any nodes compiled inline. The returned
    /// `start_node_id`s of children are ignored.
    fn create_children(
        &self,
        ctx: &PlanCreationContext,
        node: &Value,
        dependency: &Dependency,
    ) -> anyhow::Result<PartialPlanResponse>;

    /// Setup ids the parent node fans out to.
    fn entry_points(&self, children: &PartialPlanResponse) -> Vec<String> {
        children
            .dependencies
            .first()
            .map(|d| vec![d.node_uuid.clone()])
            .unwrap_or_default()
    }

    fn create_parent(
        &self,
        ctx: &PlanCreationContext,
        node: &Value,
        dependency: &Dependency,
        child_ids: Vec<String>,
    ) -> anyhow::Result<PlanNode>;
}

/// Adapts a [`SingleNodeCreator`] to [`PlanCreator`].
#[derive(Debug, Clone, Copy)]
pub struct SingleNode<C>(pub C);

impl<C: SingleNodeCreator> PlanCreator for SingleNode<C> {
    fn supported_types(&self) -> SupportedTypes {
        self.0.supported_types()
    }

    async fn create_plan(
        &self,
        ctx: &PlanCreationContext,
        node: &Value,
        dependency: &Dependency,
    ) -> anyhow::Result<PartialPlanResponse> {
        Ok(PartialPlanResponse::node(self.0.create_node(ctx, node, dependency)?))
    }
}

/// Adapts a [`ChildrenPlanCreator`] to [`PlanCreator`].
#[derive(Debug, Clone, Copy)]
pub struct WithChildren<C>(pub C);

impl<C: ChildrenPlanCreator> PlanCreator for WithChildren<C> {
    fn supported_types(&self) -> SupportedTypes {
        self.0.supported_types()
    }

    async fn create_plan(
        &self,
        ctx: &PlanCreationContext,
        node: &Value,
        dependency: &Dependency,
    ) -> anyhow::Result<PartialPlanResponse> {
        let mut response = self.0.create_children(ctx, node, dependency)?;
        let child_ids = self.0.entry_points(&response);
        let parent = self.0.create_parent(ctx, node, dependency, child_ids)?;
        response.start_node_id = Some(parent.uuid.clone());
        response.nodes.insert(0, parent);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_types_match_exact_and_wildcard() {
        let types = SupportedTypes::new()
            .with("step", &["ShellScript", "Http"])
            .with_any("stage");
        assert!(types.matches("step", "Http"));
        assert!(!types.matches("step", "Approval"));
        assert!(types.matches("stage", "Deployment"));
        assert!(!types.matches("pipeline", "Deployment"));
    }

    #[test]
    fn merge_keeps_first_start_node() {
        let mut response = PartialPlanResponse {
            start_node_id: Some("a".to_string()),
            ..PartialPlanResponse::default()
        };
        response.merge(PartialPlanResponse {
            start_node_id: Some("b".to_string()),
            errors: vec!["bad".to_string()],
            ..PartialPlanResponse::default()
        });
        assert_eq!(response.start_node_id.as_deref(), Some("a"));
        assert_eq!(response.errors, vec!["bad"]);
    }
}
