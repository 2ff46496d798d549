//! Built-in plan creators for the pipeline definition format.
//!
//! ```text
//! pipeline:  { identifier, name?, stages: [element], failure_strategies?, timeout? }
//! stage:     { identifier, name?, steps: [element], rollback_steps?: [element],
//!              when?, skip_condition?, failure_strategies?, timeout? }
//! step_group: same shape as a stage
//! parallel:  { branches: [element] }
//! step:      { identifier, type, name?, spec?, when?, skip_condition?,
//!              failure_strategies?, timeout? }
//! element:   { "<field>": { ... } }   e.g. { "step": { ... } }
//! ```
//!
//! Stages run in order under a `SECTION_CHAIN` pipeline node. Inside a stage
//! or step group only the first step is a child; later steps are reached
//! through `NEXT_STEP` bindings. Failure strategies are compiled into adviser
//! bindings on every step they cover, innermost first.

use anyhow::{Context, anyhow, bail};
use serde_json::{Map, Value, json};
use weft_types::execution::FailureType;
use weft_types::plan::{
    AdviserObtainment, ExecutionMode, PlanNode, StepCategory, StepType, TimeoutSpec,
};

use super::compile::PlanCompiler;
use super::creator::{
    ChildrenPlanCreator, Dependency, DependencyMetadata, PartialPlanResponse,
    PlanCreationContext, SingleNode, SingleNodeCreator, SupportedTypes, WithChildren,
};
use super::definition::{DefinitionPath, PathSegment, UUID_FIELD, uuid_of, without_uuid};
use crate::advise::builtin::{
    ADVISER_IGNORE, ADVISER_MANUAL_INTERVENTION, ADVISER_MARK_FAILURE, ADVISER_MARK_SUCCESS,
    ADVISER_NEXT_STEP, ADVISER_RETRY, ADVISER_ROLLBACK,
};
use crate::step::section::{SECTION_CHAIN, SECTION_CHILDREN};

pub const FIELD_PIPELINE: &str = "pipeline";
pub const FIELD_STAGE: &str = "stage";
pub const FIELD_STEP_GROUP: &str = "step_group";
pub const FIELD_PARALLEL: &str = "parallel";
pub const FIELD_STEP: &str = "step";

/// Register the built-in creators, most specific first.
pub fn register_builtins(compiler: &mut PlanCompiler) {
    compiler.register(WithChildren(PipelineCreator));
    compiler.register(WithChildren(SectionCreator::stage()));
    compiler.register(WithChildren(SectionCreator::step_group()));
    compiler.register(WithChildren(ParallelCreator));
    compiler.register(SingleNode(StepCreator));
}

// ---------------------------------------------------------------------------
// Definition helpers
// ---------------------------------------------------------------------------

fn required_str<'a>(node: &'a Value, field: &str) -> anyhow::Result<&'a str> {
    node.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing required string field '{field}'"))
}

fn optional_str(node: &Value, field: &str) -> Option<String> {
    node.get(field).and_then(Value::as_str).map(str::to_string)
}

/// Display name, defaulting to the identifier. A missing name is written
/// back into the definition.
fn name_of(node: &Value, dependency: &Dependency, response: &mut PartialPlanResponse) -> anyhow::Result<String> {
    let identifier = required_str(node, "identifier")?;
    match optional_str(node, "name") {
        Some(name) => Ok(name),
        None => {
            response
                .definition_updates
                .push((dependency.path.key("name"), json!(identifier)));
            Ok(identifier.to_string())
        }
    }
}

/// Split `{ "<field>": { ... } }` into its field name, body and setup id.
fn element(item: &Value) -> anyhow::Result<(&str, &str)> {
    let map = item
        .as_object()
        .ok_or_else(|| anyhow!("list element must be an object"))?;
    let mut fields = without_uuid(map);
    let (field, body) = fields
        .next()
        .ok_or_else(|| anyhow!("list element is empty"))?;
    if fields.next().is_some() {
        bail!("list element must wrap exactly one node");
    }
    let uuid = uuid_of(body).ok_or_else(|| anyhow!("'{field}' must be an object"))?;
    Ok((field.as_str(), uuid))
}

fn elements<'a>(node: &'a Value, field: &str) -> anyhow::Result<&'a [Value]> {
    match node.get(field) {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(items)) => Ok(items.as_slice()),
        Some(_) => bail!("'{field}' must be a list"),
    }
}

/// One dependency per list element. With `chained`, each element's
/// metadata points at the element after it.
fn element_dependencies(
    items: &[Value],
    base: &DefinitionPath,
    template: &DependencyMetadata,
    chained: bool,
) -> anyhow::Result<Vec<Dependency>> {
    let parsed = items
        .iter()
        .map(element)
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut dependencies = Vec::with_capacity(parsed.len());
    for (i, (field, uuid)) in parsed.iter().enumerate() {
        let mut metadata = template.clone();
        metadata.next_node_uuid = if chained {
            parsed.get(i + 1).map(|(_, next)| next.to_string())
        } else {
            None
        };
        dependencies.push(Dependency::new(*uuid, base.index(i).key(*field)).with_metadata(metadata));
    }
    Ok(dependencies)
}

/// Step parameters without compiler stamps.
fn strip_uuids(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| k.as_str() != UUID_FIELD)
                .map(|(k, v)| (k.clone(), strip_uuids(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(strip_uuids).collect()),
        other => other.clone(),
    }
}

/// `"500ms"`, `"10s"`, `"5m"`, `"1h"` or a bare number of milliseconds.
pub fn parse_duration_ms(value: &Value) -> anyhow::Result<u64> {
    if let Some(ms) = value.as_u64() {
        return Ok(ms);
    }
    let text = value
        .as_str()
        .ok_or_else(|| anyhow!("duration must be a string or a number of milliseconds"))?
        .trim();
    let (digits, factor) = if let Some(d) = text.strip_suffix("ms") {
        (d, 1)
    } else if let Some(d) = text.strip_suffix('s') {
        (d, 1_000)
    } else if let Some(d) = text.strip_suffix('m') {
        (d, 60_000)
    } else if let Some(d) = text.strip_suffix('h') {
        (d, 3_600_000)
    } else {
        (text, 1)
    };
    let amount: u64 = digits
        .trim()
        .parse()
        .with_context(|| format!("invalid duration '{text}'"))?;
    Ok(amount * factor)
}

fn parse_timeout(node: &Value) -> anyhow::Result<Option<TimeoutSpec>> {
    match node.get("timeout") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(spec)) => {
            let duration = spec
                .get("duration")
                .ok_or_else(|| anyhow!("timeout object needs a 'duration'"))?;
            Ok(Some(TimeoutSpec {
                duration_ms: parse_duration_ms(duration)?,
                end_execution_on_expiry: spec
                    .get("end_execution")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }))
        }
        Some(other) => Ok(Some(TimeoutSpec {
            duration_ms: parse_duration_ms(other)?,
            end_execution_on_expiry: false,
        })),
    }
}

// ---------------------------------------------------------------------------
// Failure strategies -> adviser bindings
// ---------------------------------------------------------------------------

fn failure_types(errors: Option<&Value>) -> anyhow::Result<Vec<Value>> {
    let Some(errors) = errors else {
        return Ok(Vec::new());
    };
    let names = errors
        .as_array()
        .ok_or_else(|| anyhow!("'errors' must be a list"))?;
    let mut types = Vec::new();
    for name in names {
        if name.as_str() == Some("ALL_ERRORS") {
            return Ok(Vec::new());
        }
        serde_json::from_value::<FailureType>(name.clone())
            .with_context(|| format!("unknown failure type {name}"))?;
        types.push(name.clone());
    }
    Ok(types)
}

fn rollback_target<'a>(action: &str, metadata: &'a DependencyMetadata) -> anyhow::Result<(&'a str, &'static str)> {
    let target = match action {
        "STEP_GROUP_ROLLBACK" => metadata
            .step_group_rollback_uuid
            .as_deref()
            .or(metadata.stage_rollback_uuid.as_deref()),
        _ => metadata.stage_rollback_uuid.as_deref(),
    };
    let strategy = if action == "STEP_GROUP_ROLLBACK" { "STEP_GROUP" } else { "STAGE" };
    target
        .map(|t| (t, strategy))
        .ok_or_else(|| anyhow!("{action} used without rollback steps in scope"))
}

/// Parameters of the action taken once retries are exhausted.
fn after_retry(action: &Value, metadata: &DependencyMetadata) -> anyhow::Result<Value> {
    let action_type = required_str(action, "type")?;
    let spec = action.get("spec").cloned().unwrap_or(Value::Null);
    Ok(match action_type {
        "ABORT" | "MARK_FAILURE" => json!({ "action": "MARK_FAILURE" }),
        "MARK_SUCCESS" => json!({ "action": "MARK_SUCCESS", "next_node_id": metadata.next_node_uuid }),
        "IGNORE" => json!({ "action": "IGNORE", "next_node_id": metadata.next_node_uuid }),
        "MANUAL_INTERVENTION" => {
            let timeout_ms = spec.get("timeout").map(parse_duration_ms).transpose()?;
            json!({ "action": "MANUAL_INTERVENTION", "timeout_ms": timeout_ms })
        }
        "STAGE_ROLLBACK" | "STEP_GROUP_ROLLBACK" => {
            let (target, strategy) = rollback_target(action_type, metadata)?;
            json!({ "action": "ROLLBACK", "rollback_node_id": target, "strategy": strategy })
        }
        other => bail!("unsupported retry-failure action '{other}'"),
    })
}

/// One `{"on_failure": {"errors": [...], "action": {...}}}` entry.
fn failure_binding(strategy: &Value, metadata: &DependencyMetadata) -> anyhow::Result<AdviserObtainment> {
    let on_failure = strategy
        .get("on_failure")
        .ok_or_else(|| anyhow!("failure strategy must contain 'on_failure'"))?;
    let types = failure_types(on_failure.get("errors"))?;
    let action = on_failure
        .get("action")
        .ok_or_else(|| anyhow!("failure strategy must contain an 'action'"))?;
    let action_type = required_str(action, "type")?;
    let spec = action.get("spec").cloned().unwrap_or(Value::Null);

    let binding = match action_type {
        "RETRY" => {
            let retry_count = spec
                .get("retry_count")
                .and_then(Value::as_u64)
                .ok_or_else(|| anyhow!("RETRY needs a numeric 'retry_count'"))?;
            let intervals = elements(&spec, "retry_intervals")?
                .iter()
                .map(parse_duration_ms)
                .collect::<anyhow::Result<Vec<_>>>()?;
            let mut params = json!({
                "retry_count": retry_count,
                "wait_intervals_ms": intervals,
                "failure_types": types,
            });
            if let Some(then) = spec.get("on_retry_failure").and_then(|f| f.get("action")) {
                params["after_retry"] = after_retry(then, metadata)?;
            }
            AdviserObtainment::new(ADVISER_RETRY, params)
        }
        "MARK_SUCCESS" => AdviserObtainment::new(
            ADVISER_MARK_SUCCESS,
            json!({ "failure_types": types, "next_node_id": metadata.next_node_uuid }),
        ),
        "IGNORE" => AdviserObtainment::new(
            ADVISER_IGNORE,
            json!({ "failure_types": types, "next_node_id": metadata.next_node_uuid }),
        ),
        "MANUAL_INTERVENTION" => {
            let timeout_ms = spec.get("timeout").map(parse_duration_ms).transpose()?;
            AdviserObtainment::new(
                ADVISER_MANUAL_INTERVENTION,
                json!({ "failure_types": types, "timeout_ms": timeout_ms }),
            )
        }
        "STAGE_ROLLBACK" | "STEP_GROUP_ROLLBACK" => {
            let (target, strategy) = rollback_target(action_type, metadata)?;
            AdviserObtainment::new(
                ADVISER_ROLLBACK,
                json!({ "failure_types": types, "rollback_node_id": target, "strategy": strategy }),
            )
        }
        "ABORT" | "MARK_FAILURE" => {
            AdviserObtainment::new(ADVISER_MARK_FAILURE, json!({ "failure_types": types }))
        }
        other => bail!("unsupported failure action '{other}'"),
    };
    Ok(binding)
}

/// Adviser bindings of a node: its own failure strategies, then the
/// inherited ones innermost first, then the success-path advance.
fn adviser_bindings(own: Option<&Value>, metadata: &DependencyMetadata) -> anyhow::Result<Vec<AdviserObtainment>> {
    let own = match own {
        None | Some(Value::Null) => &[][..],
        Some(Value::Array(items)) => items.as_slice(),
        Some(_) => bail!("'failure_strategies' must be a list"),
    };

    let mut bindings = Vec::new();
    for strategy in own.iter().chain(metadata.failure_strategies.iter().rev()) {
        bindings.push(failure_binding(strategy, metadata)?);
    }
    if let Some(next) = &metadata.next_node_uuid {
        bindings.push(AdviserObtainment::new(ADVISER_NEXT_STEP, json!({ "next_node_id": next })));
    }
    Ok(bindings)
}

/// Metadata handed to the children of a section: the section's own
/// strategies are appended to the inherited ones.
fn child_metadata(node: &Value, inherited: &DependencyMetadata) -> anyhow::Result<DependencyMetadata> {
    let mut metadata = DependencyMetadata {
        next_node_uuid: None,
        ..inherited.clone()
    };
    metadata
        .failure_strategies
        .extend(elements(node, "failure_strategies")?.iter().cloned());
    Ok(metadata)
}

fn container_node(
    uuid: &str,
    identifier: &str,
    name: String,
    step_type: StepType,
    mode: ExecutionMode,
    children: Vec<String>,
) -> PlanNode {
    PlanNode {
        uuid: uuid.to_string(),
        identifier: identifier.to_string(),
        name,
        group: Some(category_group(step_type.category).to_string()),
        step_type,
        execution_mode: mode,
        step_parameters: json!({ "children": children }),
        adviser_obtainments: Vec::new(),
        when_condition: None,
        skip_condition: None,
        timeout: None,
    }
}

fn category_group(category: StepCategory) -> &'static str {
    match category {
        StepCategory::Pipeline => "PIPELINE",
        StepCategory::Stage => "STAGE",
        StepCategory::StepGroup => "STEP_GROUP",
        StepCategory::Fork => "FORK",
        StepCategory::Step => "STEP",
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Root node: runs its stages in order.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineCreator;

impl ChildrenPlanCreator for PipelineCreator {
    fn supported_types(&self) -> SupportedTypes {
        SupportedTypes::new().with_any(FIELD_PIPELINE)
    }

    fn create_children(
        &self,
        _ctx: &PlanCreationContext,
        node: &Value,
        dependency: &Dependency,
    ) -> anyhow::Result<PartialPlanResponse> {
        let mut response = PartialPlanResponse::default();
        name_of(node, dependency, &mut response)?;
        let metadata = child_metadata(node, &dependency.metadata)?;
        response.dependencies = element_dependencies(
            elements(node, "stages")?,
            &dependency.path.key("stages"),
            &metadata,
            false,
        )?;
        Ok(response)
    }

    fn entry_points(&self, children: &PartialPlanResponse) -> Vec<String> {
        children.dependencies.iter().map(|d| d.node_uuid.clone()).collect()
    }

    fn create_parent(
        &self,
        _ctx: &PlanCreationContext,
        node: &Value,
        dependency: &Dependency,
        child_ids: Vec<String>,
    ) -> anyhow::Result<PlanNode> {
        let identifier = required_str(node, "identifier")?;
        let name = optional_str(node, "name").unwrap_or_else(|| identifier.to_string());
        let mut parent = container_node(
            &dependency.node_uuid,
            identifier,
            name,
            StepType::new(SECTION_CHAIN, StepCategory::Pipeline),
            ExecutionMode::ChildChain,
            child_ids,
        );
        parent.timeout = parse_timeout(node)?;
        Ok(parent)
    }
}

// ---------------------------------------------------------------------------
// Stage / step group
// ---------------------------------------------------------------------------

/// Stage or step group: a chained list of steps with an optional rollback
/// section run when a covered step fails with a rollback strategy.
#[derive(Debug, Clone, Copy)]
pub struct SectionCreator {
    field: &'static str,
    category: StepCategory,
}

impl SectionCreator {
    pub fn stage() -> Self {
        Self {
            field: FIELD_STAGE,
            category: StepCategory::Stage,
        }
    }

    pub fn step_group() -> Self {
        Self {
            field: FIELD_STEP_GROUP,
            category: StepCategory::StepGroup,
        }
    }

    fn rollback_uuid(uuid: &str) -> String {
        format!("{uuid}_rollback")
    }
}

/// `true` when `path` ends in `steps[0].<field>`.
fn is_first_step(path: &DefinitionPath) -> bool {
    matches!(
        path.segments(),
        [.., PathSegment::Key(list), PathSegment::Index(0), PathSegment::Key(_)] if list == "steps"
    )
}

impl ChildrenPlanCreator for SectionCreator {
    fn supported_types(&self) -> SupportedTypes {
        SupportedTypes::new().with_any(self.field)
    }

    fn create_children(
        &self,
        _ctx: &PlanCreationContext,
        node: &Value,
        dependency: &Dependency,
    ) -> anyhow::Result<PartialPlanResponse> {
        let mut response = PartialPlanResponse::default();
        let identifier = required_str(node, "identifier")?;
        name_of(node, dependency, &mut response)?;

        let mut metadata = child_metadata(node, &dependency.metadata)?;
        let rollback_steps = elements(node, "rollback_steps")?;
        let mut rollback = Vec::new();
        if !rollback_steps.is_empty() {
            let rollback_uuid = Self::rollback_uuid(&dependency.node_uuid);
            match self.category {
                StepCategory::StepGroup => metadata.step_group_rollback_uuid = Some(rollback_uuid.clone()),
                _ => metadata.stage_rollback_uuid = Some(rollback_uuid.clone()),
            }

            // Rollback steps run plainly: no strategies, no nested rollback.
            rollback = element_dependencies(
                rollback_steps,
                &dependency.path.key("rollback_steps"),
                &DependencyMetadata::default(),
                true,
            )?;
            let entry = rollback.first().map(|d| d.node_uuid.clone());
            response.nodes.push(container_node(
                &rollback_uuid,
                &format!("{identifier}_rollback"),
                format!("{identifier} rollback"),
                StepType::new(SECTION_CHILDREN, self.category),
                ExecutionMode::Children,
                entry.into_iter().collect(),
            ));
        }

        response.dependencies = element_dependencies(
            elements(node, "steps")?,
            &dependency.path.key("steps"),
            &metadata,
            true,
        )?;
        response.dependencies.extend(rollback);
        Ok(response)
    }

    fn entry_points(&self, children: &PartialPlanResponse) -> Vec<String> {
        children
            .dependencies
            .iter()
            .find(|d| is_first_step(&d.path))
            .map(|d| vec![d.node_uuid.clone()])
            .unwrap_or_default()
    }

    fn create_parent(
        &self,
        _ctx: &PlanCreationContext,
        node: &Value,
        dependency: &Dependency,
        child_ids: Vec<String>,
    ) -> anyhow::Result<PlanNode> {
        let identifier = required_str(node, "identifier")?;
        let name = optional_str(node, "name").unwrap_or_else(|| identifier.to_string());
        let mut parent = container_node(
            &dependency.node_uuid,
            identifier,
            name,
            StepType::new(SECTION_CHILDREN, self.category),
            ExecutionMode::Children,
            child_ids,
        );
        // The section's own strategies cover its steps, not the section.
        parent.adviser_obtainments = adviser_bindings(None, &dependency.metadata)?;
        parent.when_condition = optional_str(node, "when");
        parent.skip_condition = optional_str(node, "skip_condition");
        parent.timeout = parse_timeout(node)?;
        if let Some(Value::Object(vars)) = node.get("variables") {
            parent.step_parameters["variables"] = strip_uuids(&Value::Object(vars.clone()));
        }
        Ok(parent)
    }
}

// ---------------------------------------------------------------------------
// Parallel
// ---------------------------------------------------------------------------

/// Fork: every branch runs concurrently.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParallelCreator;

impl ChildrenPlanCreator for ParallelCreator {
    fn supported_types(&self) -> SupportedTypes {
        SupportedTypes::new().with_any(FIELD_PARALLEL)
    }

    fn create_children(
        &self,
        _ctx: &PlanCreationContext,
        node: &Value,
        dependency: &Dependency,
    ) -> anyhow::Result<PartialPlanResponse> {
        let metadata = DependencyMetadata {
            next_node_uuid: None,
            ..dependency.metadata.clone()
        };
        Ok(PartialPlanResponse {
            dependencies: element_dependencies(
                elements(node, "branches")?,
                &dependency.path.key("branches"),
                &metadata,
                false,
            )?,
            ..PartialPlanResponse::default()
        })
    }

    fn entry_points(&self, children: &PartialPlanResponse) -> Vec<String> {
        children.dependencies.iter().map(|d| d.node_uuid.clone()).collect()
    }

    fn create_parent(
        &self,
        _ctx: &PlanCreationContext,
        node: &Value,
        dependency: &Dependency,
        child_ids: Vec<String>,
    ) -> anyhow::Result<PlanNode> {
        let identifier = optional_str(node, "identifier")
            .unwrap_or_else(|| format!("parallel_{}", &dependency.node_uuid));
        let mut parent = container_node(
            &dependency.node_uuid,
            &identifier,
            identifier.clone(),
            StepType::new(SECTION_CHILDREN, StepCategory::Fork),
            ExecutionMode::Children,
            child_ids,
        );
        parent.adviser_obtainments = adviser_bindings(None, &dependency.metadata)?;
        Ok(parent)
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// Leaf step of any registered type.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepCreator;

impl SingleNodeCreator for StepCreator {
    fn supported_types(&self) -> SupportedTypes {
        SupportedTypes::new().with_any(FIELD_STEP)
    }

    fn create_node(
        &self,
        ctx: &PlanCreationContext,
        node: &Value,
        dependency: &Dependency,
    ) -> anyhow::Result<PlanNode> {
        let identifier = required_str(node, "identifier")?;
        let step_type = required_str(node, "type")?;
        let mode = ctx
            .steps
            .mode_of(step_type)
            .ok_or_else(|| anyhow!("step type '{step_type}' is not registered"))?;

        let step_parameters = match node.get("spec") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(spec @ Value::Object(_)) => strip_uuids(spec),
            Some(_) => bail!("'spec' must be an object"),
        };

        Ok(PlanNode {
            uuid: dependency.node_uuid.clone(),
            identifier: identifier.to_string(),
            name: optional_str(node, "name").unwrap_or_else(|| identifier.to_string()),
            step_type: StepType::new(step_type, StepCategory::Step),
            group: None,
            execution_mode: mode,
            step_parameters,
            adviser_obtainments: adviser_bindings(node.get("failure_strategies"), &dependency.metadata)?,
            when_condition: optional_str(node, "when"),
            skip_condition: optional_str(node, "skip_condition"),
            timeout: parse_timeout(node)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::step::{StepContext, StepRegistry, SyncExecutable};
    use weft_types::config::EngineConfig;
    use weft_types::execution::StepResponse;
    use weft_types::plan::Plan;

    struct Noop;

    impl SyncExecutable for Noop {
        async fn execute(&self, _ctx: &StepContext, _params: &Value) -> anyhow::Result<StepResponse> {
            Ok(StepResponse::succeeded())
        }
    }

    fn compiler() -> PlanCompiler {
        let mut steps = StepRegistry::with_sections();
        steps.register_sync("Noop", Noop);
        PlanCompiler::with_builtins(Arc::new(steps), &EngineConfig::default())
    }

    fn by_identifier<'a>(plan: &'a Plan, identifier: &str) -> &'a PlanNode {
        plan.nodes
            .values()
            .find(|n| n.identifier == identifier)
            .unwrap_or_else(|| panic!("no node '{identifier}'"))
    }

    fn pipeline() -> Value {
        json!({
            "pipeline": {
                "identifier": "deploy",
                "stages": [
                    { "stage": {
                        "identifier": "build",
                        "failure_strategies": [
                            { "on_failure": { "errors": ["ALL_ERRORS"], "action": { "type": "STAGE_ROLLBACK" } } }
                        ],
                        "steps": [
                            { "step": {
                                "identifier": "compile",
                                "type": "Noop",
                                "timeout": "10s",
                                "failure_strategies": [
                                    { "on_failure": {
                                        "errors": ["CONNECTIVITY"],
                                        "action": { "type": "RETRY", "spec": {
                                            "retry_count": 2,
                                            "retry_intervals": ["1s", "5s"],
                                            "on_retry_failure": { "action": { "type": "MARK_FAILURE" } }
                                        } }
                                    } }
                                ]
                            } },
                            { "step_group": {
                                "identifier": "checks",
                                "steps": [
                                    { "step": { "identifier": "lint", "type": "Noop" } },
                                    { "step": { "identifier": "test", "type": "Noop" } }
                                ]
                            } },
                            { "parallel": { "branches": [
                                { "step": { "identifier": "left", "type": "Noop" } },
                                { "step": { "identifier": "right", "type": "Noop" } }
                            ] } }
                        ],
                        "rollback_steps": [
                            { "step": { "identifier": "undo", "type": "Noop" } }
                        ]
                    } },
                    { "stage": {
                        "identifier": "ship",
                        "when": "status == 'SUCCEEDED'",
                        "steps": [ { "step": { "identifier": "push", "type": "Noop", "spec": { "target": "prod" } } } ]
                    } }
                ]
            }
        })
    }

    #[tokio::test]
    async fn compiles_full_pipeline() {
        let plan = compiler().compile(pipeline()).await.unwrap();

        // pipeline, 2 stages, rollback section, group, parallel, 7 steps
        assert_eq!(plan.nodes.len(), 13);

        let root = plan.start_node().unwrap();
        assert_eq!(root.identifier, "deploy");
        assert_eq!(root.execution_mode, ExecutionMode::ChildChain);
        assert_eq!(root.child_node_ids().len(), 2);

        let build = by_identifier(&plan, "build");
        assert_eq!(build.child_node_ids(), vec![by_identifier(&plan, "compile").uuid.clone()]);
        assert!(build.adviser_obtainments.is_empty());
    }

    #[tokio::test]
    async fn strategies_bind_innermost_first_then_advance() {
        let plan = compiler().compile(pipeline()).await.unwrap();
        let compile = by_identifier(&plan, "compile");
        let types: Vec<&str> = compile
            .adviser_obtainments
            .iter()
            .map(|o| o.adviser_type.as_str())
            .collect();
        assert_eq!(types, vec![ADVISER_RETRY, ADVISER_ROLLBACK, ADVISER_NEXT_STEP]);

        let retry = &compile.adviser_obtainments[0].parameters;
        assert_eq!(retry["wait_intervals_ms"], json!([1000, 5000]));
        assert_eq!(retry["failure_types"], json!(["CONNECTIVITY"]));
        assert_eq!(retry["after_retry"]["action"], "MARK_FAILURE");

        let rollback = &compile.adviser_obtainments[1].parameters;
        assert_eq!(rollback["rollback_node_id"], json!(format!("{}_rollback", by_identifier(&plan, "build").uuid)));
        assert_eq!(rollback["strategy"], "STAGE");

        let checks = by_identifier(&plan, "checks");
        assert_eq!(compile.adviser_obtainments[2].parameters["next_node_id"], json!(checks.uuid));
        assert_eq!(compile.timeout.unwrap().duration_ms, 10_000);
    }

    #[tokio::test]
    async fn parallel_branches_and_group_chain() {
        let plan = compiler().compile(pipeline()).await.unwrap();
        let fork = plan
            .nodes
            .values()
            .find(|n| n.step_type.category == StepCategory::Fork)
            .unwrap();
        assert_eq!(fork.child_node_ids().len(), 2);
        // Branches end their fork; they do not advance.
        let left = by_identifier(&plan, "left");
        assert!(!left.adviser_obtainments.iter().any(|o| o.adviser_type == ADVISER_NEXT_STEP));

        let lint = by_identifier(&plan, "lint");
        let test = by_identifier(&plan, "test");
        assert!(lint
            .adviser_obtainments
            .iter()
            .any(|o| o.adviser_type == ADVISER_NEXT_STEP && o.parameters["next_node_id"] == json!(test.uuid)));
    }

    #[tokio::test]
    async fn step_details_and_name_defaults() {
        let plan = compiler().compile(pipeline()).await.unwrap();
        let push = by_identifier(&plan, "push");
        assert_eq!(push.step_parameters, json!({ "target": "prod" }));
        assert_eq!(push.execution_mode, ExecutionMode::Sync);
        assert!(by_identifier(&plan, "ship").when_condition.is_some());
        assert_eq!(plan.definition["pipeline"]["name"], "deploy");
        assert_eq!(plan.definition["pipeline"]["stages"][0]["stage"]["name"], "build");
    }

    #[tokio::test]
    async fn unregistered_step_type_fails_compilation() {
        let err = compiler()
            .compile(json!({
                "pipeline": { "identifier": "p", "stages": [
                    { "stage": { "identifier": "s", "steps": [
                        { "step": { "identifier": "x", "type": "Shell" } }
                    ] } }
                ] }
            }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("'Shell' is not registered"));
    }

    #[tokio::test]
    async fn rollback_strategy_requires_rollback_steps() {
        let err = compiler()
            .compile(json!({
                "pipeline": { "identifier": "p", "stages": [
                    { "stage": { "identifier": "s", "steps": [
                        { "step": { "identifier": "x", "type": "Noop", "failure_strategies": [
                            { "on_failure": { "errors": [], "action": { "type": "STAGE_ROLLBACK" } } }
                        ] } }
                    ] } }
                ] }
            }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("without rollback steps"));
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration_ms(&json!("500ms")).unwrap(), 500);
        assert_eq!(parse_duration_ms(&json!("10s")).unwrap(), 10_000);
        assert_eq!(parse_duration_ms(&json!("5m")).unwrap(), 300_000);
        assert_eq!(parse_duration_ms(&json!("1h")).unwrap(), 3_600_000);
        assert_eq!(parse_duration_ms(&json!(250)).unwrap(), 250);
        assert!(parse_duration_ms(&json!("soon")).is_err());
    }
}
