use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use weft_types::config::EngineConfig;
use weft_types::plan::{Plan, PlanNode};

use super::creator::{ANY_TYPE, Dependency, PlanCreationContext, PlanCreatorDyn};
use super::creators;
use super::definition::{DefinitionPath, DefinitionTree, UUID_FIELD, uuid_of};
use super::validate::validate_plan;
use super::{CompilationError, CompilationErrors};
use crate::step::StepRegistry;

/// Outcome of compiling a batch of dependencies.
#[derive(Debug, Clone, Default)]
pub struct CompilationResponse {
    pub nodes: HashMap<String, PlanNode>,
    /// Dependencies discovered during the batch that no creator supports.
    /// Entries of the requested batch itself are reported as errors instead.
    pub unresolved: Vec<Dependency>,
    pub errors: Vec<CompilationError>,
    /// Start node contributed by the first requested dependency.
    pub start_node_id: Option<String>,
    pub rounds: usize,
    /// Creator invocations that ran.
    pub invocations: usize,
}

/// Compiles definition trees with an ordered list of plan creators.
pub struct PlanCompiler {
    creators: Vec<Arc<dyn PlanCreatorDyn>>,
    steps: Arc<StepRegistry>,
    max_concurrency: usize,
    max_rounds: usize,
}

impl PlanCompiler {
    /// Compiler with no creators registered.
    pub fn new(steps: Arc<StepRegistry>, config: &EngineConfig) -> Self {
        Self {
            creators: Vec::new(),
            steps,
            max_concurrency: config.compiler_max_concurrency.max(1),
            max_rounds: config.max_compile_rounds.max(1),
        }
    }

    /// Compiler with the built-in pipeline, stage, step group, parallel and
    /// step creators.
    pub fn with_builtins(steps: Arc<StepRegistry>, config: &EngineConfig) -> Self {
        let mut compiler = Self::new(steps, config);
        creators::register_builtins(&mut compiler);
        compiler
    }

    /// Append a creator. Earlier registrations win on overlapping types.
    pub fn register(&mut self, creator: impl PlanCreatorDyn + 'static) {
        self.creators.push(Arc::new(creator));
    }

    pub fn creator_count(&self) -> usize {
        self.creators.len()
    }

    /// First creator, in registration order, supporting `field` + `type_tag`.
    fn select(&self, field: &str, type_tag: &str) -> Option<Arc<dyn PlanCreatorDyn>> {
        self.creators
            .iter()
            .find(|c| c.supported_types().matches(field, type_tag))
            .cloned()
    }

    /// Compile a whole definition into a validated plan.
    ///
    /// The definition's top-level object fields are the roots; the first
    /// root provides the plan's start node.
    pub async fn compile(&self, definition: Value) -> Result<Plan, CompilationErrors> {
        let mut tree = DefinitionTree::new(definition);
        let roots = root_dependencies(&tree)?;
        let ctx = Arc::new(PlanCreationContext::new(Arc::clone(&self.steps)));

        let response = self.compile_dependencies(&ctx, &mut tree, roots).await;
        let mut errors = response.errors;
        for dependency in &response.unresolved {
            errors.push(no_matching_creator(&tree, &dependency.path));
        }
        if !errors.is_empty() {
            return Err(CompilationErrors(errors));
        }

        let start_node_id = response
            .start_node_id
            .ok_or_else(|| CompilationError::InvalidPlan("no start node was produced".to_string()))?;
        let plan = Plan {
            id: ctx.plan_id,
            start_node_id,
            nodes: response.nodes,
            definition: tree.into_value(),
            created_at: chrono::Utc::now(),
        };
        validate_plan(&plan).map_err(CompilationErrors)?;

        tracing::info!(
            plan_id = %plan.id,
            nodes = plan.nodes.len(),
            rounds = response.rounds,
            "plan compiled"
        );
        Ok(plan)
    }

    /// Resolve `dependencies` and everything they transitively depend on.
    ///
    /// Failed entries contribute nothing further; other branches continue
    /// and all errors are returned together.
    pub async fn compile_dependencies(
        &self,
        ctx: &Arc<PlanCreationContext>,
        tree: &mut DefinitionTree,
        dependencies: Vec<Dependency>,
    ) -> CompilationResponse {
        let mut response = CompilationResponse::default();
        let requested: HashSet<String> = dependencies.iter().map(|d| d.node_uuid.clone()).collect();
        let start_uuid = dependencies.first().map(|d| d.node_uuid.clone());
        let mut resolved: HashSet<String> = HashSet::new();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut pending = dependencies;

        while !pending.is_empty() {
            if response.rounds >= self.max_rounds {
                response.errors.push(CompilationError::InvalidDefinition(format!(
                    "compilation did not converge after {} rounds",
                    self.max_rounds
                )));
                break;
            }
            response.rounds += 1;
            tracing::debug!(round = response.rounds, pending = pending.len(), "compile round");

            let mut join_set = JoinSet::new();
            for dependency in pending.drain(..) {
                // Each definition node compiles at most once.
                if !resolved.insert(dependency.node_uuid.clone()) {
                    continue;
                }
                let path = tree
                    .find_uuid(&dependency.node_uuid)
                    .unwrap_or_else(|| dependency.path.clone());
                let Some(node) = tree.resolve(&path).cloned() else {
                    response.errors.push(CompilationError::InvalidDefinition(format!(
                        "dependency {} not found at {path}",
                        dependency.node_uuid
                    )));
                    continue;
                };

                let field = path.field_name().unwrap_or_default();
                let type_tag = node.get("type").and_then(Value::as_str).unwrap_or(ANY_TYPE);
                let Some(creator) = self.select(field, type_tag) else {
                    let dependency = Dependency { path, ..dependency };
                    if requested.contains(&dependency.node_uuid) {
                        response.errors.push(no_matching_creator(tree, &dependency.path));
                    } else {
                        response.unresolved.push(dependency);
                    }
                    continue;
                };

                let dependency = Dependency { path, ..dependency };
                let ctx = Arc::clone(ctx);
                let semaphore = Arc::clone(&semaphore);
                response.invocations += 1;
                join_set.spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    let result = creator.create_plan_boxed(&ctx, &node, &dependency).await;
                    (dependency, result)
                });
            }

            let mut rewrites: HashMap<DefinitionPath, Value> = HashMap::new();
            while let Some(joined) = join_set.join_next().await {
                let (dependency, result) = match joined {
                    Ok(done) => done,
                    Err(e) => {
                        response.errors.push(CompilationError::Join(e.to_string()));
                        continue;
                    }
                };
                let path = dependency.path.to_string();
                let partial = match result {
                    Ok(partial) => partial,
                    Err(e) => {
                        tracing::warn!(path = %path, error = %e, "plan creator failed");
                        response.errors.push(CompilationError::CreatorFailed {
                            path,
                            message: format!("{e:#}"),
                        });
                        continue;
                    }
                };
                if !partial.errors.is_empty() {
                    for message in partial.errors {
                        response.errors.push(CompilationError::CreatorFailed {
                            path: path.clone(),
                            message,
                        });
                    }
                    continue;
                }

                if start_uuid.as_deref() == Some(dependency.node_uuid.as_str()) {
                    response.start_node_id = partial
                        .start_node_id
                        .clone()
                        .or_else(|| partial.nodes.first().map(|n| n.uuid.clone()));
                }
                for node in partial.nodes {
                    if response.nodes.contains_key(&node.uuid) {
                        response.errors.push(CompilationError::InvalidPlan(format!(
                            "node '{}' produced twice",
                            node.uuid
                        )));
                        continue;
                    }
                    response.nodes.insert(node.uuid.clone(), node);
                }
                for (target, value) in partial.definition_updates {
                    match rewrites.get(&target) {
                        Some(existing) if *existing != value => {
                            response.errors.push(CompilationError::RewriteConflict {
                                path: target.to_string(),
                            });
                        }
                        _ => {
                            rewrites.insert(target, value);
                        }
                    }
                }
                pending.extend(partial.dependencies);
            }

            for (target, value) in rewrites {
                if let Err(e) = tree.set(&target, value) {
                    response.errors.push(e);
                }
            }
        }

        response
    }
}

fn root_dependencies(tree: &DefinitionTree) -> Result<Vec<Dependency>, CompilationErrors> {
    let Some(root) = tree.root().as_object() else {
        return Err(CompilationError::InvalidDefinition("definition root must be an object".to_string()).into());
    };
    let roots: Vec<Dependency> = root
        .iter()
        .filter(|(key, value)| key.as_str() != UUID_FIELD && value.is_object())
        .filter_map(|(key, value)| {
            uuid_of(value).map(|uuid| Dependency::new(uuid, DefinitionPath::root().key(key.as_str())))
        })
        .collect();
    if roots.is_empty() {
        return Err(CompilationError::InvalidDefinition("definition has no root node".to_string()).into());
    }
    Ok(roots)
}

fn no_matching_creator(tree: &DefinitionTree, path: &DefinitionPath) -> CompilationError {
    let type_tag = tree
        .resolve(path)
        .and_then(|v| v.get("type"))
        .and_then(Value::as_str)
        .unwrap_or(ANY_TYPE);
    CompilationError::NoMatchingCreator {
        field: path.field_name().unwrap_or_default().to_string(),
        type_tag: type_tag.to_string(),
        path: path.to_string(),
    }
}
