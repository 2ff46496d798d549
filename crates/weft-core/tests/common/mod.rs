#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use uuid::Uuid;
use weft_core::compiler::PlanCompiler;
use weft_core::engine::OrchestrationEngine;
use weft_core::repository::memory::InMemoryRepository;
use weft_core::step::{
    AsyncExecutable, AsyncStart, StepContext, StepRegistry, SyncExecutable, TaskExecutable,
    TaskRequest,
};
use weft_core::task_queue::{InMemoryTaskQueue, TaskDispatcherDyn};
use weft_types::config::EngineConfig;
use weft_types::execution::{FailureInfo, FailureType, NodeExecution, StepResponse};
use weft_types::task::TaskDescriptor;
use weft_types::waitnotify::ResponseMap;

pub type Engine = OrchestrationEngine<InMemoryRepository>;

/// How long an interrupt waits for an executor's acknowledgement.
pub const ACK_TIMEOUT_MS: u64 = 500;

// ---------------------------------------------------------------------------
// Step handlers
// ---------------------------------------------------------------------------

pub struct Succeed;

impl SyncExecutable for Succeed {
    async fn execute(&self, _ctx: &StepContext, _params: &Value) -> anyhow::Result<StepResponse> {
        Ok(StepResponse::succeeded())
    }
}

/// Fails with CONNECTIVITY until it has been called `failures` times.
pub struct Flaky {
    pub calls: Arc<AtomicUsize>,
    pub failures: usize,
}

impl SyncExecutable for Flaky {
    async fn execute(&self, _ctx: &StepContext, _params: &Value) -> anyhow::Result<StepResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Ok(StepResponse::failed(FailureInfo::new(
                "connection refused",
                vec![FailureType::Connectivity],
            )));
        }
        Ok(StepResponse::succeeded())
    }
}

/// Waits on the callback ids listed in `spec.ids`.
pub struct Callbacks {
    pub resumes: Arc<AtomicUsize>,
}

impl AsyncExecutable for Callbacks {
    async fn start(&self, _ctx: &StepContext, params: &Value) -> anyhow::Result<AsyncStart> {
        let callback_ids = params["ids"]
            .as_array()
            .map(|ids| ids.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        Ok(AsyncStart {
            callback_ids,
            ..AsyncStart::default()
        })
    }

    async fn resume(
        &self,
        _ctx: &StepContext,
        _params: &Value,
        responses: &ResponseMap,
    ) -> anyhow::Result<StepResponse> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        let mut response = StepResponse::succeeded();
        response.outcome = Some(json!({ "responses": responses.len() }));
        Ok(response)
    }
}

/// Never returns; stands in for work lost when the process stops.
pub struct Hang;

impl SyncExecutable for Hang {
    async fn execute(&self, _ctx: &StepContext, _params: &Value) -> anyhow::Result<StepResponse> {
        std::future::pending::<()>().await;
        Ok(StepResponse::succeeded())
    }
}

/// Hands its work to the task queue.
pub struct Dispatch {
    pub aborts: Arc<AtomicUsize>,
}

impl TaskExecutable for Dispatch {
    async fn obtain_task(&self, ctx: &StepContext, params: &Value) -> anyhow::Result<TaskRequest> {
        Ok(TaskRequest::Dispatch(TaskDescriptor {
            node_execution_id: ctx.node_execution_id,
            category: "shell".to_string(),
            capabilities: vec![],
            log_keys: vec![],
            parameters: params.clone(),
            timeout_ms: None,
        }))
    }

    async fn handle_task_result(
        &self,
        _ctx: &StepContext,
        _params: &Value,
        _responses: &ResponseMap,
    ) -> anyhow::Result<StepResponse> {
        Ok(StepResponse::succeeded())
    }

    async fn handle_abort(&self, _ctx: &StepContext, _params: &Value, _task_id: &str) -> anyhow::Result<()> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub engine: Arc<Engine>,
    pub compiler: PlanCompiler,
    pub repo: Arc<InMemoryRepository>,
    pub queue: Arc<InMemoryTaskQueue>,
    pub flaky_calls: Arc<AtomicUsize>,
    pub resumes: Arc<AtomicUsize>,
    pub aborts: Arc<AtomicUsize>,
}

impl Harness {
    /// Engine over in-memory storage with `Succeed`, `Flaky` (fails once),
    /// `Callbacks`, `Dispatch` and `Hang` step types.
    pub fn new() -> Self {
        Self::build(Arc::new(InMemoryRepository::new()), None)
    }

    /// Same, but tasks go through `dispatcher`.
    pub fn with_dispatcher(dispatcher: Arc<dyn TaskDispatcherDyn>) -> Self {
        Self::build(Arc::new(InMemoryRepository::new()), Some(dispatcher))
    }

    /// A fresh engine over this harness's storage, as after a restart.
    pub fn restarted(&self) -> Self {
        Self::build(Arc::clone(&self.repo), None)
    }

    fn build(repo: Arc<InMemoryRepository>, dispatcher: Option<Arc<dyn TaskDispatcherDyn>>) -> Self {
        let flaky_calls = Arc::new(AtomicUsize::new(0));
        let resumes = Arc::new(AtomicUsize::new(0));
        let aborts = Arc::new(AtomicUsize::new(0));

        let mut steps = StepRegistry::with_sections();
        steps.register_sync("Succeed", Succeed);
        steps.register_sync("Hang", Hang);
        steps.register_sync(
            "Flaky",
            Flaky {
                calls: Arc::clone(&flaky_calls),
                failures: 1,
            },
        );
        steps.register_async(
            "Callbacks",
            Callbacks {
                resumes: Arc::clone(&resumes),
            },
        );
        steps.register_task(
            "Dispatch",
            Dispatch {
                aborts: Arc::clone(&aborts),
            },
        );
        let steps = Arc::new(steps);

        let config = EngineConfig {
            interrupt_ack_timeout_ms: ACK_TIMEOUT_MS,
            ..EngineConfig::default()
        };
        let queue = Arc::new(InMemoryTaskQueue::new());
        let dispatcher = dispatcher.unwrap_or_else(|| queue.clone() as Arc<dyn TaskDispatcherDyn>);
        let engine = Arc::new(OrchestrationEngine::new(
            Arc::clone(&repo),
            Arc::clone(&steps),
            dispatcher,
            config.clone(),
        ));

        Self {
            engine,
            compiler: PlanCompiler::with_builtins(steps, &config),
            repo,
            queue,
            flaky_calls,
            resumes,
            aborts,
        }
    }

    /// Compile, register and start `definition`. Returns the plan
    /// execution id.
    pub async fn run(&self, definition: Value) -> Uuid {
        let plan = self.compiler.compile(definition).await.unwrap();
        let plan = self.engine.register_plan(plan).await.unwrap();
        self.engine
            .start_plan_execution(plan.id, Default::default())
            .await
            .unwrap()
            .id
    }

    /// Latest record of the node with `identifier`.
    pub async fn record(&self, plan_execution_id: Uuid, identifier: &str) -> Option<NodeExecution> {
        self.engine
            .node_executions(plan_execution_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.identifier == identifier)
            .max_by_key(|r| r.retry_ids.len())
    }

    pub async fn records(&self, plan_execution_id: Uuid, identifier: &str) -> Vec<NodeExecution> {
        self.engine
            .node_executions(plan_execution_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.identifier == identifier)
            .collect()
    }

    /// Poll until the latest record of `identifier` satisfies `check`.
    pub async fn wait_for_record(
        &self,
        plan_execution_id: Uuid,
        identifier: &str,
        check: impl Fn(&NodeExecution) -> bool,
    ) -> NodeExecution {
        for _ in 0..200 {
            if let Some(record) = self.record(plan_execution_id, identifier).await
                && check(&record)
            {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("record '{identifier}' never reached the expected state");
    }

    /// Poll until the plan execution is terminal.
    pub async fn wait_for_end(&self, plan_execution_id: Uuid) -> weft_types::execution::Status {
        for _ in 0..200 {
            let execution = self
                .engine
                .plan_execution(plan_execution_id)
                .await
                .unwrap()
                .unwrap();
            if execution.status.is_terminal() {
                return execution.status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("plan execution never ended");
    }
}

/// Single-stage pipeline around `steps`.
pub fn pipeline(steps: Value) -> Value {
    json!({
        "pipeline": {
            "identifier": "p",
            "stages": [ { "stage": { "identifier": "s", "steps": steps } } ]
        }
    })
}
