//! Node invocation strategies, one per execution mode.
//!
//! Strategies are pure with respect to persistence: `start` and `resume`
//! look up the step handler, call it, and describe what the engine should do
//! next as an [`ExecutionEffect`]. The engine applies effects (records
//! responses, registers waits, spawns children, enqueues tasks).
//!
//! Handler errors and panics never reach the engine's control loop: the
//! engine calls strategies through [`guarded`], which turns both into a
//! `FailureInfo` with `FailureType::Unexpected`.

pub mod async_chain;
pub mod asynchronous;
pub mod child_chain;
pub mod children;
pub mod sync;
pub mod task;

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use weft_types::execution::{ExecutableResponse, FailureInfo, StepResponse};
use weft_types::plan::ExecutionMode;
use weft_types::task::TaskDescriptor;
use weft_types::waitnotify::ResponseMap;

use crate::step::{StepContext, StepRegistry};

// ---------------------------------------------------------------------------
// Effects
// ---------------------------------------------------------------------------

/// What the engine should do after a strategy call.
#[derive(Debug, Clone)]
pub enum ExecutionEffect {
    /// The node reached its outcome.
    Complete {
        response: StepResponse,
        executable: Option<ExecutableResponse>,
    },
    /// Record `executable` and wait until every callback id is delivered.
    AwaitCallbacks {
        executable: ExecutableResponse,
        callback_ids: Vec<String>,
        timeout_ms: Option<u64>,
        /// Also register one individual wake-up per id.
        per_id: bool,
    },
    /// Spawn every child and wait for all of them.
    SpawnChildren { child_node_ids: Vec<String> },
    /// Spawn one child of a chain and wait for it.
    SpawnChild {
        child_node_id: String,
        last_link: bool,
        pass_through: Value,
    },
    /// Enqueue a task and wait for its result.
    DispatchTask { descriptor: TaskDescriptor },
}

impl ExecutionEffect {
    pub fn complete(response: StepResponse, executable: ExecutableResponse) -> Self {
        ExecutionEffect::Complete {
            response,
            executable: Some(executable),
        }
    }
}

/// Result of a resume call.
#[derive(Debug, Clone)]
pub enum ResumeOutcome {
    Complete(StepResponse),
    Continue(ExecutionEffect),
}

// ---------------------------------------------------------------------------
// ExecutionStrategy
// ---------------------------------------------------------------------------

/// Start/resume protocol of one execution mode.
///
/// Object-safe (boxed futures) so strategies can live in a lookup table.
pub trait ExecutionStrategy: Send + Sync {
    fn mode(&self) -> ExecutionMode;

    fn start<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
    ) -> BoxFuture<'a, anyhow::Result<ExecutionEffect>>;

    /// Called when the waits registered for `last` fired.
    fn resume<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
        last: &'a ExecutableResponse,
        responses: &'a ResponseMap,
    ) -> BoxFuture<'a, anyhow::Result<ResumeOutcome>>;

    /// Cooperative cancellation of outstanding work.
    fn abort<'a>(
        &'a self,
        _ctx: &'a StepContext,
        _params: &'a Value,
        _last: Option<&'a ExecutableResponse>,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Cooperative cancellation on timeout. Defaults to `abort`.
    fn expire<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
        last: Option<&'a ExecutableResponse>,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        self.abort(ctx, params, last)
    }

    /// Notification that the node was failed from outside.
    fn failure<'a>(
        &'a self,
        _ctx: &'a StepContext,
        _params: &'a Value,
        _failure: &'a FailureInfo,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

// ---------------------------------------------------------------------------
// Strategy boundary
// ---------------------------------------------------------------------------

/// Await a strategy call, converting errors and panics into a failure.
pub async fn guarded<T>(
    future: impl Future<Output = anyhow::Result<T>>,
) -> Result<T, FailureInfo> {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "step handler failed");
            Err(FailureInfo::unexpected(format!("{e:#}")))
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(panic = %message, "step handler panicked");
            Err(FailureInfo::unexpected(format!("step handler panicked: {message}")))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// StrategyRegistry
// ---------------------------------------------------------------------------

/// Execution mode -> strategy lookup table.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    strategies: HashMap<ExecutionMode, Arc<dyn ExecutionStrategy>>,
}

impl StrategyRegistry {
    /// Table with the six standard strategies over `steps`.
    pub fn standard(steps: Arc<StepRegistry>) -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(sync::SyncStrategy::new(Arc::clone(&steps))));
        registry.register(Arc::new(asynchronous::AsyncStrategy::new(Arc::clone(&steps))));
        registry.register(Arc::new(async_chain::AsyncChainStrategy::new(Arc::clone(&steps))));
        registry.register(Arc::new(children::ChildrenStrategy::new(Arc::clone(&steps))));
        registry.register(Arc::new(child_chain::ChildChainStrategy::new(Arc::clone(&steps))));
        registry.register(Arc::new(task::TaskStrategy::new(steps)));
        registry
    }

    pub fn register(&mut self, strategy: Arc<dyn ExecutionStrategy>) {
        self.strategies.insert(strategy.mode(), strategy);
    }

    pub fn get(&self, mode: ExecutionMode) -> Option<Arc<dyn ExecutionStrategy>> {
        self.strategies.get(&mode).cloned()
    }
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("modes", &self.strategies.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Resume called with a response recorded by a different mode.
pub(crate) fn unexpected_response(mode: ExecutionMode, last: &ExecutableResponse) -> anyhow::Error {
    anyhow::anyhow!("{mode} strategy cannot resume from response {last:?}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_types::execution::FailureType;

    #[tokio::test]
    async fn guarded_converts_error() {
        let result: Result<(), FailureInfo> =
            guarded(async { Err(anyhow::anyhow!("connection refused")) }).await;
        let failure = result.unwrap_err();
        assert!(failure.message.contains("connection refused"));
        assert_eq!(failure.failure_types, vec![FailureType::Unexpected]);
    }

    #[tokio::test]
    async fn guarded_converts_panic() {
        let result: Result<(), FailureInfo> = guarded(async {
            if true {
                panic!("handler bug");
            }
            Ok(())
        })
        .await;
        assert!(result.unwrap_err().message.contains("handler bug"));
    }

    #[test]
    fn standard_registry_covers_every_mode() {
        let registry = StrategyRegistry::standard(Arc::new(StepRegistry::with_sections()));
        for mode in [
            ExecutionMode::Sync,
            ExecutionMode::Async,
            ExecutionMode::AsyncChain,
            ExecutionMode::Children,
            ExecutionMode::ChildChain,
            ExecutionMode::Task,
        ] {
            assert_eq!(registry.get(mode).unwrap().mode(), mode);
        }
    }
}
