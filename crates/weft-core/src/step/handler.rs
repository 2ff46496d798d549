//! Protocol traits for step handlers and their object-safe twins.
//!
//! Every protocol trait uses RPITIT. Because RPITIT traits cannot be used as
//! trait objects, each has a `*Dyn` twin with boxed futures and a blanket
//! implementation, so the registry can hold `Arc<dyn ...Dyn>`.

use futures_util::future::BoxFuture;
use serde_json::Value;
use weft_types::execution::{FailureInfo, StepResponse};
use weft_types::waitnotify::ResponseMap;

use super::{
    AsyncStart, ChainLink, ChildChainDecision, ChildLink, ChildOutcome, StepContext, TaskRequest,
};

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

/// In-line work producing a terminal outcome.
pub trait SyncExecutable: Send + Sync {
    fn execute(
        &self,
        ctx: &StepContext,
        params: &Value,
    ) -> impl std::future::Future<Output = anyhow::Result<StepResponse>> + Send;
}

pub trait SyncExecutableDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
    ) -> BoxFuture<'a, anyhow::Result<StepResponse>>;
}

impl<T: SyncExecutable> SyncExecutableDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
    ) -> BoxFuture<'a, anyhow::Result<StepResponse>> {
        Box::pin(self.execute(ctx, params))
    }
}

// ---------------------------------------------------------------------------
// Async
// ---------------------------------------------------------------------------

/// External work signalled back through one or more callback ids.
pub trait AsyncExecutable: Send + Sync {
    fn start(
        &self,
        ctx: &StepContext,
        params: &Value,
    ) -> impl std::future::Future<Output = anyhow::Result<AsyncStart>> + Send;

    /// Called once, with a result for every callback id.
    fn resume(
        &self,
        ctx: &StepContext,
        params: &Value,
        responses: &ResponseMap,
    ) -> impl std::future::Future<Output = anyhow::Result<StepResponse>> + Send;

    fn abort(
        &self,
        _ctx: &StepContext,
        _params: &Value,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send {
        async { Ok(()) }
    }
}

pub trait AsyncExecutableDyn: Send + Sync {
    fn start_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
    ) -> BoxFuture<'a, anyhow::Result<AsyncStart>>;

    fn resume_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
        responses: &'a ResponseMap,
    ) -> BoxFuture<'a, anyhow::Result<StepResponse>>;

    fn abort_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
    ) -> BoxFuture<'a, anyhow::Result<()>>;
}

impl<T: AsyncExecutable> AsyncExecutableDyn for T {
    fn start_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
    ) -> BoxFuture<'a, anyhow::Result<AsyncStart>> {
        Box::pin(self.start(ctx, params))
    }

    fn resume_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
        responses: &'a ResponseMap,
    ) -> BoxFuture<'a, anyhow::Result<StepResponse>> {
        Box::pin(self.resume(ctx, params, responses))
    }

    fn abort_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(self.abort(ctx, params))
    }
}

// ---------------------------------------------------------------------------
// Async chain
// ---------------------------------------------------------------------------

/// A sequence of callbacks; each completion either starts the next link or
/// finalizes the chain.
pub trait AsyncChainExecutable: Send + Sync {
    fn start_chain_link(
        &self,
        ctx: &StepContext,
        params: &Value,
    ) -> impl std::future::Future<Output = anyhow::Result<ChainLink>> + Send;

    fn execute_next_link(
        &self,
        ctx: &StepContext,
        params: &Value,
        pass_through: &Value,
        responses: &ResponseMap,
    ) -> impl std::future::Future<Output = anyhow::Result<ChainLink>> + Send;

    fn finalize_execution(
        &self,
        ctx: &StepContext,
        params: &Value,
        pass_through: &Value,
        responses: &ResponseMap,
    ) -> impl std::future::Future<Output = anyhow::Result<StepResponse>> + Send;

    fn abort(
        &self,
        _ctx: &StepContext,
        _params: &Value,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send {
        async { Ok(()) }
    }
}

pub trait AsyncChainExecutableDyn: Send + Sync {
    fn start_chain_link_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
    ) -> BoxFuture<'a, anyhow::Result<ChainLink>>;

    fn execute_next_link_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
        pass_through: &'a Value,
        responses: &'a ResponseMap,
    ) -> BoxFuture<'a, anyhow::Result<ChainLink>>;

    fn finalize_execution_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
        pass_through: &'a Value,
        responses: &'a ResponseMap,
    ) -> BoxFuture<'a, anyhow::Result<StepResponse>>;

    fn abort_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
    ) -> BoxFuture<'a, anyhow::Result<()>>;
}

impl<T: AsyncChainExecutable> AsyncChainExecutableDyn for T {
    fn start_chain_link_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
    ) -> BoxFuture<'a, anyhow::Result<ChainLink>> {
        Box::pin(self.start_chain_link(ctx, params))
    }

    fn execute_next_link_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
        pass_through: &'a Value,
        responses: &'a ResponseMap,
    ) -> BoxFuture<'a, anyhow::Result<ChainLink>> {
        Box::pin(self.execute_next_link(ctx, params, pass_through, responses))
    }

    fn finalize_execution_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
        pass_through: &'a Value,
        responses: &'a ResponseMap,
    ) -> BoxFuture<'a, anyhow::Result<StepResponse>> {
        Box::pin(self.finalize_execution(ctx, params, pass_through, responses))
    }

    fn abort_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(self.abort(ctx, params))
    }
}

// ---------------------------------------------------------------------------
// Children
// ---------------------------------------------------------------------------

/// Fan-out over child nodes with no ordering between them.
pub trait ChildrenExecutable: Send + Sync {
    fn obtain_children(
        &self,
        ctx: &StepContext,
        params: &Value,
    ) -> impl std::future::Future<Output = anyhow::Result<Vec<String>>> + Send;

    fn handle_children_response(
        &self,
        ctx: &StepContext,
        params: &Value,
        outcomes: &[ChildOutcome],
    ) -> impl std::future::Future<Output = anyhow::Result<StepResponse>> + Send;
}

pub trait ChildrenExecutableDyn: Send + Sync {
    fn obtain_children_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
    ) -> BoxFuture<'a, anyhow::Result<Vec<String>>>;

    fn handle_children_response_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
        outcomes: &'a [ChildOutcome],
    ) -> BoxFuture<'a, anyhow::Result<StepResponse>>;
}

impl<T: ChildrenExecutable> ChildrenExecutableDyn for T {
    fn obtain_children_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
    ) -> BoxFuture<'a, anyhow::Result<Vec<String>>> {
        Box::pin(self.obtain_children(ctx, params))
    }

    fn handle_children_response_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
        outcomes: &'a [ChildOutcome],
    ) -> BoxFuture<'a, anyhow::Result<StepResponse>> {
        Box::pin(self.handle_children_response(ctx, params, outcomes))
    }
}

// ---------------------------------------------------------------------------
// Child chain
// ---------------------------------------------------------------------------

/// Children run one after another; the handler picks each next child.
pub trait ChildChainExecutable: Send + Sync {
    /// First child to run, or `None` to complete immediately.
    fn first_child(
        &self,
        ctx: &StepContext,
        params: &Value,
    ) -> impl std::future::Future<Output = anyhow::Result<Option<ChildLink>>> + Send;

    fn on_child_concluded(
        &self,
        ctx: &StepContext,
        params: &Value,
        pass_through: &Value,
        child: &ChildOutcome,
    ) -> impl std::future::Future<Output = anyhow::Result<ChildChainDecision>> + Send;
}

pub trait ChildChainExecutableDyn: Send + Sync {
    fn first_child_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
    ) -> BoxFuture<'a, anyhow::Result<Option<ChildLink>>>;

    fn on_child_concluded_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
        pass_through: &'a Value,
        child: &'a ChildOutcome,
    ) -> BoxFuture<'a, anyhow::Result<ChildChainDecision>>;
}

impl<T: ChildChainExecutable> ChildChainExecutableDyn for T {
    fn first_child_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
    ) -> BoxFuture<'a, anyhow::Result<Option<ChildLink>>> {
        Box::pin(self.first_child(ctx, params))
    }

    fn on_child_concluded_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
        pass_through: &'a Value,
        child: &'a ChildOutcome,
    ) -> BoxFuture<'a, anyhow::Result<ChildChainDecision>> {
        Box::pin(self.on_child_concluded(ctx, params, pass_through, child))
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Work delegated to an external executor through the task queue.
///
/// The cancellation hooks are called by the interrupt subsystem; the
/// strategy itself applies no business logic to them.
pub trait TaskExecutable: Send + Sync {
    fn obtain_task(
        &self,
        ctx: &StepContext,
        params: &Value,
    ) -> impl std::future::Future<Output = anyhow::Result<TaskRequest>> + Send;

    fn handle_task_result(
        &self,
        ctx: &StepContext,
        params: &Value,
        responses: &ResponseMap,
    ) -> impl std::future::Future<Output = anyhow::Result<StepResponse>> + Send;

    fn handle_abort(
        &self,
        _ctx: &StepContext,
        _params: &Value,
        _task_id: &str,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send {
        async { Ok(()) }
    }

    fn handle_expire(
        &self,
        _ctx: &StepContext,
        _params: &Value,
        _task_id: &str,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send {
        async { Ok(()) }
    }

    fn handle_failure(
        &self,
        _ctx: &StepContext,
        _params: &Value,
        _failure: &FailureInfo,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send {
        async { Ok(()) }
    }
}

pub trait TaskExecutableDyn: Send + Sync {
    fn obtain_task_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
    ) -> BoxFuture<'a, anyhow::Result<TaskRequest>>;

    fn handle_task_result_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
        responses: &'a ResponseMap,
    ) -> BoxFuture<'a, anyhow::Result<StepResponse>>;

    fn handle_abort_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
        task_id: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>>;

    fn handle_expire_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
        task_id: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>>;

    fn handle_failure_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
        failure: &'a FailureInfo,
    ) -> BoxFuture<'a, anyhow::Result<()>>;
}

impl<T: TaskExecutable> TaskExecutableDyn for T {
    fn obtain_task_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
    ) -> BoxFuture<'a, anyhow::Result<TaskRequest>> {
        Box::pin(self.obtain_task(ctx, params))
    }

    fn handle_task_result_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
        responses: &'a ResponseMap,
    ) -> BoxFuture<'a, anyhow::Result<StepResponse>> {
        Box::pin(self.handle_task_result(ctx, params, responses))
    }

    fn handle_abort_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
        task_id: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(self.handle_abort(ctx, params, task_id))
    }

    fn handle_expire_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
        task_id: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(self.handle_expire(ctx, params, task_id))
    }

    fn handle_failure_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
        failure: &'a FailureInfo,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(self.handle_failure(ctx, params, failure))
    }
}
