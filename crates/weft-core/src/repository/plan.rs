//! Plan and plan execution repository trait definitions.

use uuid::Uuid;
use weft_types::error::RepositoryError;
use weft_types::execution::{PlanExecution, Status};
use weft_types::plan::Plan;

/// Storage interface for compiled plans.
pub trait PlanRepository: Send + Sync {
    /// Upsert a compiled plan (insert or replace by id).
    fn save_plan(
        &self,
        plan: &Plan,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_plan(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Plan>, RepositoryError>> + Send;
}

/// Storage interface for plan execution records.
pub trait PlanExecutionRepository: Send + Sync {
    fn create_plan_execution(
        &self,
        execution: &PlanExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_plan_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<PlanExecution>, RepositoryError>> + Send;

    /// Move a non-terminal plan execution to `status` and stamp its end
    /// time. Returns `false` if it was already terminal.
    fn conclude_plan_execution(
        &self,
        id: &Uuid,
        status: Status,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
