//! Node execution repository trait definition.

use uuid::Uuid;
use weft_types::ambiance::Ambiance;
use weft_types::error::RepositoryError;
use weft_types::execution::{InputInstance, NodeExecution, NodeExecutionUpdate, UpdatePredicate};

/// Storage interface for node execution records and their input instances.
///
/// `update_if` is the engine's only mutual-exclusion primitive: it must
/// evaluate the predicate and apply the update (via
/// `NodeExecution::try_apply`) as one atomic operation.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait NodeExecutionRepository: Send + Sync {
    /// Insert a new record. Fails with `Conflict` if the id exists.
    fn create_node_execution(
        &self,
        record: &NodeExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_node_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<NodeExecution>, RepositoryError>> + Send;

    /// Atomically apply `update` if `predicate` holds.
    ///
    /// Returns the updated record, `None` when the predicate (or the
    /// terminal-status rule) rejected the update, and `NotFound` for an
    /// unknown id.
    fn update_node_execution_if(
        &self,
        id: &Uuid,
        predicate: &UpdatePredicate,
        update: &NodeExecutionUpdate,
    ) -> impl std::future::Future<Output = Result<Option<NodeExecution>, RepositoryError>> + Send;

    /// All records of a plan execution, ordered by creation time.
    fn list_by_plan_execution(
        &self,
        plan_execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<NodeExecution>, RepositoryError>> + Send;

    /// Direct children of a record, ordered by creation time; superseded
    /// retries are left out unless `include_old_retries` is set.
    fn list_children(
        &self,
        parent_id: &Uuid,
        include_old_retries: bool,
    ) -> impl std::future::Future<Output = Result<Vec<NodeExecution>, RepositoryError>> + Send;

    /// Records whose ambiance is nested strictly below `ambiance`.
    fn list_descendants(
        &self,
        ambiance: &Ambiance,
    ) -> impl std::future::Future<Output = Result<Vec<NodeExecution>, RepositoryError>> + Send;

    /// Every non-terminal record across all plan executions (recovery).
    fn list_non_terminal(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<NodeExecution>, RepositoryError>> + Send;

    /// Upsert the input instance of a record.
    fn save_input_instance(
        &self,
        instance: &InputInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_input_instance(
        &self,
        node_execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<InputInstance>, RepositoryError>> + Send;
}
