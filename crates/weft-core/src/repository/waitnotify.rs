//! Continuation (wait/notify) repository trait definition.

use uuid::Uuid;
use weft_types::error::RepositoryError;
use weft_types::waitnotify::{NotifyResponse, WaitInstance};

/// Durable storage behind the continuation registry.
///
/// Both `save_notify_response` (insert-if-absent) and `mark_wait_fired`
/// (`fired: false -> true`) must be atomic: together they are what makes a
/// callback fire exactly once under duplicate or concurrent delivery.
pub trait WaitNotifyRepository: Send + Sync {
    fn save_wait_instance(
        &self,
        wait: &WaitInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Unfired waits that include `correlation_id`.
    fn waits_for_correlation(
        &self,
        correlation_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<WaitInstance>, RepositoryError>> + Send;

    /// Store a delivered result. Returns `false` if a response for the same
    /// correlation id already exists (the new one is dropped).
    fn save_notify_response(
        &self,
        response: &NotifyResponse,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Stored responses for any of the given correlation ids.
    fn responses_for(
        &self,
        correlation_ids: &[String],
    ) -> impl std::future::Future<Output = Result<Vec<NotifyResponse>, RepositoryError>> + Send;

    /// Mark a wait fired. Returns `true` only for the caller that flipped it.
    fn mark_wait_fired(
        &self,
        wait_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// All unfired waits (recovery).
    fn list_unfired_waits(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WaitInstance>, RepositoryError>> + Send;

    /// Unfired waits whose callback targets `node_execution_id`.
    fn unfired_waits_for_node(
        &self,
        node_execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<WaitInstance>, RepositoryError>> + Send;
}
