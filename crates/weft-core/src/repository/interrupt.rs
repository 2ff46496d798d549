//! Interrupt repository trait definition.

use uuid::Uuid;
use weft_types::error::RepositoryError;
use weft_types::interrupt::{Interrupt, InterruptState};

/// Storage interface for interrupt requests and their processing state.
pub trait InterruptRepository: Send + Sync {
    fn save_interrupt(
        &self,
        interrupt: &Interrupt,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_interrupt(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Interrupt>, RepositoryError>> + Send;

    fn update_interrupt_state(
        &self,
        id: &Uuid,
        state: InterruptState,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Interrupts of a plan execution, oldest first.
    fn list_interrupts(
        &self,
        plan_execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Interrupt>, RepositoryError>> + Send;
}
