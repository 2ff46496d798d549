//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (weft-infra) implements. The core crate never depends on any specific
//! storage technology; [`memory`] holds the in-process implementation used
//! by tests and embedded engines.

pub mod interrupt;
pub mod memory;
pub mod node_execution;
pub mod plan;
pub mod waitnotify;

pub use interrupt::InterruptRepository;
pub use node_execution::NodeExecutionRepository;
pub use plan::{PlanExecutionRepository, PlanRepository};
pub use waitnotify::WaitNotifyRepository;

/// Everything the orchestration engine persists, behind one bound.
///
/// Blanket-implemented for any type implementing all repository traits.
pub trait OrchestrationStore:
    NodeExecutionRepository
    + PlanRepository
    + PlanExecutionRepository
    + WaitNotifyRepository
    + InterruptRepository
    + 'static
{
}

impl<T> OrchestrationStore for T where
    T: NodeExecutionRepository
        + PlanRepository
        + PlanExecutionRepository
        + WaitNotifyRepository
        + InterruptRepository
        + 'static
{
}
