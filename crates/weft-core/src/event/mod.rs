//! Event bus for orchestration events.
//!
//! Provides a broadcast-based `EventBus` that distributes
//! `OrchestrationEvent` values to executors and operator tooling.

pub mod bus;

pub use bus::EventBus;
