//! Shared domain types for weft.
//!
//! This crate contains the types every other weft crate speaks in: the
//! execution context chain (`ambiance`), compiled plan nodes, node execution
//! records and their statuses, interrupts, adviser decisions, continuation
//! (wait/notify) records, orchestration events and engine configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod advise;
pub mod ambiance;
pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod interrupt;
pub mod plan;
pub mod task;
pub mod waitnotify;
