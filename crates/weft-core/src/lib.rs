//! Business logic and repository traits for weft.
//!
//! `weft-core` compiles declarative pipeline definitions into plans and
//! drives their execution: node invocation strategies, the per-record state
//! machine, advisers, the continuation (wait/notify) registry, timeouts and
//! the interrupt subsystem. Persistence is reached only through the traits in
//! [`repository`]; `weft-infra` provides the SQLite implementations and
//! [`repository::memory`] an in-process one.

pub mod advise;
pub mod compiler;
pub mod condition;
pub mod continuation;
pub mod engine;
pub mod event;
pub mod repository;
pub mod step;
pub mod strategy;
pub mod task_queue;
pub mod timeout;
