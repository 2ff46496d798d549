//! SQLite storage layer.
//!
//! [`SqliteOrchestrationStore`] implements every repository trait of
//! `weft-core` on top of a split read/write pool, so it satisfies
//! `OrchestrationStore` and can back an `OrchestrationEngine` directly.

pub mod interrupt;
pub mod node_execution;
pub mod plan;
pub mod pool;
pub mod store;
pub mod waitnotify;

pub use pool::{DatabasePool, default_database_url};
pub use store::SqliteOrchestrationStore;
