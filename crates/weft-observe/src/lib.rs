//! Observability setup for weft.
//!
//! The engine crates only emit `tracing` events; the embedding process calls
//! [`tracing_setup::init_tracing`] once at startup to decide where they go.

pub mod tracing_setup;
