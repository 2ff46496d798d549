//! Engine configuration types.
//!
//! `EngineConfig` is the top-level `weft.toml` controlling compiler
//! concurrency, interrupt acknowledgement timeouts and the event bus.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the weft engine.
///
/// Loaded from `{data_dir}/weft.toml`. All fields have defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of plan creators run concurrently per compile round.
    #[serde(default = "default_compiler_max_concurrency")]
    pub compiler_max_concurrency: usize,

    /// Bound on how long an interrupt waits for a cooperative-cancel
    /// acknowledgement before finalizing anyway.
    #[serde(default = "default_interrupt_ack_timeout_ms")]
    pub interrupt_ack_timeout_ms: u64,

    /// Capacity of the orchestration event broadcast channel.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Upper bound on compile rounds before compilation is abandoned.
    #[serde(default = "default_max_compile_rounds")]
    pub max_compile_rounds: usize,

    /// SQLite URL for the persistent repositories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
}

fn default_compiler_max_concurrency() -> usize {
    8
}

fn default_interrupt_ack_timeout_ms() -> u64 {
    10_000
}

fn default_event_bus_capacity() -> usize {
    1024
}

fn default_max_compile_rounds() -> usize {
    64
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            compiler_max_concurrency: default_compiler_max_concurrency(),
            interrupt_ack_timeout_ms: default_interrupt_ack_timeout_ms(),
            event_bus_capacity: default_event_bus_capacity(),
            max_compile_rounds: default_max_compile_rounds(),
            database_url: None,
        }
    }
}
