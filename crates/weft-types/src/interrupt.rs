//! Interrupt types.
//!
//! Interrupts are control signals (abort, expire, retry, forced failure)
//! raised by operators, the timeout tracker, advisers or the engine itself.
//! Every applied interrupt leaves an `InterruptEffect` in the target node's
//! append-only interrupt history.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of control signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptKind {
    /// Abort a single node execution.
    Abort,
    /// Abort every active node of a plan execution.
    AbortAll,
    /// Expire a single node execution (timeout).
    Expire,
    /// Retry a concluded or parked node execution.
    Retry,
    /// Fail every active leaf of a plan execution on operator request.
    UserMarkedFailAll,
}

impl InterruptKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InterruptKind::Abort => "ABORT",
            InterruptKind::AbortAll => "ABORT_ALL",
            InterruptKind::Expire => "EXPIRE",
            InterruptKind::Retry => "RETRY",
            InterruptKind::UserMarkedFailAll => "USER_MARKED_FAIL_ALL",
        }
    }
}

impl fmt::Display for InterruptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who raised an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssuedBy {
    User,
    Timeout,
    Adviser,
    System,
}

/// Issuing configuration carried into the interrupt history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptConfig {
    pub issued_by: IssuedBy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// For EXPIRE: end the whole execution tree on finalization.
    #[serde(default)]
    pub expire_and_end_execution: bool,
}

impl InterruptConfig {
    pub fn issued_by(issued_by: IssuedBy) -> Self {
        Self {
            issued_by,
            reason: None,
            expire_and_end_execution: false,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn ending_execution(mut self) -> Self {
        self.expire_and_end_execution = true;
        self
    }
}

/// Processing state of a persisted interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptState {
    Registered,
    Processing,
    ProcessedSuccessfully,
    ProcessedUnsuccessfully,
}

/// A persisted interrupt request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    pub id: Uuid,
    pub kind: InterruptKind,
    pub plan_execution_id: Uuid,
    /// Target record; `None` for plan-wide kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_execution_id: Option<Uuid>,
    pub config: InterruptConfig,
    pub state: InterruptState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Interrupt {
    pub fn new(
        kind: InterruptKind,
        plan_execution_id: Uuid,
        node_execution_id: Option<Uuid>,
        config: InterruptConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            kind,
            plan_execution_id,
            node_execution_id,
            config,
            state: InterruptState::Registered,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One entry of a node execution's interrupt history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptEffect {
    pub interrupt_id: Uuid,
    pub kind: InterruptKind,
    pub took_effect_at: DateTime<Utc>,
    pub config: InterruptConfig,
}

impl InterruptEffect {
    pub fn of(interrupt: &Interrupt) -> Self {
        Self {
            interrupt_id: interrupt.id,
            kind: interrupt.kind,
            took_effect_at: Utc::now(),
            config: interrupt.config.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_interrupt_is_registered() {
        let interrupt = Interrupt::new(
            InterruptKind::Abort,
            Uuid::now_v7(),
            Some(Uuid::now_v7()),
            InterruptConfig::issued_by(IssuedBy::User).with_reason("stop"),
        );
        assert_eq!(interrupt.state, InterruptState::Registered);
        assert_eq!(interrupt.config.reason.as_deref(), Some("stop"));
    }

    #[test]
    fn effect_copies_kind_and_config() {
        let interrupt = Interrupt::new(
            InterruptKind::Expire,
            Uuid::now_v7(),
            None,
            InterruptConfig::issued_by(IssuedBy::Timeout).ending_execution(),
        );
        let effect = InterruptEffect::of(&interrupt);
        assert_eq!(effect.interrupt_id, interrupt.id);
        assert_eq!(effect.kind, InterruptKind::Expire);
        assert!(effect.config.expire_and_end_execution);
    }

    #[test]
    fn kind_serializes_screaming_snake() {
        let json = serde_json::to_string(&InterruptKind::UserMarkedFailAll).unwrap();
        assert_eq!(json, "\"USER_MARKED_FAIL_ALL\"");
        assert_eq!(InterruptKind::AbortAll.to_string(), "ABORT_ALL");
    }
}
