//! Advisers: policy deciding what happens after a node execution concludes.
//!
//! A node carries an ordered list of adviser bindings (`AdviserObtainment`).
//! The registry walks them in order; the first adviser that can advise the
//! event and returns a decision wins. No decision means the node simply
//! concludes and its parent (or the plan) is notified.

pub mod builtin;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use weft_types::execution::{NodeExecution, StepResponse};
use weft_types::interrupt::InterruptKind;
use weft_types::plan::PlanNode;

use weft_types::advise::AdviserResponse;

pub use builtin::{
    ADVISER_IGNORE, ADVISER_MANUAL_INTERVENTION, ADVISER_MARK_FAILURE, ADVISER_MARK_SUCCESS,
    ADVISER_NEXT_STEP, ADVISER_ON_FAIL, ADVISER_ON_SUCCESS, ADVISER_RETRY, ADVISER_ROLLBACK,
};

#[derive(Debug, thiserror::Error)]
pub enum AdviseError {
    #[error("no adviser registered for type '{0}'")]
    UnknownAdviser(String),

    #[error("invalid parameters for adviser '{adviser}': {message}")]
    InvalidParameters { adviser: String, message: String },
}

/// A concluded node execution as seen by an adviser.
#[derive(Debug, Clone, Copy)]
pub struct AdvisingEvent<'a> {
    pub record: &'a NodeExecution,
    pub node: &'a PlanNode,
    pub response: &'a StepResponse,
    /// Set when the conclusion was forced by an interrupt.
    pub from_interrupt: Option<InterruptKind>,
}

impl AdvisingEvent<'_> {
    /// Number of retries already made for this node.
    pub fn retry_index(&self) -> u32 {
        self.record.retry_ids.len() as u32
    }
}

/// One adviser type.
pub trait Adviser: Send + Sync {
    fn adviser_type(&self) -> &'static str;

    fn can_advise(&self, event: &AdvisingEvent<'_>, parameters: &Value) -> Result<bool, AdviseError>;

    fn advise(
        &self,
        event: &AdvisingEvent<'_>,
        parameters: &Value,
    ) -> Result<Option<AdviserResponse>, AdviseError>;
}

/// Adviser type -> implementation.
#[derive(Clone, Default)]
pub struct AdviserRegistry {
    advisers: HashMap<String, Arc<dyn Adviser>>,
}

impl AdviserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in adviser.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(builtin::NextStepAdviser);
        registry.register(builtin::OnSuccessAdviser);
        registry.register(builtin::OnFailAdviser);
        registry.register(builtin::RetryAdviser);
        registry.register(builtin::ManualInterventionAdviser);
        registry.register(builtin::IgnoreAdviser);
        registry.register(builtin::MarkSuccessAdviser);
        registry.register(builtin::MarkFailureAdviser);
        registry.register(builtin::RollbackAdviser);
        registry
    }

    pub fn register(&mut self, adviser: impl Adviser + 'static) {
        self.advisers
            .insert(adviser.adviser_type().to_string(), Arc::new(adviser));
    }

    pub fn contains(&self, adviser_type: &str) -> bool {
        self.advisers.contains_key(adviser_type)
    }

    /// Evaluate the node's bindings in order and return the first decision.
    pub fn advise(&self, event: &AdvisingEvent<'_>) -> Result<Option<AdviserResponse>, AdviseError> {
        for binding in &event.node.adviser_obtainments {
            let adviser = self
                .advisers
                .get(&binding.adviser_type)
                .ok_or_else(|| AdviseError::UnknownAdviser(binding.adviser_type.clone()))?;

            if !adviser.can_advise(event, &binding.parameters)? {
                continue;
            }
            if let Some(decision) = adviser.advise(event, &binding.parameters)? {
                tracing::debug!(
                    node_execution_id = %event.record.id,
                    adviser = %binding.adviser_type,
                    decision = decision.decision_name(),
                    "adviser decided"
                );
                return Ok(Some(decision));
            }
        }
        Ok(None)
    }
}

impl std::fmt::Debug for AdviserRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdviserRegistry")
            .field("types", &self.advisers.keys().collect::<Vec<_>>())
            .finish()
    }
}
