//! Step-type -> handler table.
//!
//! Built once at process start and shared read-only (`Arc<StepRegistry>`)
//! by the compiler (to look up a step's execution mode) and the strategies.

use std::collections::HashMap;
use std::sync::Arc;

use weft_types::plan::ExecutionMode;

use super::handler::{
    AsyncChainExecutable, AsyncChainExecutableDyn, AsyncExecutable, AsyncExecutableDyn,
    ChildChainExecutable, ChildChainExecutableDyn, ChildrenExecutable, ChildrenExecutableDyn,
    SyncExecutable, SyncExecutableDyn, TaskExecutable, TaskExecutableDyn,
};
use super::section::{SECTION_CHAIN, SECTION_CHILDREN, SectionChain, SectionChildren};

/// Errors from handler lookup.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("no handler registered for step type '{0}'")]
    UnknownStepType(String),

    #[error("step type '{step_type}' is registered as {registered}, not {expected}")]
    ModeMismatch {
        step_type: String,
        expected: ExecutionMode,
        registered: ExecutionMode,
    },
}

/// A registered handler, tagged by the protocol it implements.
#[derive(Clone)]
pub enum StepHandler {
    Sync(Arc<dyn SyncExecutableDyn>),
    Async(Arc<dyn AsyncExecutableDyn>),
    AsyncChain(Arc<dyn AsyncChainExecutableDyn>),
    Children(Arc<dyn ChildrenExecutableDyn>),
    ChildChain(Arc<dyn ChildChainExecutableDyn>),
    Task(Arc<dyn TaskExecutableDyn>),
}

impl StepHandler {
    pub fn mode(&self) -> ExecutionMode {
        match self {
            StepHandler::Sync(_) => ExecutionMode::Sync,
            StepHandler::Async(_) => ExecutionMode::Async,
            StepHandler::AsyncChain(_) => ExecutionMode::AsyncChain,
            StepHandler::Children(_) => ExecutionMode::Children,
            StepHandler::ChildChain(_) => ExecutionMode::ChildChain,
            StepHandler::Task(_) => ExecutionMode::Task,
        }
    }
}

impl std::fmt::Debug for StepHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StepHandler").field(&self.mode()).finish()
    }
}

/// Registry of step handlers keyed by step type.
#[derive(Debug, Clone, Default)]
pub struct StepRegistry {
    handlers: HashMap<String, StepHandler>,
}

macro_rules! typed_lookup {
    ($name:ident, $variant:ident, $dyn_trait:ident) => {
        pub fn $name(&self, step_type: &str) -> Result<Arc<dyn $dyn_trait>, StepError> {
            match self.lookup(step_type)? {
                StepHandler::$variant(handler) => Ok(Arc::clone(handler)),
                other => Err(StepError::ModeMismatch {
                    step_type: step_type.to_string(),
                    expected: ExecutionMode::$variant,
                    registered: other.mode(),
                }),
            }
        }
    };
}

impl StepRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in container handlers used by the built-in
    /// plan creators (`SECTION_CHILDREN`, `SECTION_CHAIN`).
    pub fn with_sections() -> Self {
        let mut registry = Self::new();
        registry.register_children(SECTION_CHILDREN, SectionChildren);
        registry.register_child_chain(SECTION_CHAIN, SectionChain);
        registry
    }

    pub fn register_sync(&mut self, step_type: &str, handler: impl SyncExecutable + 'static) {
        self.insert(step_type, StepHandler::Sync(Arc::new(handler)));
    }

    pub fn register_async(&mut self, step_type: &str, handler: impl AsyncExecutable + 'static) {
        self.insert(step_type, StepHandler::Async(Arc::new(handler)));
    }

    pub fn register_async_chain(
        &mut self,
        step_type: &str,
        handler: impl AsyncChainExecutable + 'static,
    ) {
        self.insert(step_type, StepHandler::AsyncChain(Arc::new(handler)));
    }

    pub fn register_children(
        &mut self,
        step_type: &str,
        handler: impl ChildrenExecutable + 'static,
    ) {
        self.insert(step_type, StepHandler::Children(Arc::new(handler)));
    }

    pub fn register_child_chain(
        &mut self,
        step_type: &str,
        handler: impl ChildChainExecutable + 'static,
    ) {
        self.insert(step_type, StepHandler::ChildChain(Arc::new(handler)));
    }

    pub fn register_task(&mut self, step_type: &str, handler: impl TaskExecutable + 'static) {
        self.insert(step_type, StepHandler::Task(Arc::new(handler)));
    }

    fn insert(&mut self, step_type: &str, handler: StepHandler) {
        if self.handlers.insert(step_type.to_string(), handler).is_some() {
            tracing::warn!(step_type, "replacing registered step handler");
        }
    }

    pub fn get(&self, step_type: &str) -> Option<&StepHandler> {
        self.handlers.get(step_type)
    }

    /// Execution mode a step type is registered under.
    pub fn mode_of(&self, step_type: &str) -> Option<ExecutionMode> {
        self.get(step_type).map(StepHandler::mode)
    }

    fn lookup(&self, step_type: &str) -> Result<&StepHandler, StepError> {
        self.get(step_type)
            .ok_or_else(|| StepError::UnknownStepType(step_type.to_string()))
    }

    typed_lookup!(sync, Sync, SyncExecutableDyn);
    typed_lookup!(asynchronous, Async, AsyncExecutableDyn);
    typed_lookup!(async_chain, AsyncChain, AsyncChainExecutableDyn);
    typed_lookup!(children, Children, ChildrenExecutableDyn);
    typed_lookup!(child_chain, ChildChain, ChildChainExecutableDyn);
    typed_lookup!(task, Task, TaskExecutableDyn);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_registered_with_parent_modes() {
        let registry = StepRegistry::with_sections();
        assert_eq!(registry.mode_of(SECTION_CHILDREN), Some(ExecutionMode::Children));
        assert_eq!(registry.mode_of(SECTION_CHAIN), Some(ExecutionMode::ChildChain));
        assert!(registry.mode_of("Unknown").is_none());
    }

    #[test]
    fn typed_lookup_reports_mode_mismatch() {
        let registry = StepRegistry::with_sections();
        assert!(registry.children(SECTION_CHILDREN).is_ok());
        let err = registry.task(SECTION_CHILDREN).err().unwrap();
        assert!(matches!(
            err,
            StepError::ModeMismatch {
                registered: ExecutionMode::Children,
                expected: ExecutionMode::Task,
                ..
            }
        ));
        assert!(matches!(
            registry.sync("Nope").err().unwrap(),
            StepError::UnknownStepType(_)
        ));
    }
}
