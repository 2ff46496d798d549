//! Plan compiler: definition tree -> executable `Plan`.
//!
//! Compilation is a work-queue of [`Dependency`] entries. Each round selects
//! the first registered creator matching every pending entry, runs those
//! creators concurrently on a bounded pool, merges the nodes they return,
//! applies their definition rewrites and queues the dependencies they
//! discovered. The loop ends when nothing is pending.

pub mod creator;
pub mod creators;
pub mod definition;
pub mod validate;

mod compile;

pub use compile::{CompilationResponse, PlanCompiler};
pub use creator::{
    ANY_TYPE, ChildrenPlanCreator, Dependency, DependencyMetadata, PartialPlanResponse,
    PlanCreationContext, PlanCreator, PlanCreatorDyn, SingleNode, SingleNodeCreator,
    SupportedTypes, WithChildren,
};
pub use definition::{DefinitionPath, DefinitionTree, PathSegment, UUID_FIELD};

use std::fmt;

/// A single compilation failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompilationError {
    #[error("no plan creator supports '{field}' of type '{type_tag}' at {path}")]
    NoMatchingCreator {
        field: String,
        type_tag: String,
        path: String,
    },

    #[error("plan creator failed at {path}: {message}")]
    CreatorFailed { path: String, message: String },

    #[error("conflicting definition rewrites at {path}")]
    RewriteConflict { path: String },

    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("plan creator task failed: {0}")]
    Join(String),
}

/// Every failure of an aborted compilation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompilationErrors(pub Vec<CompilationError>);

impl CompilationErrors {
    pub fn errors(&self) -> &[CompilationError] {
        &self.0
    }
}

impl fmt::Display for CompilationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} compilation error(s)", self.0.len())?;
        for error in &self.0 {
            write!(f, "; {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompilationErrors {}

impl From<CompilationError> for CompilationErrors {
    fn from(error: CompilationError) -> Self {
        Self(vec![error])
    }
}
