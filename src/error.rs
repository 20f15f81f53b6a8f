//! Error types for the optimizer core.
//!
//! Everything the optimizer can fail with is a variant of [`OptimizerError`].
//! Errors raised by the relational engine pass through unaltered as
//! [`DatabaseError`].

use thiserror::Error;

use crate::pagination::PaginationError;

/// An error surfaced by the external relational engine.
///
/// The optimizer never inspects these; they are carried through to the
/// caller as-is.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct DatabaseError(pub String);

/// Errors raised while compiling or executing an optimization plan.
#[derive(Debug, Error)]
pub enum OptimizerError {
    /// The selection requires more relation joins/prefetches than allowed.
    #[error("query complexity of {complexity} exceeds the maximum allowed of {max_complexity}")]
    ComplexityExceeded {
        complexity: usize,
        max_complexity: usize,
    },

    /// Contradictory or out-of-range pagination arguments.
    #[error(transparent)]
    InvalidPagination(#[from] PaginationError),

    /// A selection could not be resolved against the registered schema.
    #[error("cannot resolve selection '{field}' on type '{object_type}'")]
    SchemaMismatch { field: String, object_type: String },

    /// A filterset rejected the supplied arguments.
    #[error("invalid filter arguments: {0}")]
    FilterValidation(String),

    /// Pass-through error from the relational engine.
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// Anything else that went wrong during optimization.
    #[error("optimization failed: {0}")]
    Internal(String),
}

impl OptimizerError {
    /// Whether `skip_optimization_on_error` may swallow this error and fall
    /// back to the unoptimized queryset. Complexity, pagination and filter
    /// validation errors always surface.
    pub(crate) fn is_skippable(&self) -> bool {
        matches!(
            self,
            OptimizerError::SchemaMismatch { .. } | OptimizerError::Internal(_)
        )
    }
}
