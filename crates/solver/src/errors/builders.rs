//! Builder methods for creating errors with context

use super::types::{ExternalError, SolverError};
use std::sync::Arc;

impl SolverError {
    /// Wrap a `CacheMap` failure of `vertex`
    #[must_use]
    pub fn cache_key(vertex: impl Into<String>, source: SolverError) -> Self {
        if source.is_cancelled() {
            return SolverError::Cancelled;
        }
        SolverError::CacheKeyComputation {
            vertex: vertex.into(),
            source: Arc::new(source),
        }
    }

    /// Wrap an `Exec` failure of `vertex`
    #[must_use]
    pub fn execution(vertex: impl Into<String>, source: SolverError) -> Self {
        if source.is_cancelled() {
            return SolverError::Cancelled;
        }
        SolverError::Execution {
            vertex: vertex.into(),
            source: Arc::new(source),
        }
    }

    /// Wrap the failure of input `input` of `vertex`
    #[must_use]
    pub fn dependency(vertex: impl Into<String>, input: usize, source: SolverError) -> Self {
        if source.is_cancelled() {
            return SolverError::Cancelled;
        }
        SolverError::Dependency {
            vertex: vertex.into(),
            input,
            source: Arc::new(source),
        }
    }

    /// Create a storage error
    #[must_use]
    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        SolverError::Storage {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a not-found error
    #[must_use]
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        SolverError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Create an invalid graph error
    #[must_use]
    pub fn invalid_graph(message: impl Into<String>) -> Self {
        SolverError::InvalidGraph {
            message: message.into(),
        }
    }

    /// Create an operation error without a source
    #[must_use]
    pub fn operation(message: impl Into<String>) -> Self {
        SolverError::Operation {
            message: message.into(),
            source: None,
        }
    }

    /// Create an operation error with a source error
    #[must_use]
    pub fn operation_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        let source: ExternalError = Arc::new(source);
        SolverError::Operation {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(message: impl Into<String>, source: serde_json::Error) -> Self {
        SolverError::Serialization {
            message: message.into(),
            source: Arc::new(source),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        SolverError::Configuration {
            message: message.into(),
        }
    }

    /// Create a task failure error
    #[must_use]
    pub fn task_failed(message: impl Into<String>) -> Self {
        SolverError::TaskFailed {
            message: message.into(),
        }
    }

    /// Check whether this error, or any error it wraps, is a cancellation
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            SolverError::Cancelled => true,
            SolverError::CacheKeyComputation { source, .. }
            | SolverError::Execution { source, .. }
            | SolverError::Dependency { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// The innermost solver error in the wrap chain
    #[must_use]
    pub fn root_cause(&self) -> &SolverError {
        match self {
            SolverError::CacheKeyComputation { source, .. }
            | SolverError::Execution { source, .. }
            | SolverError::Dependency { source, .. } => source.root_cause(),
            _ => self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_wrapped_cancellation_is_cancelled() {
        let err = SolverError::Dependency {
            vertex: "parent".to_string(),
            input: 0,
            source: Arc::new(SolverError::Cancelled),
        };
        assert!(err.is_cancelled());
        assert!(!SolverError::operation("boom").is_cancelled());
    }

    #[test]
    fn test_builders_collapse_cancellation() {
        let err = SolverError::execution("v0", SolverError::Cancelled);
        assert!(matches!(err, SolverError::Cancelled));
    }

    #[test]
    fn test_source_chain_is_inspectable() {
        let err = SolverError::dependency(
            "parent",
            1,
            SolverError::execution("child", SolverError::operation("exit status 1")),
        );
        assert_eq!(
            err.to_string(),
            "input 1 of 'parent' failed: failed to execute 'child': exit status 1"
        );

        let source = err.source().unwrap();
        assert_eq!(source.to_string(), "failed to execute 'child': exit status 1");
        assert!(matches!(err.root_cause(), SolverError::Operation { .. }));
    }
}
