//! Display implementations for error types

use super::types::SolverError;
use std::fmt;

impl fmt::Display for SolverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolverError::Cancelled => write!(f, "operation cancelled"),
            SolverError::CacheKeyComputation { vertex, source } => {
                write!(f, "failed to compute cache key for '{vertex}': {source}")
            }
            SolverError::Execution { vertex, source } => {
                write!(f, "failed to execute '{vertex}': {source}")
            }
            SolverError::Dependency {
                vertex,
                input,
                source,
            } => {
                write!(f, "input {input} of '{vertex}' failed: {source}")
            }
            SolverError::Storage { operation, message } => {
                write!(f, "cache storage error during {operation}: {message}")
            }
            SolverError::NotFound { kind, id } => write!(f, "{kind} '{id}' not found"),
            SolverError::InvalidGraph { message } => write!(f, "invalid build graph: {message}"),
            SolverError::Operation { message, source } => match source {
                Some(source) => write!(f, "{message}: {source}"),
                None => write!(f, "{message}"),
            },
            SolverError::Serialization { message, source } => {
                write!(f, "{message}: {source}")
            }
            SolverError::Configuration { message } => {
                write!(f, "configuration error: {message}")
            }
            SolverError::TaskFailed { message } => {
                write!(f, "solver task failed: {message}")
            }
        }
    }
}
