//! Core error type definitions

use std::sync::Arc;

/// Result type alias for solver operations
pub type Result<T> = std::result::Result<T, SolverError>;

/// Boxed error coming from outside the solver (vertex bodies, storage backends)
pub type ExternalError = Arc<dyn std::error::Error + Send + Sync>;

/// Error type for solver operations using thiserror
///
/// The enum is `Clone` because a single failure of a shared computation is
/// delivered to every caller waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SolverError {
    /// The caller's context was cancelled
    Cancelled,

    /// A vertex failed to produce its cache map
    CacheKeyComputation {
        vertex: String,
        #[source]
        source: Arc<SolverError>,
    },

    /// A vertex failed to execute
    Execution {
        vertex: String,
        #[source]
        source: Arc<SolverError>,
    },

    /// An input edge failed while building its parent
    Dependency {
        vertex: String,
        input: usize,
        #[source]
        source: Arc<SolverError>,
    },

    /// Cache storage failures
    Storage { operation: String, message: String },

    /// A referenced key, record or result does not exist
    NotFound { kind: &'static str, id: String },

    /// The build graph or a cache map is malformed
    InvalidGraph { message: String },

    /// Failure reported by a vertex body or another collaborator
    Operation {
        message: String,
        #[source]
        source: Option<ExternalError>,
    },

    /// JSON serialization/deserialization errors
    Serialization {
        message: String,
        #[source]
        source: Arc<serde_json::Error>,
    },

    /// Configuration errors
    Configuration { message: String },

    /// A spawned computation panicked or was aborted by the runtime
    TaskFailed { message: String },
}
