//! Content-addressed, incremental build-graph solver
//!
//! Given a DAG of [`Vertex`] operations, the solver computes requested
//! outputs while
//!
//! - running each distinct unit of work at most once, however many jobs
//!   request it concurrently ([`index::EdgeIndex`]),
//! - reusing results stored under structural or content based cache keys
//!   ([`cache::CacheManager`]),
//! - exporting the provenance of a result as a portable cache graph
//!   ([`export`]).
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use cuenv_solver::{cache::InMemoryCacheManager, Context, Edge, Solver, Vertex};
//! # async fn demo(vertex: Arc<dyn Vertex>) -> cuenv_solver::Result<()> {
//! let solver = Solver::new(Arc::new(InMemoryCacheManager::in_memory("local")));
//! let job = solver.new_job("build");
//! let result = job.build(&Context::new(), &Edge::new(vertex, 0)).await?;
//! println!("{}", result.id());
//! job.discard().await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod digest;
pub mod errors;
pub mod export;
mod flight;
pub mod index;
pub mod logging;
pub mod scheduler;
pub mod vertex;

#[cfg(test)]
pub(crate) mod testutil;

pub use cache::{CacheKey, CacheManager, ExportableCacheKey, InMemoryCacheManager};
pub use config::SolverConfig;
pub use context::Context;
pub use digest::Digest;
pub use errors::{Result, SolverError};
pub use export::{CacheExportOpt, ExportMode, InMemoryExportTarget};
pub use scheduler::{Job, Solver, SolverStats};
pub use vertex::{
    retain, BuildResult, Builder, CacheMap, CachedResult, DepCacheMap, Edge, ResultBasedCacheFunc, ResultRef,
    SharedResult, Vertex, VertexOptions,
};
