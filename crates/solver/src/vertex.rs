//! Contracts consumed from operation implementations
//!
//! A [`Vertex`] is one node of the build graph. The solver only relies on
//! its digest, its inputs, its cache map(s) and its execution function;
//! what the vertex actually computes is opaque.

use crate::cache::{CacheManager, ExportableCacheKey};
use crate::context::Context;
use crate::digest::Digest;
use crate::errors::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// A materialized output of a vertex
#[async_trait]
pub trait BuildResult: Send + Sync {
    /// Stable identity of the result
    fn id(&self) -> &str;

    /// Implementation specific payload
    fn sys(&self) -> &(dyn Any + Send + Sync);

    /// Give the result back to whatever owns its backing resources
    async fn release(&self, ctx: &Context) -> Result<()>;

    /// Counted handle view, for results handed out by the solver
    fn as_result_ref(&self) -> Option<&ResultRef> {
        None
    }
}

pub type SharedResult = Arc<dyn BuildResult>;

struct Retained {
    result: SharedResult,
    refs: AtomicUsize,
}

/// One counted reference to a result. Every holder (a vertex, an edge, a
/// result storage) gets its own handle and releases it exactly once; the
/// underlying result is released with the last handle.
pub struct ResultRef {
    retained: Arc<Retained>,
    released: AtomicBool,
}

impl ResultRef {
    /// Take ownership of `result` as its first reference
    pub fn new(result: SharedResult) -> Arc<Self> {
        Arc::new(Self {
            retained: Arc::new(Retained {
                result,
                refs: AtomicUsize::new(1),
            }),
            released: AtomicBool::new(false),
        })
    }

    /// Another reference to the same underlying result
    pub fn clone_ref(&self) -> Arc<Self> {
        self.retained.refs.fetch_add(1, Ordering::AcqRel);
        Arc::new(Self {
            retained: self.retained.clone(),
            released: AtomicBool::new(false),
        })
    }

    pub fn inner(&self) -> &SharedResult {
        &self.retained.result
    }

    /// Live references to the underlying result
    pub fn ref_count(&self) -> usize {
        self.retained.refs.load(Ordering::Acquire)
    }
}

#[async_trait]
impl BuildResult for ResultRef {
    fn id(&self) -> &str {
        self.retained.result.id()
    }

    fn sys(&self) -> &(dyn Any + Send + Sync) {
        self.retained.result.sys()
    }

    async fn release(&self, ctx: &Context) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.retained.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.retained.result.release(ctx).await?;
        }
        Ok(())
    }

    fn as_result_ref(&self) -> Option<&ResultRef> {
        Some(self)
    }
}

/// New counted reference to `result`. A result that is not a handle yet is
/// adopted: its first handle owns it.
pub fn retain(result: &SharedResult) -> SharedResult {
    match result.as_result_ref() {
        Some(handle) => handle.clone_ref(),
        None => ResultRef::new(result.clone()),
    }
}

/// Result returned from a build together with the cache keys it is known by
#[derive(Clone)]
pub struct CachedResult {
    result: SharedResult,
    cache_keys: Vec<ExportableCacheKey>,
}

impl CachedResult {
    pub fn new(result: SharedResult, cache_keys: Vec<ExportableCacheKey>) -> Self {
        Self { result, cache_keys }
    }

    pub fn id(&self) -> &str {
        self.result.id()
    }

    pub fn sys(&self) -> &(dyn Any + Send + Sync) {
        self.result.sys()
    }

    pub fn result(&self) -> &SharedResult {
        &self.result
    }

    /// Keys usable to export the provenance of this result
    pub fn cache_keys(&self) -> &[ExportableCacheKey] {
        &self.cache_keys
    }
}

impl fmt::Debug for CachedResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedResult")
            .field("id", &self.result.id())
            .field("cache_keys", &self.cache_keys.len())
            .finish()
    }
}

/// Computes an extra digest for an input from its materialized result
pub type ResultBasedCacheFunc =
    Arc<dyn Fn(Context, SharedResult) -> BoxFuture<'static, Result<Digest>> + Send + Sync>;

/// Per-input contribution to a cache map
#[derive(Clone, Default)]
pub struct DepCacheMap {
    /// Narrows which recorded dependency values this input may match
    pub selector: Option<Digest>,
    /// Content based key, computed only once the input result exists
    pub compute_digest: Option<ResultBasedCacheFunc>,
}

impl DepCacheMap {
    pub fn with_selector(selector: Digest) -> Self {
        Self {
            selector: Some(selector),
            compute_digest: None,
        }
    }
}

impl fmt::Debug for DepCacheMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DepCacheMap")
            .field("selector", &self.selector)
            .field("compute_digest", &self.compute_digest.is_some())
            .finish()
    }
}

/// One cache-key level of a vertex
#[derive(Clone, Debug)]
pub struct CacheMap {
    pub digest: Digest,
    /// Empty, or exactly one entry per input
    pub deps: Vec<DepCacheMap>,
}

impl CacheMap {
    pub fn new(digest: Digest) -> Self {
        Self {
            digest,
            deps: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_deps(mut self, deps: Vec<DepCacheMap>) -> Self {
        self.deps = deps;
        self
    }
}

/// Scheduling options of a vertex
#[derive(Clone, Default)]
pub struct VertexOptions {
    /// Additional managers consulted for cache hits
    pub cache_sources: Vec<Arc<dyn CacheManager>>,
    /// Always execute, never look results up
    pub ignore_cache: bool,
}

impl fmt::Debug for VertexOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sources: Vec<&str> = self.cache_sources.iter().map(|m| m.id()).collect();
        f.debug_struct("VertexOptions")
            .field("cache_sources", &sources)
            .field("ignore_cache", &self.ignore_cache)
            .finish()
    }
}

/// One node of the build graph
#[async_trait]
pub trait Vertex: Send + Sync {
    /// Static digest identifying the operation and its inputs
    fn digest(&self) -> Digest;

    fn inputs(&self) -> Vec<Edge>;

    fn name(&self) -> &str;

    fn sys(&self) -> &(dyn Any + Send + Sync);

    fn options(&self) -> VertexOptions {
        VertexOptions::default()
    }

    /// Returns cache map number `index` and whether it is the last one
    async fn cache_map(&self, ctx: &Context, index: usize) -> Result<(CacheMap, bool)>;

    /// Produce one result per output slot
    async fn exec(
        &self,
        ctx: &Context,
        inputs: Vec<SharedResult>,
        builder: &dyn Builder,
    ) -> Result<Vec<SharedResult>>;
}

/// Reference to one output of a vertex
#[derive(Clone)]
pub struct Edge {
    pub index: usize,
    pub vertex: Arc<dyn Vertex>,
}

impl Edge {
    pub fn new(vertex: Arc<dyn Vertex>, index: usize) -> Self {
        Self { index, vertex }
    }
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Edge({}#{})", self.vertex.name(), self.index)
    }
}

/// Builds edges on behalf of a vertex body
#[async_trait]
pub trait Builder: Send + Sync {
    async fn build(&self, ctx: &Context, edge: Edge) -> Result<CachedResult>;
}
