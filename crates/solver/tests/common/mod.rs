#![allow(dead_code)]

use async_trait::async_trait;
use cuenv_solver::cache::{
    CacheManager, CacheResult, CacheResultStorage, InMemoryCacheManager, InMemoryKeyStorage,
    InMemoryResultStorage,
};
use cuenv_solver::{
    BuildResult, Builder, CacheMap, CachedResult, Context, DepCacheMap, Digest, Edge, Result,
    ResultBasedCacheFunc, SharedResult, SolverError, Vertex, VertexOptions,
};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn dgst(s: &str) -> Digest {
    Digest::from_bytes(s)
}

pub struct TestResult {
    id: String,
    value: String,
    pub releases: AtomicUsize,
}

impl TestResult {
    pub fn new(value: &str) -> Arc<Self> {
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            value: value.to_string(),
            releases: AtomicUsize::new(0),
        })
    }

    pub fn shared(value: &str) -> SharedResult {
        Self::new(value)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BuildResult for TestResult {
    fn id(&self) -> &str {
        &self.id
    }

    fn sys(&self) -> &(dyn Any + Send + Sync) {
        &self.value
    }

    async fn release(&self, _ctx: &Context) -> Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn value_of(result: &SharedResult) -> String {
    result.sys().downcast_ref::<String>().cloned().unwrap_or_default()
}

pub fn cached_value(result: &CachedResult) -> String {
    value_of(result.result())
}

/// Hook run before a cache map or exec call
pub type PreHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Tracks how many executions overlap
#[derive(Default)]
pub struct ConcurrencyGauge {
    current: AtomicUsize,
    pub max: AtomicUsize,
}

impl ConcurrencyGauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default, Clone)]
pub struct VtxOpt {
    pub name: String,
    pub value: String,
    pub inputs: Vec<Edge>,
    /// Digest of the first cache level, the vertex digest when unset
    pub cache_key_seed: Option<String>,
    /// Extra cache levels
    pub cache_key_seeds: Vec<String>,
    pub selectors: HashMap<usize, Digest>,
    pub slow_cache: HashMap<usize, ResultBasedCacheFunc>,
    pub cache_delay: Option<Duration>,
    pub exec_delay: Option<Duration>,
    pub cache_prehook: Option<PreHook>,
    pub exec_prehook: Option<PreHook>,
    pub ignore_cache: bool,
    pub cache_sources: Vec<Arc<dyn CacheManager>>,
    /// Number of exec calls that fail before one succeeds
    pub fail_times: usize,
    pub gauge: Option<Arc<ConcurrencyGauge>>,
}

impl VtxOpt {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy)]
enum Kind {
    Plain,
    Const,
    Sum,
    SubBuild,
}

pub struct TestVertex {
    opt: VtxOpt,
    kind: Kind,
    inner: Option<Edge>,
    pub cache_calls: AtomicUsize,
    pub exec_calls: AtomicUsize,
    failures_left: AtomicUsize,
    produced: Mutex<Vec<Arc<TestResult>>>,
}

impl TestVertex {
    fn build(opt: VtxOpt, kind: Kind, inner: Option<Edge>) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicUsize::new(opt.fail_times),
            opt,
            kind,
            inner,
            cache_calls: AtomicUsize::new(0),
            exec_calls: AtomicUsize::new(0),
            produced: Mutex::new(Vec::new()),
        })
    }

    pub fn plain(opt: VtxOpt) -> Arc<Self> {
        Self::build(opt, Kind::Plain, None)
    }

    /// Vertex whose cache key is its value
    pub fn constant(opt: VtxOpt) -> Arc<Self> {
        Self::build(opt, Kind::Const, None)
    }

    /// Vertex adding its value to the values of its inputs
    pub fn sum(opt: VtxOpt) -> Arc<Self> {
        Self::build(opt, Kind::Sum, None)
    }

    /// Vertex whose result is the result of building `inner`
    pub fn sub_build(opt: VtxOpt, inner: Edge) -> Arc<Self> {
        Self::build(opt, Kind::SubBuild, Some(inner))
    }

    pub fn edge(self: &Arc<Self>) -> Edge {
        Edge::new(self.clone(), 0)
    }

    pub fn cache_calls(&self) -> usize {
        self.cache_calls.load(Ordering::SeqCst)
    }

    pub fn exec_calls(&self) -> usize {
        self.exec_calls.load(Ordering::SeqCst)
    }

    /// Results this vertex created
    pub fn produced(&self) -> Vec<Arc<TestResult>> {
        self.produced.lock().clone()
    }

    /// Release calls that reached the results this vertex created
    pub fn releases(&self) -> usize {
        self.produced.lock().iter().map(|r| r.releases()).sum()
    }
}

async fn wait(ctx: &Context, hook: &Option<PreHook>, delay: Option<Duration>) -> Result<()> {
    if let Some(hook) = hook {
        tokio::select! {
            _ = hook() => {}
            _ = ctx.cancelled() => return Err(SolverError::Cancelled),
        }
    }
    if let Some(delay) = delay {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = ctx.cancelled() => return Err(SolverError::Cancelled),
        }
    }
    Ok(())
}

#[async_trait]
impl Vertex for TestVertex {
    fn digest(&self) -> Digest {
        dgst(&self.opt.name)
    }

    fn inputs(&self) -> Vec<Edge> {
        self.opt.inputs.clone()
    }

    fn name(&self) -> &str {
        &self.opt.name
    }

    fn sys(&self) -> &(dyn Any + Send + Sync) {
        &self.opt.value
    }

    fn options(&self) -> VertexOptions {
        VertexOptions {
            cache_sources: self.opt.cache_sources.clone(),
            ignore_cache: self.opt.ignore_cache,
        }
    }

    async fn cache_map(&self, ctx: &Context, index: usize) -> Result<(CacheMap, bool)> {
        self.cache_calls.fetch_add(1, Ordering::SeqCst);
        wait(ctx, &self.opt.cache_prehook, self.opt.cache_delay).await?;

        let done = index >= self.opt.cache_key_seeds.len();
        if index > 0 {
            let seed = &self.opt.cache_key_seeds[index - 1];
            return Ok((CacheMap::new(dgst(seed)), done));
        }

        let digest = match (&self.kind, &self.opt.cache_key_seed) {
            (_, Some(seed)) => dgst(seed),
            (Kind::Const, None) => dgst(&format!("const-{}", self.opt.value)),
            _ => dgst(&self.opt.name),
        };
        let deps = (0..self.opt.inputs.len())
            .map(|i| DepCacheMap {
                selector: self.opt.selectors.get(&i).cloned(),
                compute_digest: self.opt.slow_cache.get(&i).cloned(),
            })
            .collect();
        Ok((CacheMap::new(digest).with_deps(deps), done))
    }

    async fn exec(&self, ctx: &Context, inputs: Vec<SharedResult>, builder: &dyn Builder) -> Result<Vec<SharedResult>> {
        self.exec_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gauge) = &self.opt.gauge {
            gauge.enter();
        }
        let waited = wait(ctx, &self.opt.exec_prehook, self.opt.exec_delay).await;
        if let Some(gauge) = &self.opt.gauge {
            gauge.leave();
        }
        waited?;

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SolverError::operation(format!("{} failed", self.opt.name)));
        }

        let value = match self.kind {
            Kind::Plain | Kind::Const => self.opt.value.clone(),
            Kind::Sum => {
                let mut total: i64 = self.opt.value.parse().unwrap_or(0);
                for input in &inputs {
                    total += value_of(input).parse::<i64>().unwrap_or(0);
                }
                total.to_string()
            }
            Kind::SubBuild => {
                let inner = self.inner.clone().ok_or_else(|| SolverError::operation("no inner edge"))?;
                return Ok(vec![builder.build(ctx, inner).await?.result().clone()]);
            }
        };
        let result = TestResult::new(&value);
        self.produced.lock().push(result.clone());
        Ok(vec![result as SharedResult])
    }
}

/// Content based cache function hashing the input's value
pub fn value_digest() -> ResultBasedCacheFunc {
    Arc::new(|_ctx: Context, result: SharedResult| {
        async move { Ok::<_, SolverError>(dgst(&format!("content-{}", value_of(&result)))) }.boxed()
    })
}

/// Result storage counting loads
#[derive(Default)]
pub struct CountingStorage {
    inner: InMemoryResultStorage,
    pub loads: AtomicUsize,
}

impl CountingStorage {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CacheResultStorage for CountingStorage {
    async fn save(&self, result: &SharedResult, created_at: DateTime<Utc>) -> Result<CacheResult> {
        self.inner.save(result, created_at).await
    }

    async fn load(&self, ctx: &Context, result: &CacheResult) -> Result<SharedResult> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load(ctx, result).await
    }

    async fn exists(&self, id: &str) -> bool {
        self.inner.exists(id).await
    }
}

/// Manager backed by a load counting storage
pub fn counting_manager(id: &str) -> (Arc<dyn CacheManager>, Arc<CountingStorage>) {
    let storage = Arc::new(CountingStorage::default());
    let manager = InMemoryCacheManager::new(id, Arc::new(InMemoryKeyStorage::new()), storage.clone());
    (Arc::new(manager), storage)
}

/// Manager whose result storage stays reachable from the test
pub fn storage_manager(id: &str) -> (Arc<dyn CacheManager>, Arc<InMemoryResultStorage>) {
    let storage = Arc::new(InMemoryResultStorage::new());
    let manager = InMemoryCacheManager::new(id, Arc::new(InMemoryKeyStorage::new()), storage.clone());
    (Arc::new(manager), storage)
}

pub fn memory_manager(id: &str) -> Arc<dyn CacheManager> {
    Arc::new(InMemoryCacheManager::in_memory(id))
}
