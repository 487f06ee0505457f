//! Scheduler: solver, jobs and the shared active vertex graph
//!
//! Every requested vertex gets one [`state::VertexState`] per digest, shared
//! by all jobs that reference it. Jobs only add and drop references; the
//! last reference going away releases the vertex's edges from the edge
//! index and its results.

mod builder;
mod edge;
mod state;

use crate::cache::{CacheManager, CombinedCacheManager};
use crate::config::SolverConfig;
use crate::context::Context;
use crate::digest::Digest;
use crate::errors::{Result, SolverError};
use crate::export::CacheExportOpt;
use crate::index::{EdgeId, EdgeIndex};
use crate::logging::job_span;
use crate::vertex::{Builder, CachedResult, Edge, Vertex};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use state::VertexState;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Semaphore;
use tracing::Instrument;

/// Who holds a reference to a loaded vertex graph
pub(crate) enum Owner {
    Job(u64),
    Parent(Arc<VertexState>),
}

/// Snapshot of the solver's shared state, mostly for leak checks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SolverStats {
    pub active_vertices: usize,
    pub index_items: usize,
    pub index_back_refs: usize,
    pub arena_edges: usize,
    pub executions: usize,
    pub cache_hits: usize,
    pub merged_edges: usize,
}

pub(crate) struct SolverInner {
    main_cache: Arc<dyn CacheManager>,
    config: SolverConfig,
    pub(crate) index: EdgeIndex,
    pub(crate) arena: DashMap<EdgeId, (Weak<VertexState>, usize)>,
    actives: Mutex<HashMap<Digest, Arc<VertexState>>>,
    pub(crate) exec_limit: Option<Arc<Semaphore>>,
    next_job: AtomicU64,
    executions: AtomicUsize,
    cache_hits: AtomicUsize,
    merged_edges: AtomicUsize,
}

fn ignore_cache_key(digest: &Digest) -> Digest {
    Digest::from_bytes(format!("{digest}-ignorecache"))
}

impl SolverInner {
    pub(crate) fn record_exec(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_merge(&self) {
        self.merged_edges.fetch_add(1, Ordering::Relaxed);
    }

    /// Vertex state and output behind a registered edge
    pub(crate) fn edge_state(&self, id: EdgeId) -> Option<(Arc<VertexState>, usize)> {
        let entry = self.arena.get(&id)?;
        let (state, output) = entry.value();
        Some((state.upgrade()?, *output))
    }

    fn cache_for(&self, vertex: &dyn Vertex) -> Arc<dyn CacheManager> {
        let sources = vertex.options().cache_sources;
        if sources.is_empty() || !self.config.query_alternate_sources {
            return self.main_cache.clone();
        }
        Arc::new(CombinedCacheManager::new(self.main_cache.clone(), sources))
    }

    /// Make the whole graph below `vertex` active and reference it from `owner`
    pub(crate) fn load(&self, vertex: &Arc<dyn Vertex>, owner: Owner) -> Result<Arc<VertexState>> {
        let mut actives = self.actives.lock();
        let mut loaded = HashMap::new();
        let mut visiting = HashSet::new();
        let state = self.load_locked(&mut actives, &mut loaded, &mut visiting, vertex)?;

        for loaded_state in loaded.values() {
            match &owner {
                Owner::Job(id) => {
                    loaded_state.refs.lock().jobs.insert(*id);
                }
                Owner::Parent(parent) => {
                    if parent.key == loaded_state.key {
                        continue;
                    }
                    loaded_state.refs.lock().parents.insert(parent.key.clone());
                    parent.refs.lock().children.insert(loaded_state.key.clone());
                }
            }
        }
        Ok(state)
    }

    fn load_locked(
        &self,
        actives: &mut HashMap<Digest, Arc<VertexState>>,
        loaded: &mut HashMap<Digest, Arc<VertexState>>,
        visiting: &mut HashSet<Digest>,
        vertex: &Arc<dyn Vertex>,
    ) -> Result<Arc<VertexState>> {
        let digest = vertex.digest();
        let ignore_cache = vertex.options().ignore_cache;
        let lookup = if ignore_cache { ignore_cache_key(&digest) } else { digest.clone() };
        if let Some(state) = loaded.get(&lookup) {
            return Ok(state.clone());
        }

        // A regular vertex adopts any active state of its digest; an
        // ignore-cache one only an ignore-cache state.
        let existing = match actives.get(&digest) {
            Some(state) if !ignore_cache || state.ignore_cache => Some(state.clone()),
            _ if ignore_cache => actives.get(&ignore_cache_key(&digest)).cloned(),
            _ => None,
        };
        if let Some(state) = existing {
            Self::collect_active(&state, loaded);
            loaded.insert(lookup, state.clone());
            return Ok(state);
        }

        if !visiting.insert(digest.clone()) {
            return Err(SolverError::invalid_graph(format!(
                "cycle through vertex '{}'",
                vertex.name()
            )));
        }
        let mut inputs = Vec::new();
        for input in vertex.inputs() {
            let state = self.load_locked(actives, loaded, visiting, &input.vertex)?;
            inputs.push((state, input.index));
        }
        visiting.remove(&digest);

        let key = if ignore_cache && actives.contains_key(&digest) {
            ignore_cache_key(&digest)
        } else {
            digest
        };
        let state = Arc::new(VertexState::new(
            key.clone(),
            vertex.clone(),
            ignore_cache,
            inputs,
            self.cache_for(vertex.as_ref()),
        ));
        tracing::trace!(vertex = %state.name, key = %key, "activated vertex");
        actives.insert(key, state.clone());
        loaded.insert(lookup, state.clone());
        Ok(state)
    }

    /// Keep `target` and its inputs active for as long as `state` is,
    /// after an edge of `state` merged into an edge of `target`. Returns
    /// false when either side already left the active set or the link would
    /// form a cycle.
    pub(crate) fn adopt(&self, state: &Arc<VertexState>, target: &Arc<VertexState>) -> bool {
        if Arc::ptr_eq(state, target) {
            return true;
        }
        let actives = self.actives.lock();
        let is_active = |s: &Arc<VertexState>| actives.get(&s.key).is_some_and(|a| Arc::ptr_eq(a, s));
        if !is_active(state) || !is_active(target) {
            return false;
        }

        let mut graph = HashMap::new();
        Self::collect_active(target, &mut graph);
        if graph.contains_key(&state.key) || graph.keys().any(|key| Self::reaches(&actives, key, &state.key)) {
            return false;
        }
        let mut children = state.refs.lock();
        for held in graph.values() {
            held.refs.lock().parents.insert(state.key.clone());
            children.children.insert(held.key.clone());
        }
        true
    }

    /// Whether `to` is `from` or one of its (transitive) children
    fn reaches(actives: &HashMap<Digest, Arc<VertexState>>, from: &Digest, to: &Digest) -> bool {
        let mut stack = vec![from.clone()];
        let mut seen = HashSet::new();
        while let Some(key) = stack.pop() {
            if &key == to {
                return true;
            }
            if !seen.insert(key.clone()) {
                continue;
            }
            if let Some(state) = actives.get(&key) {
                stack.extend(state.refs.lock().children.iter().cloned());
            }
        }
        false
    }

    /// Record an already active state and its inputs as loaded
    fn collect_active(state: &Arc<VertexState>, loaded: &mut HashMap<Digest, Arc<VertexState>>) {
        if loaded.insert(state.key.clone(), state.clone()).is_some() {
            return;
        }
        for (input, _) in &state.inputs {
            Self::collect_active(input, loaded);
        }
    }

    async fn discard(&self, job: u64) {
        let released = {
            let mut actives = self.actives.lock();
            let touched: Vec<Digest> = actives
                .iter()
                .filter(|(_, state)| state.refs.lock().jobs.remove(&job))
                .map(|(key, _)| key.clone())
                .collect();
            let mut released = Vec::new();
            for key in touched {
                Self::remove_if_unreferenced(&mut actives, &key, &mut released);
            }
            released
        };

        let ctx = Context::new();
        for state in released {
            state.release(self, &ctx).await;
        }
    }

    fn remove_if_unreferenced(
        actives: &mut HashMap<Digest, Arc<VertexState>>,
        key: &Digest,
        released: &mut Vec<Arc<VertexState>>,
    ) {
        let Some(state) = actives.get(key).cloned() else {
            return;
        };
        let children = {
            let refs = state.refs.lock();
            if !refs.jobs.is_empty() || !refs.parents.is_empty() {
                return;
            }
            refs.children.iter().cloned().collect::<Vec<_>>()
        };
        actives.remove(key);
        released.push(state);
        for child in children {
            if let Some(child_state) = actives.get(&child) {
                child_state.refs.lock().parents.remove(key);
            }
            Self::remove_if_unreferenced(actives, &child, released);
        }
    }
}

/// Entry point: owns the shared active graph, the edge index and the
/// default cache manager
#[derive(Clone)]
pub struct Solver {
    inner: Arc<SolverInner>,
}

impl Solver {
    pub fn new(cache: Arc<dyn CacheManager>) -> Self {
        Self::with_config(cache, SolverConfig::default())
    }

    pub fn with_config(cache: Arc<dyn CacheManager>, config: SolverConfig) -> Self {
        let exec_limit = config.max_parallel_execs.map(|n| Arc::new(Semaphore::new(n)));
        Self {
            inner: Arc::new(SolverInner {
                main_cache: cache,
                config,
                index: EdgeIndex::new(),
                arena: DashMap::new(),
                actives: Mutex::new(HashMap::new()),
                exec_limit,
                next_job: AtomicU64::new(1),
                executions: AtomicUsize::new(0),
                cache_hits: AtomicUsize::new(0),
                merged_edges: AtomicUsize::new(0),
            }),
        }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &Arc<dyn CacheManager> {
        &self.inner.main_cache
    }

    /// Export options using the configured default mode
    pub fn export_opt(&self) -> CacheExportOpt {
        CacheExportOpt::new(self.inner.config.default_export_mode)
    }

    pub fn new_job(&self, name: impl Into<String>) -> Job {
        let id = self.inner.next_job.fetch_add(1, Ordering::Relaxed);
        Job {
            id,
            name: name.into(),
            solver: self.inner.clone(),
            discarded: AtomicBool::new(false),
        }
    }

    pub fn stats(&self) -> SolverStats {
        let inner = &self.inner;
        SolverStats {
            active_vertices: inner.actives.lock().len(),
            index_items: inner.index.len(),
            index_back_refs: inner.index.back_ref_count(),
            arena_edges: inner.arena.len(),
            executions: inner.executions.load(Ordering::Relaxed),
            cache_hits: inner.cache_hits.load(Ordering::Relaxed),
            merged_edges: inner.merged_edges.load(Ordering::Relaxed),
        }
    }
}

/// One logical build request
pub struct Job {
    id: u64,
    name: String,
    solver: Arc<SolverInner>,
    discarded: AtomicBool,
}

impl Job {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Build one output of a vertex, reusing any equivalent work in flight
    /// or in the cache
    pub async fn build(&self, ctx: &Context, edge: &Edge) -> Result<CachedResult> {
        let span = job_span(&self.name, edge.vertex.name(), edge.index);
        async {
            if self.discarded.load(Ordering::Acquire) {
                return Err(SolverError::invalid_graph(format!("job '{}' was discarded", self.name)));
            }
            let state = self.solver.load(&edge.vertex, Owner::Job(self.id))?;
            let result = state.edge_result(&self.solver, ctx, edge.index).await;
            match &result {
                Ok(r) => tracing::debug!(result = %r.id(), "build finished"),
                Err(e) if e.is_cancelled() => tracing::debug!("build cancelled"),
                Err(e) => tracing::debug!(error = %e, "build failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Drop every reference this job holds. Vertices no other job or
    /// parent references are released.
    pub async fn discard(&self) {
        if self.discarded.swap(true, Ordering::AcqRel) {
            return;
        }
        self.solver.discard(self.id).await;
        tracing::debug!(job = %self.name, "discarded job");
    }
}

#[async_trait]
impl Builder for Job {
    async fn build(&self, ctx: &Context, edge: Edge) -> Result<CachedResult> {
        Job::build(self, ctx, &edge).await
    }
}
