//! Shared per-vertex state

use super::builder::SubBuilder;
use super::edge::SharedEdge;
use super::SolverInner;
use crate::cache::CacheManager;
use crate::context::Context;
use crate::digest::Digest;
use crate::errors::{Result, SolverError};
use crate::flight::Flight;
use crate::vertex::{retain, CacheMap, SharedResult, Vertex};
use futures::future::try_join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Default)]
pub(crate) struct Refs {
    /// Jobs that loaded this vertex
    pub(crate) jobs: HashSet<u64>,
    /// Vertices that sub-built this one
    pub(crate) parents: HashSet<Digest>,
    /// Vertices this one sub-built
    pub(crate) children: HashSet<Digest>,
}

/// One active vertex, shared by every job that requested it
pub(crate) struct VertexState {
    pub(crate) key: Digest,
    pub(crate) vertex: Arc<dyn Vertex>,
    pub(crate) name: String,
    pub(crate) ignore_cache: bool,
    pub(crate) inputs: Vec<(Arc<VertexState>, usize)>,
    pub(crate) cache: Arc<dyn CacheManager>,
    pub(crate) refs: Mutex<Refs>,
    cache_maps: Flight<Arc<Vec<CacheMap>>>,
    exec: Flight<Arc<Vec<SharedResult>>>,
    edges: Mutex<HashMap<usize, Arc<SharedEdge>>>,
}

impl VertexState {
    pub(crate) fn new(
        key: Digest,
        vertex: Arc<dyn Vertex>,
        ignore_cache: bool,
        inputs: Vec<(Arc<VertexState>, usize)>,
        cache: Arc<dyn CacheManager>,
    ) -> Self {
        Self {
            key,
            name: vertex.name().to_string(),
            vertex,
            ignore_cache,
            inputs,
            cache,
            refs: Mutex::new(Refs::default()),
            cache_maps: Flight::new(),
            exec: Flight::new(),
            edges: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn edge(&self, output: usize) -> Arc<SharedEdge> {
        self.edges
            .lock()
            .entry(output)
            .or_insert_with(|| Arc::new(SharedEdge::new(output)))
            .clone()
    }

    /// All cache maps of the vertex, computed once for every requester
    pub(crate) async fn cache_maps(self: &Arc<Self>, ctx: &Context) -> Result<Arc<Vec<CacheMap>>> {
        let state = self.clone();
        self.cache_maps
            .run(ctx, move |ctx| async move {
                let mut maps = Vec::new();
                loop {
                    let (map, done) = state
                        .vertex
                        .cache_map(&ctx, maps.len())
                        .await
                        .map_err(|e| SolverError::cache_key(&state.name, e))?;
                    if !map.deps.is_empty() && map.deps.len() != state.inputs.len() {
                        return Err(SolverError::cache_key(
                            &state.name,
                            SolverError::invalid_graph(format!(
                                "cache map {} has {} dependency entries for {} inputs",
                                maps.len(),
                                map.deps.len(),
                                state.inputs.len()
                            )),
                        ));
                    }
                    maps.push(map);
                    if done {
                        break;
                    }
                }
                tracing::debug!(vertex = %state.name, levels = maps.len(), "computed cache maps");
                Ok(Arc::new(maps))
            })
            .await
    }

    /// Materialize the inputs and run the vertex, once for every requester
    pub(crate) async fn exec(
        self: &Arc<Self>,
        solver: &Arc<SolverInner>,
        ctx: &Context,
    ) -> Result<Arc<Vec<SharedResult>>> {
        let state = self.clone();
        let solver = solver.clone();
        self.exec
            .run(ctx, move |ctx| async move {
                let inputs = try_join_all(state.inputs.iter().enumerate().map(|(index, (input, output))| {
                    let (solver, ctx, name) = (solver.clone(), ctx.clone(), state.name.clone());
                    async move {
                        input
                            .edge_result(&solver, &ctx, *output)
                            .await
                            .map(|r| r.result().clone())
                            .map_err(|e| SolverError::dependency(name, index, e))
                    }
                }))
                .await?;

                let permit = match &solver.exec_limit {
                    Some(limit) => Some(
                        limit
                            .clone()
                            .acquire_owned()
                            .await
                            .map_err(|e| SolverError::task_failed(e.to_string()))?,
                    ),
                    None => None,
                };
                if ctx.is_cancelled() {
                    return Err(SolverError::Cancelled);
                }

                tracing::debug!(vertex = %state.name, "executing");
                solver.record_exec();
                let builder = SubBuilder::new(solver.clone(), state.clone(), permit);
                let outputs = state
                    .vertex
                    .exec(&ctx, inputs, &builder)
                    .await
                    .map_err(|e| SolverError::execution(&state.name, e))?;
                Ok(Arc::new(outputs.iter().map(retain).collect()))
            })
            .await
    }

    /// Give back everything this vertex holds. Called once the vertex has
    /// left the active set.
    pub(crate) async fn release(&self, solver: &SolverInner, ctx: &Context) {
        let edges: Vec<Arc<SharedEdge>> = self.edges.lock().drain().map(|(_, e)| e).collect();
        let mut held: Vec<SharedResult> = Vec::new();
        for edge in &edges {
            solver.index.release(edge.id);
            solver.arena.remove(&edge.id);
            if let Some(result) = edge.owned_result() {
                held.push(result);
            }
            edge.clear();
        }
        if let Some(outputs) = self.exec.peek() {
            held.extend(outputs.iter().cloned());
        }
        self.exec.clear();
        self.cache_maps.clear();

        let mut seen = HashSet::new();
        for result in held {
            if !seen.insert(Arc::as_ptr(&result) as *const () as usize) {
                continue;
            }
            if let Err(e) = result.release(ctx).await {
                tracing::warn!(vertex = %self.name, result = %result.id(), error = %e, "failed to release result");
            }
        }
        tracing::debug!(vertex = %self.name, "released vertex");
    }
}
