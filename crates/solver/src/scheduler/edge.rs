//! Edge evaluation
//!
//! An edge goes through two shared phases. The key phase computes the
//! vertex's cache keys from its inputs' keys, queries the cache
//! incrementally as each input key arrives, and registers the keys in the
//! edge index (possibly merging into an equivalent live edge). The result
//! phase loads a matching record, falls back to content based keys of the
//! inputs, and finally executes the vertex and saves its result.

use super::state::VertexState;
use super::SolverInner;
use crate::cache::{CacheKey, CacheKeyWithSelector, CacheManager, ExportableCacheKey};
use crate::context::Context;
use crate::digest::Digest;
use crate::errors::{Result, SolverError};
use crate::export::{ExportedResult, KeyExporter, ResultSlot};
use crate::flight::Flight;
use crate::index::EdgeId;
use crate::vertex::{retain, CacheMap, CachedResult, SharedResult};
use chrono::{DateTime, Utc};
use futures::future::{try_join_all, BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::Instrument;

/// Stored keys found for one input, by owner and id
type Candidates = BTreeMap<(String, String), Arc<CacheKey>>;

fn candidates(keys: Vec<Arc<CacheKey>>) -> Candidates {
    keys.into_iter()
        .map(|k| ((k.owner().unwrap_or_default().to_string(), k.id().to_string()), k))
        .collect()
}

/// Keys matching every input
fn intersect(per_input: &[Candidates]) -> Candidates {
    let mut iter = per_input.iter();
    let Some(first) = iter.next() else {
        return Candidates::new();
    };
    let mut result = first.clone();
    for other in iter {
        result.retain(|id, _| other.contains_key(id));
    }
    result
}

/// Selector of input `input` at cache level `level`; levels without
/// dependency entries use the ones of the first level
fn selector_for(maps: &[CacheMap], level: usize, input: usize) -> Option<Digest> {
    maps[level]
        .deps
        .get(input)
        .or_else(|| maps[0].deps.get(input))
        .and_then(|d| d.selector.clone())
}

pub(crate) struct EdgeKeys {
    /// One key per cache level
    pub(crate) keys: Vec<Arc<CacheKey>>,
    /// Exportable view of `keys`, sharing the edge's result slot
    pub(crate) exportable: Vec<ExportableCacheKey>,
    pub(crate) maps: Arc<Vec<CacheMap>>,
    /// Stored keys per level and per input (a single entry without inputs)
    matches: Vec<Vec<Candidates>>,
    /// Live edge this one was merged into
    redirect: Option<EdgeId>,
}

impl EdgeKeys {
    /// Stored keys matching the whole key on any level
    fn structural_matches(&self) -> Vec<Arc<CacheKey>> {
        let mut all = Candidates::new();
        for level in &self.matches {
            all.extend(intersect(level));
        }
        all.into_values().collect()
    }
}

/// Evaluation state of one output of a vertex
pub(crate) struct SharedEdge {
    pub(crate) id: EdgeId,
    output: usize,
    keys: Flight<Arc<EdgeKeys>>,
    result: Flight<CachedResult>,
    slot: ResultSlot,
    /// Result produced or loaded by this edge rather than a merged one
    owned: Mutex<Option<SharedResult>>,
}

impl SharedEdge {
    pub(crate) fn new(output: usize) -> Self {
        Self {
            id: EdgeId::next(),
            output,
            keys: Flight::new(),
            result: Flight::new(),
            slot: ResultSlot::default(),
            owned: Mutex::new(None),
        }
    }

    pub(crate) fn owned_result(&self) -> Option<SharedResult> {
        self.owned.lock().clone()
    }

    pub(crate) fn clear(&self) {
        self.result.clear();
        self.keys.clear();
        self.owned.lock().take();
    }

    fn exportable(&self, keys: &[Arc<CacheKey>]) -> Vec<ExportableCacheKey> {
        keys.iter()
            .map(|k| ExportableCacheKey::new(k.clone(), Arc::new(KeyExporter::new(k.clone(), self.slot.clone()))))
            .collect()
    }

    fn complete(&self, keys: &[Arc<CacheKey>], result: SharedResult, created_at: DateTime<Utc>, owned: bool) -> CachedResult {
        self.slot.set(ExportedResult {
            created_at,
            result: result.clone(),
        });
        if owned {
            *self.owned.lock() = Some(result.clone());
        }
        CachedResult::new(result, self.exportable(keys))
    }
}

/// First loadable record among `keys`
async fn load_first(
    cache: &dyn CacheManager,
    ctx: &Context,
    vertex: &str,
    keys: &[Arc<CacheKey>],
) -> Result<Option<(SharedResult, DateTime<Utc>)>> {
    for key in keys {
        for record in cache.records(key).await? {
            match cache.load(ctx, &record).await {
                Ok(result) => {
                    tracing::debug!(vertex, record = %record.id, owner = %record.owner, "cache hit");
                    return Ok(Some((result, record.created_at)));
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::warn!(vertex, record = %record.id, error = %e, "failed to load cache record");
                }
            }
        }
    }
    Ok(None)
}

impl VertexState {
    fn query_enabled(&self) -> bool {
        !self.ignore_cache
    }

    /// Cache keys of one output, shared by every requester
    pub(crate) fn edge_keys<'a>(
        self: &'a Arc<Self>,
        solver: &'a Arc<SolverInner>,
        ctx: &'a Context,
        output: usize,
    ) -> BoxFuture<'a, Result<Arc<EdgeKeys>>> {
        async move {
            let edge = self.edge(output);
            let (state, solver) = (self.clone(), solver.clone());
            edge.keys
                .run(ctx, move |ctx| async move { state.compute_keys(&solver, &ctx, output).await })
                .await
        }
        .boxed()
    }

    /// Result of one output, shared by every requester
    pub(crate) fn edge_result<'a>(
        self: &'a Arc<Self>,
        solver: &'a Arc<SolverInner>,
        ctx: &'a Context,
        output: usize,
    ) -> BoxFuture<'a, Result<CachedResult>> {
        async move {
            let edge = self.edge(output);
            let (state, solver) = (self.clone(), solver.clone());
            edge.result
                .run(ctx, move |ctx| async move {
                    let span = tracing::debug_span!("edge", vertex = %state.name, output);
                    state.compute_result(&solver, &ctx, output).instrument(span).await
                })
                .await
        }
        .boxed()
    }

    async fn compute_keys(self: &Arc<Self>, solver: &Arc<SolverInner>, ctx: &Context, output: usize) -> Result<Arc<EdgeKeys>> {
        let maps = self.cache_maps(ctx).await?;
        let edge = self.edge(output);
        let levels = maps.len();
        let mut matches: Vec<Vec<Candidates>> = Vec::with_capacity(levels);
        let mut keys = Vec::with_capacity(levels);

        if self.inputs.is_empty() {
            for map in maps.iter() {
                keys.push(CacheKey::new(map.digest.clone(), output));
                let found = if self.query_enabled() {
                    candidates(self.cache.query(&[], 0, &map.digest, output).await?)
                } else {
                    Candidates::new()
                };
                matches.push(vec![found]);
            }
        } else {
            let inputs = self.inputs.len();
            let has_slow = maps[0].deps.iter().any(|d| d.compute_digest.is_some());
            matches = vec![vec![Candidates::new(); inputs]; levels];
            let mut alive = vec![true; levels];
            let mut input_keys: Vec<Vec<ExportableCacheKey>> = vec![Vec::new(); inputs];

            let mut pending: FuturesUnordered<_> = self
                .inputs
                .iter()
                .enumerate()
                .map(|(index, (input, input_output))| async move {
                    (index, input.edge_keys(solver, ctx, *input_output).await)
                })
                .collect();

            while let Some((index, found)) = pending.next().await {
                let input = found.map_err(|e| SolverError::dependency(&self.name, index, e))?;
                if self.query_enabled() {
                    for level in 0..levels {
                        if !alive[level] && (level > 0 || !has_slow) {
                            continue;
                        }
                        let deps: Vec<CacheKeyWithSelector> = input
                            .exportable
                            .iter()
                            .map(|k| CacheKeyWithSelector::new(k.clone(), selector_for(&maps, level, index)))
                            .collect();
                        let found = candidates(self.cache.query(&deps, index, &maps[level].digest, output).await?);
                        if found.is_empty() {
                            alive[level] = false;
                        }
                        matches[level][index] = found;
                    }
                }
                input_keys[index] = input.exportable.clone();
            }

            for (level, map) in maps.iter().enumerate() {
                let deps = input_keys
                    .iter()
                    .enumerate()
                    .map(|(index, keys)| {
                        keys.iter()
                            .map(|k| CacheKeyWithSelector::new(k.clone(), selector_for(&maps, level, index)))
                            .collect()
                    })
                    .collect();
                keys.push(CacheKey::with_deps(map.digest.clone(), output, deps));
            }
        }

        solver.arena.insert(edge.id, (Arc::downgrade(self), output));
        let redirect = solver.index.load_or_store_all(&keys, edge.id, self.ignore_cache);
        if let Some(target) = redirect {
            solver.arena.remove(&edge.id);
            tracing::debug!(vertex = %self.name, output, into = ?target, "merged into active edge");
        }

        Ok(Arc::new(EdgeKeys {
            exportable: edge.exportable(&keys),
            keys,
            maps,
            matches,
            redirect,
        }))
    }

    async fn compute_result(
        self: &Arc<Self>,
        solver: &Arc<SolverInner>,
        ctx: &Context,
        output: usize,
    ) -> Result<CachedResult> {
        let edge = self.edge(output);
        let keys = loop {
            let keys = self.edge_keys(solver, ctx, output).await?;
            let Some(target) = keys.redirect else {
                break keys;
            };
            match solver.edge_state(target) {
                Some((target, target_output)) => {
                    if !solver.adopt(self, &target) {
                        tracing::debug!(vertex = %self.name, into = %target.name, "merged edge not linked to its target");
                    }
                    let shared = target.edge_result(solver, ctx, target_output).await?;
                    solver.record_merge();
                    return Ok(edge.complete(&keys.keys, retain(shared.result()), Utc::now(), true));
                }
                None => {
                    // the edge we merged into is gone, register again
                    edge.keys.forget_finished();
                    tokio::task::yield_now().await;
                }
            }
        };

        if self.query_enabled() {
            let structural = keys.structural_matches();
            if let Some((result, created_at)) = load_first(self.cache.as_ref(), ctx, &self.name, &structural).await? {
                solver.record_hit();
                return Ok(edge.complete(&keys.keys, result, created_at, true));
            }
        }

        let mut level0 = keys.keys[0].clone();
        let mut computed = vec![false; self.inputs.len()];
        if self.query_enabled() && !self.inputs.is_empty() {
            if let Some(hit) = self
                .try_slow_cache(solver, ctx, &keys, &mut level0, &mut computed)
                .await?
            {
                let mut all = keys.keys.clone();
                all[0] = level0;
                solver.record_hit();
                return Ok(edge.complete(&all, hit.0, hit.1, true));
            }
        }

        let outputs = self.exec(solver, ctx).await?;
        let result = outputs.get(output).cloned().ok_or_else(|| {
            SolverError::execution(
                &self.name,
                SolverError::invalid_graph(format!("{} results returned, output {output} requested", outputs.len())),
            )
        })?;

        // inputs are materialized now, record their content keys as well
        for (index, dep) in keys.maps[0].deps.iter().enumerate() {
            if computed[index] || dep.compute_digest.is_none() {
                continue;
            }
            if let Some(alternative) = self.slow_key(solver, ctx, &keys.maps, index).await? {
                level0 = level0.with_alternatives(index, vec![alternative]);
            }
        }

        let mut all = keys.keys.clone();
        all[0] = level0;
        let created_at = Utc::now();
        for key in &all {
            self.cache.save(key, &result, created_at).await?;
        }
        // the exec outputs hold the reference
        Ok(edge.complete(&all, result, created_at, false))
    }

    /// Content based key of input `index`, materializing the input
    async fn slow_key(
        self: &Arc<Self>,
        solver: &Arc<SolverInner>,
        ctx: &Context,
        maps: &[CacheMap],
        index: usize,
    ) -> Result<Option<CacheKeyWithSelector>> {
        let Some(compute) = maps[0].deps.get(index).and_then(|d| d.compute_digest.clone()) else {
            return Ok(None);
        };
        let (input, input_output) = &self.inputs[index];
        let materialized = input
            .edge_result(solver, ctx, *input_output)
            .await
            .map_err(|e| SolverError::dependency(&self.name, index, e))?;
        let digest = compute(ctx.clone(), materialized.result().clone())
            .await
            .map_err(|e| SolverError::cache_key(&self.name, e))?;
        Ok(Some(CacheKeyWithSelector::new(
            ExportableCacheKey::bare(CacheKey::new(digest, 0)),
            selector_for(maps, 0, index),
        )))
    }

    /// Try content based keys. Inputs without any structural match have to
    /// run anyway and are materialized together; inputs with structural
    /// candidates are then tried one by one, stopping at the first hit so
    /// the rest are never forced.
    async fn try_slow_cache(
        self: &Arc<Self>,
        solver: &Arc<SolverInner>,
        ctx: &Context,
        keys: &EdgeKeys,
        level0: &mut Arc<CacheKey>,
        computed: &mut [bool],
    ) -> Result<Option<(SharedResult, DateTime<Utc>)>> {
        let maps = &keys.maps;
        let mut per_input = keys.matches[0].clone();
        let (eager, lazy): (Vec<usize>, Vec<usize>) = maps[0]
            .deps
            .iter()
            .enumerate()
            .filter(|(_, d)| d.compute_digest.is_some())
            .map(|(index, _)| index)
            .partition(|index| per_input[*index].is_empty());

        let materialized = try_join_all(eager.iter().map(|index| self.slow_key(solver, ctx, maps, *index))).await?;
        for (index, alternative) in eager.into_iter().zip(materialized) {
            let hit = self
                .apply_slow_key(ctx, maps, index, alternative, &mut per_input, level0, computed)
                .await?;
            if hit.is_some() {
                return Ok(hit);
            }
        }

        for index in lazy {
            let alternative = self.slow_key(solver, ctx, maps, index).await?;
            let hit = self
                .apply_slow_key(ctx, maps, index, alternative, &mut per_input, level0, computed)
                .await?;
            if hit.is_some() {
                return Ok(hit);
            }
        }
        Ok(None)
    }

    /// Query with the content key of input `index` and load the first record
    /// matching every input
    #[allow(clippy::too_many_arguments)]
    async fn apply_slow_key(
        &self,
        ctx: &Context,
        maps: &[CacheMap],
        index: usize,
        alternative: Option<CacheKeyWithSelector>,
        per_input: &mut [Candidates],
        level0: &mut Arc<CacheKey>,
        computed: &mut [bool],
    ) -> Result<Option<(SharedResult, DateTime<Utc>)>> {
        let Some(alternative) = alternative else {
            return Ok(None);
        };
        computed[index] = true;
        let found = self
            .cache
            .query(std::slice::from_ref(&alternative), index, &maps[0].digest, level0.output())
            .await?;
        *level0 = level0.with_alternatives(index, vec![alternative]);
        per_input[index].extend(candidates(found));

        let matched: Vec<Arc<CacheKey>> = intersect(per_input).into_values().collect();
        if matched.is_empty() {
            return Ok(None);
        }
        let hit = load_first(self.cache.as_ref(), ctx, &self.name, &matched).await?;
        if hit.is_some() {
            tracing::debug!(vertex = %self.name, input = index, "content based cache hit");
        }
        Ok(hit)
    }
}
