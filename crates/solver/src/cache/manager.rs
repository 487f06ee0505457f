//! Cache manager: the pluggable boundary between the solver and storage

use super::key::{CacheInfoLink, CacheKey, CacheKeyWithSelector, CacheRecord, ExportableCacheKey};
use super::storage::{
    CacheKeyStorage, CacheResult, CacheResultStorage, InMemoryKeyStorage, InMemoryResultStorage,
};
use crate::context::Context;
use crate::digest::{root_key, Digest};
use crate::errors::{Result, SolverError};
use crate::export::{ExportedResult, KeyExporter};
use crate::vertex::SharedResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Persists key to result mappings and answers incremental key queries
#[async_trait]
pub trait CacheManager: Send + Sync {
    /// Identity used to route records back to their owner
    fn id(&self) -> &str;

    /// Stored keys with `digest`/`output` whose dependency `input` matches
    /// one of `deps`. With no deps, looks up the dependency-free key.
    async fn query(
        &self,
        deps: &[CacheKeyWithSelector],
        input: usize,
        digest: &Digest,
        output: usize,
    ) -> Result<Vec<Arc<CacheKey>>>;

    /// Loadable result bindings of a key, newest first
    async fn records(&self, key: &CacheKey) -> Result<Vec<CacheRecord>>;

    async fn load(&self, ctx: &Context, record: &CacheRecord) -> Result<SharedResult>;

    async fn save(
        &self,
        key: &Arc<CacheKey>,
        result: &SharedResult,
        created_at: DateTime<Utc>,
    ) -> Result<ExportableCacheKey>;
}

/// Cache manager over a key graph storage and a result storage
pub struct InMemoryCacheManager {
    id: String,
    keys: Arc<dyn CacheKeyStorage>,
    results: Arc<dyn CacheResultStorage>,
}

impl InMemoryCacheManager {
    pub fn new(
        id: impl Into<String>,
        keys: Arc<dyn CacheKeyStorage>,
        results: Arc<dyn CacheResultStorage>,
    ) -> Self {
        Self {
            id: id.into(),
            keys,
            results,
        }
    }

    /// Manager backed by fresh in-memory storages
    pub fn in_memory(id: impl Into<String>) -> Self {
        Self::new(
            id,
            Arc::new(InMemoryKeyStorage::new()),
            Arc::new(InMemoryResultStorage::new()),
        )
    }

    pub fn key_storage(&self) -> &Arc<dyn CacheKeyStorage> {
        &self.keys
    }

    /// Drop a result binding from the key graph
    pub fn release(&self, result_id: &str) -> Result<()> {
        self.keys.release(result_id)
    }

    fn is_own(&self, key: &CacheKey) -> bool {
        key.owner() == Some(self.id.as_str())
    }

    fn link_for(key: &CacheKey, input: usize, selector: Option<&Digest>) -> CacheInfoLink {
        CacheInfoLink {
            input,
            output: key.output(),
            digest: key.digest().clone(),
            selector: selector.cloned(),
        }
    }

    /// Stored ids structurally equal to `key`
    fn matching_ids(&self, key: &CacheKey) -> BTreeSet<String> {
        if self.is_own(key) {
            return if self.keys.exists(key.id()) {
                BTreeSet::from([key.id().to_string()])
            } else {
                BTreeSet::new()
            };
        }
        if key.deps().is_empty() {
            let root = root_key(key.digest(), key.output()).to_string();
            return if self.keys.exists(&root) {
                BTreeSet::from([root])
            } else {
                BTreeSet::new()
            };
        }

        let mut matched: Option<BTreeSet<String>> = None;
        for (input, slot) in key.deps().iter().enumerate() {
            let mut found = BTreeSet::new();
            for alternative in slot {
                let link = Self::link_for(key, input, alternative.selector.as_ref());
                for child in self.matching_ids(&alternative.key.key) {
                    found.extend(self.keys.walk_links(&child, &link));
                }
            }
            let next = match matched {
                None => found,
                Some(previous) => previous.intersection(&found).cloned().collect(),
            };
            let exhausted = next.is_empty();
            matched = Some(next);
            if exhausted {
                break;
            }
        }
        matched.unwrap_or_default()
    }

    /// Find or create the stored id for `key`, linking all its dependencies
    fn ensure_persistent_key(&self, key: &CacheKey) -> Result<String> {
        if self.is_own(key) {
            return Ok(key.id().to_string());
        }
        let root = root_key(key.digest(), key.output());
        if key.deps().is_empty() {
            return Ok(root.to_string());
        }

        let mut children = Vec::with_capacity(key.deps().len());
        for slot in key.deps() {
            let mut slot_ids = Vec::with_capacity(slot.len());
            for alternative in slot {
                let child = self.ensure_persistent_key(&alternative.key.key)?;
                slot_ids.push((child, alternative.selector.clone()));
            }
            children.push(slot_ids);
        }

        let id = match self.matching_ids(key).into_iter().next() {
            Some(existing) => existing,
            None => {
                let mut seed = root.to_string();
                for (input, slot) in children.iter().enumerate() {
                    for (child, selector) in slot {
                        seed.push_str(&format!(
                            "|{input}:{child}:{}",
                            selector.as_ref().map_or("", Digest::as_str)
                        ));
                    }
                }
                Digest::from_bytes(seed).to_string()
            }
        };

        for (input, slot) in children.into_iter().enumerate() {
            for (child, selector) in slot {
                let link = Self::link_for(key, input, selector.as_ref());
                if !self.keys.has_link(&child, &link, &id) {
                    self.keys.add_link(&child, link, &id)?;
                }
            }
        }
        Ok(id)
    }
}

#[async_trait]
impl CacheManager for InMemoryCacheManager {
    fn id(&self) -> &str {
        &self.id
    }

    async fn query(
        &self,
        deps: &[CacheKeyWithSelector],
        input: usize,
        digest: &Digest,
        output: usize,
    ) -> Result<Vec<Arc<CacheKey>>> {
        let ids: BTreeSet<String> = if deps.is_empty() {
            let root = root_key(digest, output).to_string();
            if self.keys.exists(&root) {
                BTreeSet::from([root])
            } else {
                BTreeSet::new()
            }
        } else {
            let mut ids = BTreeSet::new();
            for dep in deps {
                let link = CacheInfoLink {
                    input,
                    output,
                    digest: digest.clone(),
                    selector: dep.selector.clone(),
                };
                for child in self.matching_ids(&dep.key.key) {
                    ids.extend(self.keys.walk_links(&child, &link));
                }
            }
            ids
        };

        Ok(ids
            .into_iter()
            .map(|id| CacheKey::stored(id, digest.clone(), output, &self.id))
            .collect())
    }

    async fn records(&self, key: &CacheKey) -> Result<Vec<CacheRecord>> {
        let ids = self.matching_ids(key);
        let mut records = Vec::new();
        for id in ids {
            let stored = CacheKey::stored(id.clone(), key.digest().clone(), key.output(), &self.id);
            for result in self.keys.results(&id) {
                if !self.results.exists(&result.id).await {
                    tracing::debug!(key = %id, result = %result.id, "skipping unloadable cache record");
                    continue;
                }
                records.push(CacheRecord {
                    id: result.id,
                    created_at: result.created_at,
                    key: stored.clone(),
                    owner: self.id.clone(),
                });
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn load(&self, ctx: &Context, record: &CacheRecord) -> Result<SharedResult> {
        if record.owner != self.id {
            return Err(SolverError::storage(
                "load",
                format!("record owned by '{}' loaded from '{}'", record.owner, self.id),
            ));
        }
        let result = CacheResult {
            id: record.id.clone(),
            created_at: record.created_at,
        };
        self.results.load(ctx, &result).await
    }

    async fn save(
        &self,
        key: &Arc<CacheKey>,
        result: &SharedResult,
        created_at: DateTime<Utc>,
    ) -> Result<ExportableCacheKey> {
        let stored = self.results.save(result, created_at).await?;
        let id = self.ensure_persistent_key(key)?;
        self.keys.add_result(&id, stored)?;
        tracing::debug!(manager = %self.id, key = %id, result = %result.id(), "saved cache record");

        let exporter = KeyExporter::with_result(
            key.clone(),
            ExportedResult {
                created_at,
                result: result.clone(),
            },
        );
        Ok(ExportableCacheKey::new(key.clone(), Arc::new(exporter)))
    }
}

/// Default manager plus alternate cache sources seen as one manager.
/// Saves only ever go to the default manager.
pub struct CombinedCacheManager {
    id: String,
    managers: Vec<Arc<dyn CacheManager>>,
}

impl CombinedCacheManager {
    pub fn new(main: Arc<dyn CacheManager>, sources: Vec<Arc<dyn CacheManager>>) -> Self {
        let mut managers = vec![main];
        for source in sources {
            if managers.iter().all(|m| m.id() != source.id()) {
                managers.push(source);
            }
        }
        let ids: Vec<&str> = managers.iter().map(|m| m.id()).collect();
        Self {
            id: format!("combined({})", ids.join(",")),
            managers,
        }
    }

    fn main(&self) -> &Arc<dyn CacheManager> {
        &self.managers[0]
    }

    fn owner_of(&self, owner: &str) -> Option<&Arc<dyn CacheManager>> {
        self.managers.iter().find(|m| m.id() == owner)
    }
}

#[async_trait]
impl CacheManager for CombinedCacheManager {
    fn id(&self) -> &str {
        &self.id
    }

    async fn query(
        &self,
        deps: &[CacheKeyWithSelector],
        input: usize,
        digest: &Digest,
        output: usize,
    ) -> Result<Vec<Arc<CacheKey>>> {
        let mut keys = Vec::new();
        for manager in &self.managers {
            keys.extend(manager.query(deps, input, digest, output).await?);
        }
        Ok(keys)
    }

    async fn records(&self, key: &CacheKey) -> Result<Vec<CacheRecord>> {
        if let Some(owner) = key.owner().and_then(|owner| self.owner_of(owner)) {
            return owner.records(key).await;
        }
        let mut records = Vec::new();
        for manager in &self.managers {
            records.extend(manager.records(key).await?);
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn load(&self, ctx: &Context, record: &CacheRecord) -> Result<SharedResult> {
        match self.owner_of(&record.owner) {
            Some(manager) => manager.load(ctx, record).await,
            None => Err(SolverError::not_found("cache manager", record.owner.clone())),
        }
    }

    async fn save(
        &self,
        key: &Arc<CacheKey>,
        result: &SharedResult,
        created_at: DateTime<Utc>,
    ) -> Result<ExportableCacheKey> {
        self.main().save(key, result, created_at).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestResult;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dgst(s: &str) -> Digest {
        Digest::from_bytes(s)
    }

    fn dep(key: &Arc<CacheKey>, selector: Option<Digest>) -> CacheKeyWithSelector {
        CacheKeyWithSelector::new(ExportableCacheKey::bare(key.clone()), selector)
    }

    async fn value_of(manager: &dyn CacheManager, record: &CacheRecord) -> String {
        let result = manager.load(&Context::new(), record).await.unwrap();
        TestResult::value_of(&result)
    }

    #[tokio::test]
    async fn test_in_memory_cache_basic() {
        let m = InMemoryCacheManager::in_memory("local");

        let k0 = CacheKey::new(dgst("foo"), 0);
        m.save(&k0, &TestResult::shared("result0"), Utc::now()).await.unwrap();
        let k1 = CacheKey::with_deps(dgst("bar"), 0, vec![vec![dep(&k0, None)]]);
        m.save(&k1, &TestResult::shared("result1"), Utc::now()).await.unwrap();

        let keys = m.query(&[], 0, &dgst("foo"), 0).await.unwrap();
        assert_eq!(keys.len(), 1);
        let records = m.records(&keys[0]).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(value_of(&m, &records[0]).await, "result0");

        let keys = m.query(&[dep(&k0, None)], 0, &dgst("bar"), 0).await.unwrap();
        assert_eq!(keys.len(), 1);
        let records = m.records(&keys[0]).await.unwrap();
        assert_eq!(value_of(&m, &records[0]).await, "result1");

        // the computed key resolves to the same stored key
        assert_eq!(m.records(&k1).await.unwrap().len(), 1);

        let keys = m.query(&[], 0, &dgst("baz"), 0).await.unwrap();
        assert!(keys.is_empty());
    }

    #[tokio::test]
    async fn test_in_memory_cache_selector() {
        let m = InMemoryCacheManager::in_memory("local");

        let k0 = CacheKey::new(dgst("foo"), 0);
        m.save(&k0, &TestResult::shared("result0"), Utc::now()).await.unwrap();
        let k1 = CacheKey::with_deps(dgst("bar"), 0, vec![vec![dep(&k0, Some(dgst("sel0")))]]);
        m.save(&k1, &TestResult::shared("result1"), Utc::now()).await.unwrap();

        let keys = m.query(&[dep(&k0, None)], 0, &dgst("bar"), 0).await.unwrap();
        assert!(keys.is_empty());
        let keys = m.query(&[dep(&k0, Some(dgst("sel1")))], 0, &dgst("bar"), 0).await.unwrap();
        assert!(keys.is_empty());

        let keys = m.query(&[dep(&k0, Some(dgst("sel0")))], 0, &dgst("bar"), 0).await.unwrap();
        assert_eq!(keys.len(), 1);
        let records = m.records(&keys[0]).await.unwrap();
        assert_eq!(value_of(&m, &records[0]).await, "result1");
    }

    #[tokio::test]
    async fn test_in_memory_cache_multiple_alternatives() {
        let m = InMemoryCacheManager::in_memory("local");

        let a = CacheKey::new(dgst("a"), 0);
        let b = CacheKey::new(dgst("b"), 0);
        m.save(&a, &TestResult::shared("ra"), Utc::now()).await.unwrap();
        m.save(&b, &TestResult::shared("rb"), Utc::now()).await.unwrap();
        let parent = CacheKey::with_deps(dgst("p"), 0, vec![vec![dep(&a, None), dep(&b, None)]]);
        m.save(&parent, &TestResult::shared("rp"), Utc::now()).await.unwrap();

        let via_a = m.query(&[dep(&a, None)], 0, &dgst("p"), 0).await.unwrap();
        let via_b = m.query(&[dep(&b, None)], 0, &dgst("p"), 0).await.unwrap();
        assert_eq!(via_a.len(), 1);
        assert_eq!(via_b.len(), 1);
        assert_eq!(via_a[0].id(), via_b[0].id());
    }

    #[tokio::test]
    async fn test_in_memory_cache_release_parent() {
        let keys = Arc::new(InMemoryKeyStorage::new());
        let m = InMemoryCacheManager::new("local", keys.clone(), Arc::new(InMemoryResultStorage::new()));

        let r0 = TestResult::shared("result0");
        let k0 = CacheKey::new(dgst("foo"), 0);
        m.save(&k0, &r0, Utc::now()).await.unwrap();
        let r1 = TestResult::shared("result1");
        let k1 = CacheKey::with_deps(dgst("bar"), 0, vec![vec![dep(&k0, None)]]);
        m.save(&k1, &r1, Utc::now()).await.unwrap();

        keys.release(r0.id()).unwrap();

        let found = m.query(&[], 0, &dgst("foo"), 0).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(m.records(&found[0]).await.unwrap().is_empty());

        let found = m.query(&[dep(&k0, None)], 0, &dgst("bar"), 0).await.unwrap();
        assert_eq!(found.len(), 1);
        let records = m.records(&found[0]).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(value_of(&m, &records[0]).await, "result1");

        keys.release(r1.id()).unwrap();

        assert!(m.query(&[], 0, &dgst("foo"), 0).await.unwrap().is_empty());
        assert!(keys.is_empty());
    }

    #[tokio::test]
    async fn test_restored_metadata_without_results_is_unloadable() {
        let keys = Arc::new(InMemoryKeyStorage::new());
        let m = InMemoryCacheManager::new("local", keys.clone(), Arc::new(InMemoryResultStorage::new()));
        let k0 = CacheKey::new(dgst("foo"), 0);
        m.save(&k0, &TestResult::shared("result0"), Utc::now()).await.unwrap();

        let restored = InMemoryCacheManager::new(
            "local",
            Arc::new(InMemoryKeyStorage::restore(&keys.snapshot())),
            Arc::new(InMemoryResultStorage::new()),
        );
        let found = restored.query(&[], 0, &dgst("foo"), 0).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(restored.records(&found[0]).await.unwrap().is_empty());
    }

    struct CountingStorage {
        inner: InMemoryResultStorage,
        loads: AtomicUsize,
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

    #[tokio::test]
    async fn test_combined_manager_routes_by_owner() {
        let local: Arc<dyn CacheManager> = Arc::new(InMemoryCacheManager::in_memory("local"));
        let storage = Arc::new(CountingStorage {
            inner: InMemoryResultStorage::new(),
            loads: AtomicUsize::new(0),
        });
        let imported: Arc<dyn CacheManager> = Arc::new(InMemoryCacheManager::new(
            "imported",
            Arc::new(InMemoryKeyStorage::new()),
            storage.clone(),
        ));
        let k0 = CacheKey::new(dgst("foo"), 0);
        imported.save(&k0, &TestResult::shared("remote"), Utc::now()).await.unwrap();

        let combined = CombinedCacheManager::new(local.clone(), vec![imported.clone(), local.clone()]);
        assert_eq!(combined.id(), "combined(local,imported)");

        let keys = combined.query(&[], 0, &dgst("foo"), 0).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].owner(), Some("imported"));
        let records = combined.records(&keys[0]).await.unwrap();
        assert_eq!(records.len(), 1);
        let result = combined.load(&Context::new(), &records[0]).await.unwrap();
        assert_eq!(TestResult::value_of(&result), "remote");
        assert_eq!(storage.loads.load(Ordering::SeqCst), 1);

        // saves land in the default manager only
        let k1 = CacheKey::new(dgst("bar"), 0);
        combined.save(&k1, &TestResult::shared("local"), Utc::now()).await.unwrap();
        assert_eq!(local.query(&[], 0, &dgst("bar"), 0).await.unwrap().len(), 1);
        assert!(imported.query(&[], 0, &dgst("bar"), 0).await.unwrap().is_empty());
    }
}
