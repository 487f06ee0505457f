//! Storage backends behind the in-memory cache manager
//!
//! Key graph and result blobs are stored separately: releasing a result
//! never deletes keys that other live keys still link to, and a key can
//! outlive every result it was once bound to.

use super::key::CacheInfoLink;
use crate::context::Context;
use crate::errors::{Result, SolverError};
use crate::vertex::{retain, SharedResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Binding of a key to a stored result
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheResult {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

/// Persistent graph of cache keys and their result bindings
pub trait CacheKeyStorage: Send + Sync {
    fn exists(&self, id: &str) -> bool;

    fn results(&self, id: &str) -> Vec<CacheResult>;

    fn add_result(&self, id: &str, result: CacheResult) -> Result<()>;

    /// Drop a result from every key, collecting keys left unreachable
    fn release(&self, result_id: &str) -> Result<()>;

    /// Link dependency key `id` to parent key `target`
    fn add_link(&self, id: &str, link: CacheInfoLink, target: &str) -> Result<()>;

    fn walk_links(&self, id: &str, link: &CacheInfoLink) -> Vec<String>;

    fn has_link(&self, id: &str, link: &CacheInfoLink, target: &str) -> bool;
}

/// Storage of the result values themselves
#[async_trait]
pub trait CacheResultStorage: Send + Sync {
    async fn save(&self, result: &SharedResult, created_at: DateTime<Utc>) -> Result<CacheResult>;

    async fn load(&self, ctx: &Context, result: &CacheResult) -> Result<SharedResult>;

    async fn exists(&self, id: &str) -> bool;
}

#[derive(Default)]
struct KeyEntry {
    results: HashMap<String, CacheResult>,
    links: HashMap<CacheInfoLink, HashSet<String>>,
    backlinks: HashSet<String>,
}

impl KeyEntry {
    fn is_unreferenced(&self) -> bool {
        self.results.is_empty() && self.links.values().all(HashSet::is_empty)
    }
}

#[derive(Default)]
struct KeyGraph {
    keys: HashMap<String, KeyEntry>,
    by_result: HashMap<String, HashSet<String>>,
}

impl KeyGraph {
    /// Remove `id` if nothing keeps it alive, then revisit its dependencies
    fn collect(&mut self, id: &str) {
        let mut pending = vec![id.to_string()];
        while let Some(id) = pending.pop() {
            let removable = self.keys.get(&id).is_some_and(KeyEntry::is_unreferenced);
            if !removable {
                continue;
            }
            let Some(entry) = self.keys.remove(&id) else {
                continue;
            };
            tracing::trace!(key = %id, "removing unreferenced cache key");
            for child in entry.backlinks {
                if let Some(child_entry) = self.keys.get_mut(&child) {
                    for targets in child_entry.links.values_mut() {
                        targets.remove(&id);
                    }
                    child_entry.links.retain(|_, targets| !targets.is_empty());
                    pending.push(child);
                }
            }
        }
    }
}

/// Key graph held in process memory
#[derive(Default)]
pub struct InMemoryKeyStorage {
    graph: RwLock<KeyGraph>,
}

impl InMemoryKeyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored
    pub fn len(&self) -> usize {
        self.graph.read().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializable copy of the key graph
    pub fn snapshot(&self) -> KeyStorageSnapshot {
        let graph = self.graph.read();
        let mut keys: Vec<KeySnapshot> = graph
            .keys
            .iter()
            .map(|(id, entry)| {
                let mut results: Vec<CacheResult> = entry.results.values().cloned().collect();
                results.sort_by(|a, b| a.id.cmp(&b.id));
                let mut links: Vec<LinkSnapshot> = entry
                    .links
                    .iter()
                    .map(|(link, targets)| {
                        let mut targets: Vec<String> = targets.iter().cloned().collect();
                        targets.sort();
                        LinkSnapshot {
                            link: link.clone(),
                            targets,
                        }
                    })
                    .collect();
                links.sort_by(|a, b| a.link.cmp(&b.link));
                KeySnapshot {
                    id: id.clone(),
                    results,
                    links,
                }
            })
            .collect();
        keys.sort_by(|a, b| a.id.cmp(&b.id));
        KeyStorageSnapshot { keys }
    }

    /// Rebuild a key graph from persisted metadata
    pub fn restore(snapshot: &KeyStorageSnapshot) -> Self {
        let mut graph = KeyGraph::default();
        for key in &snapshot.keys {
            let entry = graph.keys.entry(key.id.clone()).or_default();
            for result in &key.results {
                entry.results.insert(result.id.clone(), result.clone());
            }
            for link in &key.links {
                entry
                    .links
                    .entry(link.link.clone())
                    .or_default()
                    .extend(link.targets.iter().cloned());
            }
            for result in &key.results {
                graph
                    .by_result
                    .entry(result.id.clone())
                    .or_default()
                    .insert(key.id.clone());
            }
        }
        for key in &snapshot.keys {
            for link in &key.links {
                for target in &link.targets {
                    graph
                        .keys
                        .entry(target.clone())
                        .or_default()
                        .backlinks
                        .insert(key.id.clone());
                }
            }
        }
        Self {
            graph: RwLock::new(graph),
        }
    }
}

impl CacheKeyStorage for InMemoryKeyStorage {
    fn exists(&self, id: &str) -> bool {
        self.graph.read().keys.contains_key(id)
    }

    fn results(&self, id: &str) -> Vec<CacheResult> {
        self.graph
            .read()
            .keys
            .get(id)
            .map(|entry| entry.results.values().cloned().collect())
            .unwrap_or_default()
    }

    fn add_result(&self, id: &str, result: CacheResult) -> Result<()> {
        let mut graph = self.graph.write();
        graph
            .by_result
            .entry(result.id.clone())
            .or_default()
            .insert(id.to_string());
        graph
            .keys
            .entry(id.to_string())
            .or_default()
            .results
            .insert(result.id.clone(), result);
        Ok(())
    }

    fn release(&self, result_id: &str) -> Result<()> {
        let mut graph = self.graph.write();
        let Some(ids) = graph.by_result.remove(result_id) else {
            return Ok(());
        };
        for id in ids {
            if let Some(entry) = graph.keys.get_mut(&id) {
                entry.results.remove(result_id);
            }
            graph.collect(&id);
        }
        Ok(())
    }

    fn add_link(&self, id: &str, link: CacheInfoLink, target: &str) -> Result<()> {
        if id == target {
            return Err(SolverError::storage(
                "add link",
                format!("key '{id}' cannot link to itself"),
            ));
        }
        let mut graph = self.graph.write();
        graph
            .keys
            .entry(id.to_string())
            .or_default()
            .links
            .entry(link)
            .or_default()
            .insert(target.to_string());
        graph
            .keys
            .entry(target.to_string())
            .or_default()
            .backlinks
            .insert(id.to_string());
        Ok(())
    }

    fn walk_links(&self, id: &str, link: &CacheInfoLink) -> Vec<String> {
        let graph = self.graph.read();
        let mut targets: Vec<String> = graph
            .keys
            .get(id)
            .and_then(|entry| entry.links.get(link))
            .map(|targets| targets.iter().cloned().collect())
            .unwrap_or_default();
        targets.sort();
        targets
    }

    fn has_link(&self, id: &str, link: &CacheInfoLink, target: &str) -> bool {
        self.graph
            .read()
            .keys
            .get(id)
            .and_then(|entry| entry.links.get(link))
            .is_some_and(|targets| targets.contains(target))
    }
}

/// Persisted form of [`InMemoryKeyStorage`]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyStorageSnapshot {
    pub keys: Vec<KeySnapshot>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeySnapshot {
    pub id: String,
    pub results: Vec<CacheResult>,
    pub links: Vec<LinkSnapshot>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinkSnapshot {
    pub link: CacheInfoLink,
    pub targets: Vec<String>,
}

impl KeyStorageSnapshot {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| SolverError::serialization("Failed to serialize key storage snapshot", e))
    }

    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data)
            .map_err(|e| SolverError::serialization("Failed to parse key storage snapshot", e))
    }
}

/// Result values held in process memory. The storage keeps its own
/// reference to every saved result and hands out a new one per load, so
/// callers release what they load without affecting the stored value.
#[derive(Default)]
pub struct InMemoryResultStorage {
    results: DashMap<String, SharedResult>,
}

impl InMemoryResultStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the stored reference to a result. Returns whether it was stored.
    pub async fn remove(&self, ctx: &Context, id: &str) -> Result<bool> {
        let Some((_, stored)) = self.results.remove(id) else {
            return Ok(false);
        };
        stored.release(ctx).await?;
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

#[async_trait]
impl CacheResultStorage for InMemoryResultStorage {
    async fn save(&self, result: &SharedResult, created_at: DateTime<Utc>) -> Result<CacheResult> {
        self.results
            .entry(result.id().to_string())
            .or_insert_with(|| retain(result));
        Ok(CacheResult {
            id: result.id().to_string(),
            created_at,
        })
    }

    async fn load(&self, _ctx: &Context, result: &CacheResult) -> Result<SharedResult> {
        self.results
            .get(&result.id)
            .map(|entry| retain(entry.value()))
            .ok_or_else(|| SolverError::not_found("result", result.id.clone()))
    }

    async fn exists(&self, id: &str) -> bool {
        self.results.contains_key(id)
    }
}
