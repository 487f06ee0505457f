//! Cache key data model
//!
//! Keys are plain data. Two keys are equal when their digest, output slot
//! and dependency slots are structurally equal; the `id` only names one
//! particular key object (a stored key id, or a fresh id for computed keys).

use crate::digest::{root_key, Digest};
use crate::export::Exporter;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Structural identity of a computation's output
pub struct CacheKey {
    id: String,
    digest: Digest,
    output: usize,
    deps: Vec<Vec<CacheKeyWithSelector>>,
    owner: Option<String>,
    /// Edge index entries this key resolved to, memoized by the index
    pub(crate) index_ids: Mutex<Vec<String>>,
}

impl CacheKey {
    /// Key without dependencies
    pub fn new(digest: Digest, output: usize) -> Arc<Self> {
        Self::with_deps(digest, output, Vec::new())
    }

    /// Key with one slot of alternatives per input
    pub fn with_deps(digest: Digest, output: usize, deps: Vec<Vec<CacheKeyWithSelector>>) -> Arc<Self> {
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            digest,
            output,
            deps,
            owner: None,
            index_ids: Mutex::new(Vec::new()),
        })
    }

    /// Key handed out by a cache manager; `id` is the manager's storage id
    pub(crate) fn stored(id: String, digest: Digest, output: usize, owner: &str) -> Arc<Self> {
        Arc::new(Self {
            id,
            digest,
            output,
            deps: Vec::new(),
            owner: Some(owner.to_string()),
            index_ids: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn output(&self) -> usize {
        self.output
    }

    pub fn deps(&self) -> &[Vec<CacheKeyWithSelector>] {
        &self.deps
    }

    /// Id of the cache manager this key was loaded from, if any
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Digest naming the (digest, output) pair regardless of deps
    pub fn root_digest(&self) -> Digest {
        root_key(&self.digest, self.output)
    }

    /// Copy of this key with extra alternatives appended to `slot`
    pub(crate) fn with_alternatives(&self, slot: usize, extra: Vec<CacheKeyWithSelector>) -> Arc<Self> {
        let mut deps = self.deps.clone();
        if let Some(alternatives) = deps.get_mut(slot) {
            for candidate in extra {
                if !alternatives.contains(&candidate) {
                    alternatives.push(candidate);
                }
            }
        }
        Self::with_deps(self.digest.clone(), self.output, deps)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest && self.output == other.output && self.deps == other.deps
    }
}

impl Eq for CacheKey {}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheKey")
            .field("id", &self.id)
            .field("digest", &self.digest)
            .field("output", &self.output)
            .field("deps", &self.deps)
            .finish()
    }
}

/// A key together with something able to walk and emit its provenance
#[derive(Clone)]
pub struct ExportableCacheKey {
    pub key: Arc<CacheKey>,
    pub exporter: Option<Arc<dyn Exporter>>,
}

impl ExportableCacheKey {
    pub fn new(key: Arc<CacheKey>, exporter: Arc<dyn Exporter>) -> Self {
        Self {
            key,
            exporter: Some(exporter),
        }
    }

    /// Key without provenance information
    pub fn bare(key: Arc<CacheKey>) -> Self {
        Self {
            key,
            exporter: None,
        }
    }
}

impl PartialEq for ExportableCacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl fmt::Debug for ExportableCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.key.fmt(f)
    }
}

/// One alternative inside a dependency slot
#[derive(Clone, PartialEq, Debug)]
pub struct CacheKeyWithSelector {
    pub key: ExportableCacheKey,
    pub selector: Option<Digest>,
}

impl CacheKeyWithSelector {
    pub fn new(key: ExportableCacheKey, selector: Option<Digest>) -> Self {
        Self { key, selector }
    }
}

/// Edge of the stored key graph: a dependency key links to its parent
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheInfoLink {
    pub input: usize,
    pub output: usize,
    pub digest: Digest,
    pub selector: Option<Digest>,
}

/// A stored binding from a key to a result
#[derive(Clone, Debug)]
pub struct CacheRecord {
    /// Result id
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub key: Arc<CacheKey>,
    /// Id of the manager holding the record
    pub owner: String,
}
