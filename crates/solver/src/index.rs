//! In-memory de-duplication table over live edges
//!
//! Maps key shapes to the edge currently computing (or holding) the result
//! for that shape. Keys are matched structurally: a leaf key by its root
//! digest, a key with dependencies through the links its dependency keys
//! carry to their parents. Every item is reachable from the back
//! references of a live edge, so releasing all edges leaves the index empty.

use crate::cache::{CacheInfoLink, CacheKey};
use crate::digest::root_key;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Stable identity of an edge in the solver's edge arena
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(u64);

impl EdgeId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "edge#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Owner {
    edge: EdgeId,
    ignore_cache: bool,
}

impl Owner {
    /// Whether a request from `other` may adopt this owner's edge
    fn adoptable_by(&self, other: &Owner) -> bool {
        self.edge != other.edge && (self.ignore_cache || !other.ignore_cache)
    }
}

#[derive(Default)]
struct IndexItem {
    /// Live edges registered under this shape. More than one only when an
    /// ignore-cache edge could not adopt a cached one.
    owners: Vec<Owner>,
    /// Links to parent items
    links: HashMap<CacheInfoLink, HashSet<String>>,
    /// Child items this item links from
    deps: HashSet<String>,
}

#[derive(Default)]
struct IndexInner {
    items: HashMap<String, IndexItem>,
    back_refs: HashMap<EdgeId, HashSet<String>>,
}

#[derive(Default)]
pub struct EdgeIndex {
    inner: Mutex<IndexInner>,
}

impl EdgeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `key` for `edge`, or return the live edge already owning
    /// an equivalent key.
    pub fn load_or_store(&self, key: &Arc<CacheKey>, edge: EdgeId, ignore_cache: bool) -> Option<EdgeId> {
        self.load_or_store_all(std::slice::from_ref(key), edge, ignore_cache)
    }

    /// Register every key of `edge` in one step. If any of them matches a
    /// live edge the caller may adopt, nothing is registered for `edge` and
    /// that edge is returned instead.
    pub fn load_or_store_all(&self, keys: &[Arc<CacheKey>], edge: EdgeId, ignore_cache: bool) -> Option<EdgeId> {
        let owner = Owner { edge, ignore_cache };
        let mut inner = self.inner.lock();

        let matches: Vec<BTreeSet<String>> = keys.iter().map(|k| inner.all_matches(k)).collect();

        for (key, ids) in keys.iter().zip(&matches) {
            let existing = ids.iter().find_map(|id| {
                let item = inner.items.get(id)?;
                let current = item.owners.iter().find(|o| o.adoptable_by(&owner))?;
                Some((id.clone(), current.edge))
            });
            if let Some((id, existing)) = existing {
                inner.enforce_linked(&id, key);
                tracing::trace!(key = %key.digest(), edge = ?edge, into = ?existing, "merged edge");
                return Some(existing);
            }
        }

        for (key, ids) in keys.iter().zip(matches) {
            let id = ids
                .into_iter()
                .next()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            inner.enforce_linked(&id, key);
            if let Some(item) = inner.items.get_mut(&id) {
                if !item.owners.contains(&owner) {
                    item.owners.push(owner);
                }
            }
            inner.back_refs.entry(edge).or_default().insert(id.clone());
            key.index_ids.lock().insert(0, id);
        }
        None
    }

    /// Drop every entry owned by `edge`
    pub fn release(&self, edge: EdgeId) {
        let mut inner = self.inner.lock();
        if let Some(ids) = inner.back_refs.remove(&edge) {
            for id in ids {
                inner.release_edge(&id, edge);
            }
        }
    }

    /// Number of key shape entries
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.items.is_empty() && inner.back_refs.is_empty()
    }

    /// Number of edges holding entries
    pub fn back_ref_count(&self) -> usize {
        self.inner.lock().back_refs.len()
    }
}

impl IndexInner {
    /// Ids of existing items structurally equal to `key`. Read only.
    fn all_matches(&self, key: &CacheKey) -> BTreeSet<String> {
        let deps = key.deps();
        if deps.is_empty() {
            return BTreeSet::from([root_key(key.digest(), key.output()).to_string()]);
        }
        if deps.iter().any(Vec::is_empty) {
            return BTreeSet::new();
        }

        let mut matches: Option<BTreeSet<String>> = None;
        for (input, slot) in deps.iter().enumerate() {
            let mut found = BTreeSet::new();
            for alternative in slot {
                let link = CacheInfoLink {
                    input,
                    output: key.output(),
                    digest: key.digest().clone(),
                    selector: alternative.selector.clone(),
                };
                for child in self.child_ids(&alternative.key.key) {
                    if let Some(parents) = self.items.get(&child).and_then(|item| item.links.get(&link)) {
                        found.extend(parents.iter().cloned());
                    }
                }
            }
            let next = match matches {
                None => found,
                Some(previous) => previous.intersection(&found).cloned().collect(),
            };
            let exhausted = next.is_empty();
            matches = Some(next);
            if exhausted {
                break;
            }
        }
        matches.unwrap_or_default()
    }

    /// Live ids a dependency key is known under
    fn child_ids(&self, key: &CacheKey) -> Vec<String> {
        let memoized: Vec<String> = key
            .index_ids
            .lock()
            .iter()
            .filter(|id| self.items.contains_key(*id))
            .cloned()
            .collect();
        if !memoized.is_empty() {
            return memoized;
        }
        self.all_matches(key)
            .into_iter()
            .filter(|id| self.items.contains_key(id))
            .collect()
    }

    /// Id of an item for `key`, creating (and linking) it when missing
    fn enforce_index_id(&mut self, key: &CacheKey) -> String {
        let live = key
            .index_ids
            .lock()
            .iter()
            .find(|id| self.items.contains_key(*id))
            .cloned();
        if let Some(id) = live {
            return id;
        }
        let id = self
            .all_matches(key)
            .into_iter()
            .next()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.enforce_linked(&id, key);
        *key.index_ids.lock() = vec![id.clone()];
        id
    }

    /// Make sure item `id` exists and every dependency of `key` links to it
    fn enforce_linked(&mut self, id: &str, key: &CacheKey) {
        self.items.entry(id.to_string()).or_default();
        for (input, slot) in key.deps().iter().enumerate() {
            for alternative in slot {
                let child = self.enforce_index_id(&alternative.key.key);
                if child == id {
                    continue;
                }
                let link = CacheInfoLink {
                    input,
                    output: key.output(),
                    digest: key.digest().clone(),
                    selector: alternative.selector.clone(),
                };
                if let Some(item) = self.items.get_mut(&child) {
                    item.links.entry(link).or_default().insert(id.to_string());
                }
                if let Some(item) = self.items.get_mut(id) {
                    item.deps.insert(child);
                }
            }
        }
    }

    fn release_edge(&mut self, id: &str, edge: EdgeId) {
        let Some(item) = self.items.get_mut(id) else {
            return;
        };
        item.owners.retain(|o| o.edge != edge);
        if item.owners.is_empty() && item.links.is_empty() {
            self.remove_item(id);
        }
    }

    /// Remove `target` from the parent links of `id`
    fn release_link(&mut self, id: &str, target: &str) {
        let Some(item) = self.items.get_mut(id) else {
            return;
        };
        item.links.retain(|_, parents| {
            parents.remove(target);
            !parents.is_empty()
        });
        if item.owners.is_empty() && item.links.is_empty() {
            self.remove_item(id);
        }
    }

    fn remove_item(&mut self, id: &str) {
        if let Some(item) = self.items.remove(id) {
            for child in item.deps {
                self.release_link(&child, id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKeyWithSelector, ExportableCacheKey};
    use crate::digest::Digest;

    fn dgst(s: &str) -> Digest {
        Digest::from_bytes(s)
    }

    fn with_deps(name: &str, slots: Vec<Vec<(&Arc<CacheKey>, Option<&str>)>>) -> Arc<CacheKey> {
        let deps = slots
            .into_iter()
            .map(|slot| {
                slot.into_iter()
                    .map(|(key, selector)| {
                        CacheKeyWithSelector::new(ExportableCacheKey::bare(key.clone()), selector.map(dgst))
                    })
                    .collect()
            })
            .collect();
        CacheKey::with_deps(dgst(name), 0, deps)
    }

    #[test]
    fn test_identical_leaf_keys_merge() {
        let index = EdgeIndex::new();
        let (e1, e2) = (EdgeId::next(), EdgeId::next());

        assert_eq!(index.load_or_store(&CacheKey::new(dgst("foo"), 0), e1, false), None);
        assert_eq!(index.load_or_store(&CacheKey::new(dgst("foo"), 0), e2, false), Some(e1));
        assert_eq!(index.load_or_store(&CacheKey::new(dgst("foo"), 1), e2, false), None);

        index.release(e1);
        index.release(e2);
        assert!(index.is_empty());
    }

    #[test]
    fn test_dependency_keys_merge_and_broaden() {
        let index = EdgeIndex::new();
        let (a, b) = (CacheKey::new(dgst("a"), 0), CacheKey::new(dgst("b"), 0));
        let (ea, eb) = (EdgeId::next(), EdgeId::next());
        index.load_or_store(&a, ea, false);
        index.load_or_store(&b, eb, false);

        let (e1, e2, e3, e4) = (EdgeId::next(), EdgeId::next(), EdgeId::next(), EdgeId::next());
        assert_eq!(index.load_or_store(&with_deps("p", vec![vec![(&a, None)]]), e1, false), None);
        // adding an alternative to the slot mutates the existing entry
        assert_eq!(
            index.load_or_store(&with_deps("p", vec![vec![(&a, None), (&b, None)]]), e2, false),
            Some(e1)
        );
        // which is now reachable through the new alternative alone
        assert_eq!(index.load_or_store(&with_deps("p", vec![vec![(&b, None)]]), e3, false), Some(e1));
        // a different selector is a different shape
        assert_eq!(index.load_or_store(&with_deps("p", vec![vec![(&a, Some("sel"))]]), e4, false), None);

        for edge in [e1, e2, e3, e4, ea, eb] {
            index.release(edge);
        }
        assert!(index.is_empty());
    }

    #[test]
    fn test_multiple_slots_must_all_match() {
        let index = EdgeIndex::new();
        let (a, b, c) = (
            CacheKey::new(dgst("a"), 0),
            CacheKey::new(dgst("b"), 0),
            CacheKey::new(dgst("c"), 0),
        );
        let (e1, e2, e3) = (EdgeId::next(), EdgeId::next(), EdgeId::next());
        index.load_or_store(&with_deps("p", vec![vec![(&a, None)], vec![(&b, None)]]), e1, false);
        assert_eq!(
            index.load_or_store(&with_deps("p", vec![vec![(&a, None)], vec![(&c, None)]]), e2, false),
            None
        );
        assert_eq!(
            index.load_or_store(&with_deps("p", vec![vec![(&a, None)], vec![(&b, None)]]), e3, false),
            Some(e1)
        );
        for edge in [e1, e2, e3] {
            index.release(edge);
        }
        assert!(index.is_empty());
    }

    #[test]
    fn test_ignore_cache_merge_rules() {
        let index = EdgeIndex::new();
        let (normal, ignored, later) = (EdgeId::next(), EdgeId::next(), EdgeId::next());

        assert_eq!(index.load_or_store(&CacheKey::new(dgst("v"), 0), normal, false), None);
        // an ignore-cache edge never adopts a cached edge
        assert_eq!(index.load_or_store(&CacheKey::new(dgst("v"), 0), ignored, true), None);
        index.release(normal);
        // a regular edge adopts the ignore-cache one
        assert_eq!(index.load_or_store(&CacheKey::new(dgst("v"), 0), later, false), Some(ignored));

        index.release(ignored);
        index.release(later);
        assert!(index.is_empty());
    }

    #[test]
    fn test_parent_keeps_child_entries_alive() {
        let index = EdgeIndex::new();
        let leaf = CacheKey::new(dgst("leaf"), 0);
        let (child, parent, again) = (EdgeId::next(), EdgeId::next(), EdgeId::next());
        index.load_or_store(&leaf, child, false);
        index.load_or_store(&with_deps("p", vec![vec![(&leaf, None)]]), parent, false);

        index.release(child);
        assert_eq!(index.len(), 2);
        assert_eq!(index.load_or_store(&with_deps("p", vec![vec![(&leaf, None)]]), again, false), Some(parent));

        index.release(parent);
        index.release(again);
        assert!(index.is_empty());
    }

    #[test]
    fn test_registering_all_levels_is_atomic() {
        let index = EdgeIndex::new();
        let (e1, e2) = (EdgeId::next(), EdgeId::next());
        let level0 = CacheKey::new(dgst("seed-a"), 0);
        let level1 = CacheKey::new(dgst("seed-b"), 0);
        assert_eq!(index.load_or_store_all(&[level0, level1], e1, false), None);
        assert_eq!(index.back_ref_count(), 1);

        let other = CacheKey::new(dgst("seed-c"), 0);
        let shared = CacheKey::new(dgst("seed-b"), 0);
        assert_eq!(index.load_or_store_all(&[other, shared], e2, false), Some(e1));
        assert_eq!(index.back_ref_count(), 1);

        index.release(e1);
        index.release(e2);
        assert!(index.is_empty());
    }
}
