use super::{CacheExporterRecord, CacheExporterTarget, Remote};
use crate::digest::Digest;
use crate::errors::{Result, SolverError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Link from an input record into a record
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExportedLink {
    pub input: usize,
    pub source: Digest,
    pub selector: Option<Digest>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportedResultEntry {
    pub created_at: DateTime<Utc>,
    pub remote: Remote,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportedRecord {
    pub digest: Digest,
    pub results: Vec<ExportedResultEntry>,
    pub inputs: Vec<ExportedLink>,
}

/// Serializable provenance graph collected by [`InMemoryExportTarget`]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportedCacheConfig {
    pub records: Vec<ExportedRecord>,
}

impl ExportedCacheConfig {
    pub fn record(&self, digest: &Digest) -> Option<&ExportedRecord> {
        self.records.iter().find(|r| &r.digest == digest)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SolverError::serialization("failed to encode exported cache", e))
    }
}

#[derive(Default)]
struct RecordState {
    results: Vec<ExportedResultEntry>,
    links: BTreeSet<ExportedLink>,
}

struct MemoryRecord {
    digest: Digest,
    state: Mutex<RecordState>,
}

impl CacheExporterRecord for MemoryRecord {
    fn digest(&self) -> &Digest {
        &self.digest
    }

    fn add_result(&self, created_at: DateTime<Utc>, remote: Remote) {
        let mut state = self.state.lock();
        if state.results.iter().all(|r| r.remote != remote) {
            state.results.push(ExportedResultEntry { created_at, remote });
        }
    }

    fn link_from(&self, source: &Arc<dyn CacheExporterRecord>, index: usize, selector: Option<&Digest>) {
        self.state.lock().links.insert(ExportedLink {
            input: index,
            source: source.digest().clone(),
            selector: selector.cloned(),
        });
    }
}

#[derive(Default)]
struct TargetState {
    records: Vec<Arc<MemoryRecord>>,
    by_digest: HashMap<Digest, usize>,
    visited: HashSet<String>,
}

/// Export target collecting records in memory
#[derive(Default)]
pub struct InMemoryExportTarget {
    state: Mutex<TargetState>,
}

impl InMemoryExportTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records in the order they were first added
    pub fn to_config(&self) -> ExportedCacheConfig {
        let state = self.state.lock();
        let records = state
            .records
            .iter()
            .map(|record| {
                let inner = record.state.lock();
                ExportedRecord {
                    digest: record.digest.clone(),
                    results: inner.results.clone(),
                    inputs: inner.links.iter().cloned().collect(),
                }
            })
            .collect();
        ExportedCacheConfig { records }
    }
}

impl CacheExporterTarget for InMemoryExportTarget {
    fn add(&self, digest: &Digest) -> Arc<dyn CacheExporterRecord> {
        let mut state = self.state.lock();
        if let Some(&index) = state.by_digest.get(digest) {
            return state.records[index].clone();
        }
        let record = Arc::new(MemoryRecord {
            digest: digest.clone(),
            state: Mutex::new(RecordState::default()),
        });
        let index = state.records.len();
        state.records.push(record.clone());
        state.by_digest.insert(digest.clone(), index);
        record
    }

    fn visit(&self, id: &str) {
        self.state.lock().visited.insert(id.to_string());
    }

    fn visited(&self, id: &str) -> bool {
        self.state.lock().visited.contains(id)
    }
}
