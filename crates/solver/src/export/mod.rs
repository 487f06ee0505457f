//! Cache export
//!
//! Every key returned from a build carries an [`Exporter`] able to walk its
//! dependency graph depth first and emit one record per distinct digest
//! into a [`CacheExporterTarget`].

mod memory;

pub use memory::{
    ExportedCacheConfig, ExportedLink, ExportedRecord, ExportedResultEntry, InMemoryExportTarget,
};

use crate::cache::CacheKey;
use crate::context::Context;
use crate::digest::Digest;
use crate::errors::{Result, SolverError};
use crate::vertex::SharedResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// How much of the result graph an export carries
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportMode {
    /// Results only where needed to reconstruct the exported root
    #[default]
    Min,
    /// Results at every node that has one
    Max,
}

impl FromStr for ExportMode {
    type Err = SolverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            other => Err(SolverError::configuration(format!(
                "unknown export mode '{other}', expected 'min' or 'max'"
            ))),
        }
    }
}

impl fmt::Display for ExportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Min => write!(f, "min"),
            Self::Max => write!(f, "max"),
        }
    }
}

/// Location of an exported result blob
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remote {
    pub result_id: String,
}

/// Maps a local result to its exported form
#[async_trait]
pub trait RemoteResolver: Send + Sync {
    /// `None` skips the result attachment for that node
    async fn resolve(&self, ctx: &Context, result: &SharedResult) -> Result<Option<Remote>>;
}

/// Exports results by id
#[derive(Debug, Default)]
pub struct DefaultRemoteResolver;

#[async_trait]
impl RemoteResolver for DefaultRemoteResolver {
    async fn resolve(&self, _ctx: &Context, result: &SharedResult) -> Result<Option<Remote>> {
        Ok(Some(Remote {
            result_id: result.id().to_string(),
        }))
    }
}

#[derive(Clone)]
pub struct CacheExportOpt {
    pub mode: ExportMode,
    /// Set for the key the export was started from
    pub is_root: bool,
    pub resolver: Arc<dyn RemoteResolver>,
}

impl CacheExportOpt {
    pub fn new(mode: ExportMode) -> Self {
        Self {
            mode,
            is_root: true,
            resolver: Arc::new(DefaultRemoteResolver),
        }
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn RemoteResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Options used when descending into dependency keys
    pub fn for_dependency(&self) -> Self {
        Self {
            is_root: false,
            ..self.clone()
        }
    }

    fn wants_result(&self) -> bool {
        self.is_root || self.mode == ExportMode::Max
    }
}

impl fmt::Debug for CacheExportOpt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheExportOpt")
            .field("mode", &self.mode)
            .field("is_root", &self.is_root)
            .finish()
    }
}

/// Receiver of exported records
pub trait CacheExporterTarget: Send + Sync {
    /// Record for `digest`; adding the same digest again returns the same record
    fn add(&self, digest: &Digest) -> Arc<dyn CacheExporterRecord>;
    fn visit(&self, id: &str);
    fn visited(&self, id: &str) -> bool;
}

pub trait CacheExporterRecord: Send + Sync {
    fn digest(&self) -> &Digest;
    fn add_result(&self, created_at: DateTime<Utc>, remote: Remote);
    /// Declare `source` as input `index` of this record
    fn link_from(&self, source: &Arc<dyn CacheExporterRecord>, index: usize, selector: Option<&Digest>);
}

/// Walks a key's dependency graph into a target
#[async_trait]
pub trait Exporter: Send + Sync {
    async fn export_to(
        &self,
        ctx: &Context,
        target: &dyn CacheExporterTarget,
        opt: &CacheExportOpt,
    ) -> Result<Vec<Arc<dyn CacheExporterRecord>>>;
}

/// A result attached to a key at export time
#[derive(Clone)]
pub struct ExportedResult {
    pub created_at: DateTime<Utc>,
    pub result: SharedResult,
}

/// Result cell shared between an edge and the exporters of its keys.
/// Filled once the edge has a result.
#[derive(Clone, Default)]
pub(crate) struct ResultSlot(Arc<RwLock<Option<ExportedResult>>>);

impl ResultSlot {
    pub(crate) fn set(&self, result: ExportedResult) {
        *self.0.write() = Some(result);
    }

    pub(crate) fn get(&self) -> Option<ExportedResult> {
        self.0.read().clone()
    }
}

/// Exporter of a key computed by the solver
pub(crate) struct KeyExporter {
    key: Arc<CacheKey>,
    slot: ResultSlot,
}

impl KeyExporter {
    pub(crate) fn new(key: Arc<CacheKey>, slot: ResultSlot) -> Self {
        Self { key, slot }
    }

    pub(crate) fn with_result(key: Arc<CacheKey>, result: ExportedResult) -> Self {
        let slot = ResultSlot::default();
        slot.set(result);
        Self::new(key, slot)
    }
}

#[async_trait]
impl Exporter for KeyExporter {
    async fn export_to(
        &self,
        ctx: &Context,
        target: &dyn CacheExporterTarget,
        opt: &CacheExportOpt,
    ) -> Result<Vec<Arc<dyn CacheExporterRecord>>> {
        if ctx.is_cancelled() {
            return Err(SolverError::Cancelled);
        }
        let record = target.add(&self.key.root_digest());
        if target.visited(self.key.id()) {
            return Ok(vec![record]);
        }

        let dep_opt = opt.for_dependency();
        for (input, slot) in self.key.deps().iter().enumerate() {
            for alternative in slot {
                let sources = match &alternative.key.exporter {
                    Some(exporter) => exporter.export_to(ctx, target, &dep_opt).await?,
                    None => vec![target.add(&alternative.key.key.root_digest())],
                };
                for source in &sources {
                    record.link_from(source, input, alternative.selector.as_ref());
                }
            }
        }

        if opt.wants_result() {
            if let Some(exported) = self.slot.get() {
                if let Some(remote) = opt.resolver.resolve(ctx, &exported.result).await? {
                    record.add_result(exported.created_at, remote);
                }
            }
        }

        target.visit(self.key.id());
        tracing::trace!(digest = %record.digest(), mode = %opt.mode, "exported cache record");
        Ok(vec![record])
    }
}
