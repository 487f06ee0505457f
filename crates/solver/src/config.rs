//! Solver configuration
//!
//! Settings come from defaults, an optional JSON document and finally the
//! `CUENV_SOLVER_*` environment variables, in that order.

use crate::errors::{Result, SolverError};
use crate::export::ExportMode;
use serde::{Deserialize, Serialize};

/// Caps concurrent vertex executions
pub const MAX_PARALLEL_EXECS_VAR: &str = "CUENV_SOLVER_MAX_PARALLEL_EXECS";
/// Default export mode, `min` or `max`
pub const EXPORT_MODE_VAR: &str = "CUENV_SOLVER_EXPORT_MODE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Maximum number of concurrent `exec` calls; `None` is unlimited
    pub max_parallel_execs: Option<usize>,

    /// Export mode used by [`crate::Solver::export_opt`]
    pub default_export_mode: ExportMode,

    /// Whether the extra cache sources declared by vertices are consulted
    pub query_alternate_sources: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_parallel_execs: None,
            default_export_mode: ExportMode::Min,
            query_alternate_sources: true,
        }
    }
}

impl SolverConfig {
    pub fn builder() -> SolverConfigBuilder {
        SolverConfigBuilder::default()
    }

    pub fn from_json_str(data: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(data)
            .map_err(|e| SolverError::serialization("invalid solver configuration", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup(MAX_PARALLEL_EXECS_VAR) {
            let value = value.trim();
            self.max_parallel_execs = if value.is_empty() || value == "unlimited" {
                None
            } else {
                Some(value.parse().map_err(|_| {
                    SolverError::configuration(format!("{MAX_PARALLEL_EXECS_VAR} must be a number, got '{value}'"))
                })?)
            };
        }
        if let Some(value) = lookup(EXPORT_MODE_VAR) {
            self.default_export_mode = value.parse()?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_execs == Some(0) {
            return Err(SolverError::configuration("max_parallel_execs must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct SolverConfigBuilder {
    config: SolverConfig,
}

impl SolverConfigBuilder {
    pub fn max_parallel_execs(mut self, limit: usize) -> Self {
        self.config.max_parallel_execs = Some(limit);
        self
    }

    pub fn default_export_mode(mut self, mode: ExportMode) -> Self {
        self.config.default_export_mode = mode;
        self
    }

    pub fn query_alternate_sources(mut self, enabled: bool) -> Self {
        self.config.query_alternate_sources = enabled;
        self
    }

    pub fn build(self) -> Result<SolverConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
