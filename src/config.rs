//! Chain configuration.
//!
//! Capacities, telemetry and failure handling can be set in code through the
//! builder or loaded from a TOML file:
//!
//! ```toml
//! capacity = 2
//! rate_window = 10
//! report_queues = true
//! termination = "propagate"
//!
//! [capacities]
//! inference = 1
//! ```

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Default relay capacity for every stage
pub const DEFAULT_CAPACITY: usize = 2;
/// Default number of intervals averaged by the orchestrator's rate meter
pub const DEFAULT_RATE_WINDOW: usize = 10;

/// How a stage's exit and stop requests reach its neighbours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationMode {
    /// Exits close the stage's relay so consumers drain (end of stream) or
    /// abort (fault). Blocked upstream reads are interrupted by `stop`.
    #[default]
    Propagate,
    /// Exits are silent and consumers starve. Reads cannot be interrupted,
    /// so a chain must be stopped sink first. Panics in a transform kill
    /// the stage thread.
    Starve,
}

/// Settings for a single stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageConfig {
    pub name: String,
    /// Capacity of the stage's output relay
    pub capacity: usize,
    pub termination: TerminationMode,
}

impl StageConfig {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            termination: TerminationMode::default(),
        }
    }

    pub fn with_termination(mut self, termination: TerminationMode) -> Self {
        self.termination = termination;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(PipelineError::ConfigError(format!(
                "capacity for stage '{}' must be at least 1",
                self.name
            )));
        }
        Ok(())
    }
}

/// Settings shared by every stage of a chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Relay capacity used when a stage has no override
    pub capacity: usize,
    /// Per-stage relay capacities, keyed by stage name
    pub capacities: BTreeMap<String, usize>,
    /// Intervals averaged by the rate meter
    pub rate_window: usize,
    /// Report queue depth and drops on every tick
    pub report_queues: bool,
    pub termination: TerminationMode,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            capacities: BTreeMap::new(),
            rate_window: DEFAULT_RATE_WINDOW,
            report_queues: false,
            termination: TerminationMode::default(),
        }
    }
}

impl ChainConfig {
    /// Settings for the named stage under this chain config
    pub fn stage(&self, name: impl Into<String>) -> StageConfig {
        let name = name.into();
        StageConfig {
            capacity: self.capacity_for(&name),
            termination: self.termination,
            name,
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| PipelineError::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::ConfigError(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Reject settings no chain can run with
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(PipelineError::ConfigError(
                "capacity must be at least 1".into(),
            ));
        }
        if let Some((name, _)) = self.capacities.iter().find(|(_, &cap)| cap == 0) {
            return Err(PipelineError::ConfigError(format!(
                "capacity for stage '{}' must be at least 1",
                name
            )));
        }
        if self.rate_window == 0 {
            return Err(PipelineError::ConfigError(
                "rate_window must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Relay capacity for the named stage
    pub fn capacity_for(&self, stage: &str) -> usize {
        self.capacities.get(stage).copied().unwrap_or(self.capacity)
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_stage_capacity(mut self, stage: impl Into<String>, capacity: usize) -> Self {
        self.capacities.insert(stage.into(), capacity);
        self
    }

    pub fn with_termination(mut self, termination: TerminationMode) -> Self {
        self.termination = termination;
        self
    }

    pub fn with_report_queues(mut self, enable: bool) -> Self {
        self.report_queues = enable;
        self
    }

    pub fn with_rate_window(mut self, window: usize) -> Self {
        self.rate_window = window;
        self
    }
}
