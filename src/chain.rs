use crate::config::ChainConfig;
use crate::error::Result;
use crate::orchestrator::{QueueReport, QueueStatus};
use crate::stage::{Passthrough, Source, Stage, StageControl, Transform};
use std::sync::Arc;
use tracing::{debug, warn};

/// Walk upstream links from `tail` and return every stage, head first
pub fn discover(tail: Arc<dyn StageControl>) -> Vec<Arc<dyn StageControl>> {
    let mut stages = Vec::new();
    let mut cursor = Some(tail);
    while let Some(stage) = cursor {
        cursor = stage.upstream();
        stages.push(stage);
    }
    stages.reverse();
    stages
}

/// A linear sequence of stages from source to sink.
///
/// The ordered stage list is discovered once when the chain is assembled.
pub struct Chain<T> {
    config: ChainConfig,
    stages: Vec<Arc<dyn StageControl>>,
    tail: Arc<Stage<T>>,
}

impl<T: Send + 'static> Chain<T> {
    /// Assemble a chain from its last stage using the default config
    pub fn from_tail(tail: Arc<Stage<T>>) -> Self {
        Self::with_config(tail, ChainConfig::default())
    }

    pub fn with_config(tail: Arc<Stage<T>>, config: ChainConfig) -> Self {
        let link: Arc<dyn StageControl> = tail.clone();
        let stages = discover(link);
        debug!(
            stages = stages.len(),
            tail = %tail.name(),
            "chain assembled"
        );
        Self {
            config,
            stages,
            tail,
        }
    }

    /// Start every stage, consumers before producers.
    ///
    /// Each stage just blocks until its upstream produces, so any order
    /// works. If one fails to start, the stages already started are
    /// stopped again.
    pub fn start(&self) -> Result<()> {
        for (started, stage) in self.stages.iter().rev().enumerate() {
            if let Err(e) = stage.start() {
                warn!(stage = %stage.name(), error = %e, "failed to start stage");
                for running in self.stages.iter().rev().take(started) {
                    if let Err(stop_err) = running.stop() {
                        warn!(stage = %running.name(), error = %stop_err, "failed to stop stage");
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Block until the sink produces its next item
    pub fn get(&self) -> Result<T> {
        self.tail.get()
    }

    pub fn tail(&self) -> &Arc<Stage<T>> {
        &self.tail
    }

    /// Stages in source-to-sink order
    pub fn stages(&self) -> &[Arc<dyn StageControl>] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Always false: a chain holds at least its tail
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Whether any stage thread is still live
    pub fn is_running(&self) -> bool {
        self.stages.iter().any(|stage| stage.is_running())
    }

    /// Current depth, drop count and recent latency of every stage, in chain order
    pub fn queue_report(&self) -> QueueReport {
        QueueReport {
            stages: self
                .stages
                .iter()
                .map(|stage| QueueStatus {
                    stage: stage.name().to_string(),
                    depth: stage.depth(),
                    drops: stage.drop_count(),
                    latency_p95: stage.metrics().latency_p95(),
                })
                .collect(),
        }
    }

    /// Get a summary of all metrics
    pub fn metrics_summary(&self) -> String {
        let mut summary = String::from("Chain Metrics Summary:\n");
        for stage in &self.stages {
            let snapshot = stage.metrics().snapshot();
            summary.push_str(&format!(
                "  Stage {} ({}): {}\n",
                stage.position(),
                stage.name(),
                snapshot.format()
            ));
        }
        summary
    }
}

impl<T> Chain<T> {
    /// Stop every stage, sink first.
    ///
    /// Every stage is stopped even if an earlier one fails; the first
    /// error is returned. Dropping a chain stops it the same way.
    pub fn stop(&self) -> Result<()> {
        let mut first_error = None;
        for stage in self.stages.iter().rev() {
            if let Err(e) = stage.stop() {
                warn!(stage = %stage.name(), error = %e, "failed to stop stage");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<T> Drop for Chain<T> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "failed to stop chain on drop");
        }
    }
}

/// Assembles a chain from a source and the stages after it
pub struct ChainBuilder {
    config: ChainConfig,
}

impl ChainBuilder {
    pub fn new(config: ChainConfig) -> Self {
        Self { config }
    }

    /// Head stage forwarding source items unchanged
    pub fn source<S: Source>(self, name: impl Into<String>, source: S) -> ChainWiring<S::Item> {
        self.head(name, source, Passthrough)
    }

    /// Head stage applying `transform` to every source item
    pub fn head<S, X>(self, name: impl Into<String>, source: S, transform: X) -> ChainWiring<X::Output>
    where
        S: Source,
        X: Transform<S::Item>,
    {
        let tail = self
            .config
            .validate()
            .and_then(|()| Stage::head(self.config.stage(name), source, transform));
        ChainWiring {
            config: self.config,
            tail,
        }
    }
}

/// Partially wired chain ending in a stage producing `T`.
///
/// Wiring errors are kept until [`build`](ChainWiring::build).
pub struct ChainWiring<T> {
    config: ChainConfig,
    tail: Result<Arc<Stage<T>>>,
}

impl<T: Send + 'static> ChainWiring<T> {
    /// Append a stage pulling from the current tail
    pub fn stage<X>(self, name: impl Into<String>, transform: X) -> ChainWiring<X::Output>
    where
        X: Transform<T>,
    {
        let config = self.config.stage(name);
        let tail = self
            .tail
            .and_then(|upstream| Stage::downstream(&upstream, config, transform));
        ChainWiring {
            config: self.config,
            tail,
        }
    }

    /// Build the chain
    pub fn build(self) -> Result<Chain<T>> {
        Ok(Chain::with_config(self.tail?, self.config))
    }
}
