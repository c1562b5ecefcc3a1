//! A thread-per-stage pipeline engine for live media streams.
//!
//! Each [`Stage`] owns a dedicated thread and a small [`BoundedRelay`] for
//! its output. A stage pulls one item from upstream, transforms it, and
//! pushes the result into its relay. When a relay is full the oldest item is
//! evicted, so a slow consumer never stalls the producers feeding it: a
//! live camera keeps capturing and the display only ever sees fresh frames.
//!
//! ```text
//! Source -> [capture]=> -> [convert]=> -> [infer]=> -> Orchestrator::tick
//! ```
//!
//! # Features
//!
//! - Drop-oldest relays with per-stage depth and drop counters
//! - Tagged step results: continue, skip, end of stream, fault
//! - End of stream drains downstream, a fault aborts it
//! - Cancellable reads so `stop` never hangs on an idle upstream
//! - Topology discovery from the sink stage
//! - Sliding-window rate meter for FPS reporting
//!
//! # Example
//!
//! ```ignore
//! use relay_pipeline::{ChainBuilder, ChainConfig, IterSource, Map, Orchestrator};
//! use std::ops::ControlFlow;
//!
//! let chain = ChainBuilder::new(ChainConfig::default())
//!     .source("capture", IterSource::new(0..100u32))
//!     .stage("scale", Map::new(|x: u32| x * 2))
//!     .build()?;
//!
//! let summary = Orchestrator::new(chain).run(|tick| {
//!     println!("{} @ {:?} fps", tick.item, tick.rate_hz());
//!     ControlFlow::Continue(())
//! })?;
//! ```

pub mod buffer;
pub mod chain;
pub mod config;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod rate;
pub mod stage;

// Re-exports for convenience
pub use buffer::{BoundedRelay, Termination};
pub use chain::{discover, Chain, ChainBuilder, ChainWiring};
pub use config::{ChainConfig, StageConfig, TerminationMode};
pub use error::{PipelineError, Result};
pub use metrics::{LatencyWindow, MetricsSnapshot, StageMetrics};
pub use orchestrator::{
    FnSink, LogSink, Orchestrator, QueueReport, QueueStatus, RunSummary, TelemetrySink, Tick,
};
pub use rate::RateMeter;
pub use stage::{
    Filter, Flow, FnSource, FnTransform, IterSource, Lifecycle, Map, Passthrough, Source, Stage,
    StageControl, Transform,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
