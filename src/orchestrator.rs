//! The consumer end of a chain.
//!
//! An [`Orchestrator`] repeatedly pulls finished items off the sink stage,
//! keeps a [`RateMeter`] over the pull interval, and optionally hands a
//! per-stage queue report to a [`TelemetrySink`] on every tick.

use crate::chain::Chain;
use crate::error::{PipelineError, Result};
use crate::rate::RateMeter;
use std::fmt;
use std::ops::ControlFlow;
use std::time::Duration;
use tracing::{debug, info};

/// Queue state of one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    pub stage: String,
    pub depth: usize,
    pub drops: u64,
    /// 95th percentile `process` time over the stage's recent calls
    pub latency_p95: Duration,
}

/// Queue state of every stage, in chain order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueReport {
    pub stages: Vec<QueueStatus>,
}

impl QueueReport {
    /// `(depth, drops)` per stage
    pub fn pairs(&self) -> Vec<(usize, u64)> {
        self.stages.iter().map(|s| (s.depth, s.drops)).collect()
    }

    pub fn total_drops(&self) -> u64 {
        self.stages.iter().map(|s| s.drops).sum()
    }

    /// The stage with the highest recent `process` latency, the chain's bottleneck
    pub fn slowest(&self) -> Option<&QueueStatus> {
        self.stages
            .iter()
            .filter(|s| !s.latency_p95.is_zero())
            .max_by_key(|s| s.latency_p95)
    }
}

/// Renders as `DD DDDDDD - DD DDDDDD - ...`: depth then drop count per stage
impl fmt::Display for QueueReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, status) in self.stages.iter().enumerate() {
            if i > 0 {
                f.write_str(" - ")?;
            }
            write!(f, "{:02} {:06}", status.depth, status.drops)?;
        }
        Ok(())
    }
}

/// Receives the queue report produced on every tick
pub trait TelemetrySink: Send {
    fn observe(&mut self, report: &QueueReport);
}

/// Writes every report to the `tracing` log at debug level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn observe(&mut self, report: &QueueReport) {
        match report.slowest() {
            Some(slowest) => debug!(
                queues = %report,
                bottleneck = %slowest.stage,
                p95_us = slowest.latency_p95.as_micros() as u64,
                "queue status"
            ),
            None => debug!(queues = %report, "queue status"),
        }
    }
}

/// Adapts a closure into a [`TelemetrySink`]
pub struct FnSink<F>(pub F);

impl<F> TelemetrySink for FnSink<F>
where
    F: FnMut(&QueueReport) + Send,
{
    fn observe(&mut self, report: &QueueReport) {
        (self.0)(report)
    }
}

/// One item pulled off the sink
#[derive(Debug)]
pub struct Tick<T> {
    pub item: T,
    /// Mean interval between ticks, once the rate window is full
    pub interval: Option<Duration>,
    /// Present when a telemetry sink is installed
    pub report: Option<QueueReport>,
}

impl<T> Tick<T> {
    /// Ticks per second, e.g. displayed frames per second
    pub fn rate_hz(&self) -> Option<f64> {
        self.interval
            .map(|mean| mean.as_secs_f64())
            .filter(|secs| *secs > 0.0)
            .map(|secs| 1.0 / secs)
    }
}

/// What a finished [`Orchestrator::run`] observed
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub ticks: u64,
    pub mean_interval: Option<Duration>,
    pub report: QueueReport,
}

/// Drives a chain from its sink end
pub struct Orchestrator<T> {
    chain: Chain<T>,
    meter: RateMeter,
    sink: Option<Box<dyn TelemetrySink>>,
    ticks: u64,
}

impl<T: Send + 'static> Orchestrator<T> {
    /// Wrap a chain, honouring its config's rate window and queue reporting
    pub fn new(chain: Chain<T>) -> Self {
        let config = chain.config();
        let sink: Option<Box<dyn TelemetrySink>> = if config.report_queues {
            Some(Box::new(LogSink))
        } else {
            None
        };
        Self {
            meter: RateMeter::new(config.rate_window.max(1)),
            sink,
            chain,
            ticks: 0,
        }
    }

    /// Replace the telemetry sink
    pub fn with_sink(mut self, sink: impl TelemetrySink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn chain(&self) -> &Chain<T> {
        &self.chain
    }

    pub fn start(&self) -> Result<()> {
        self.chain.start()
    }

    pub fn stop(&self) -> Result<()> {
        self.chain.stop()
    }

    /// Pull the next finished item, measure the rate and report queues.
    ///
    /// Fails once the chain has ended, with `EndOfStream` after a normal
    /// drain or `StageFault` if a stage aborted.
    pub fn tick(&mut self) -> Result<Tick<T>> {
        let item = self.chain.get()?;
        Ok(self.complete(item))
    }

    /// Like [`tick`](Self::tick), giving up after `timeout`
    pub fn tick_timeout(&mut self, timeout: Duration) -> Result<Tick<T>> {
        let item = self.chain.tail().get_timeout(timeout)?;
        Ok(self.complete(item))
    }

    fn complete(&mut self, item: T) -> Tick<T> {
        self.ticks += 1;
        let interval = self.meter.measure();
        let report = self.sink.as_mut().map(|sink| {
            let report = self.chain.queue_report();
            sink.observe(&report);
            report
        });
        Tick {
            item,
            interval,
            report,
        }
    }

    /// Start the chain and hand every item to `handler` until it breaks or
    /// the chain ends, then stop the chain sink first.
    ///
    /// A normal end of stream is not an error; a stage fault is.
    pub fn run<F>(mut self, mut handler: F) -> Result<RunSummary>
    where
        F: FnMut(Tick<T>) -> ControlFlow<()>,
    {
        self.chain.start()?;
        let outcome = loop {
            match self.tick() {
                Ok(tick) => {
                    if handler(tick).is_break() {
                        debug!(ticks = self.ticks, "handler requested exit");
                        break Ok(());
                    }
                }
                Err(PipelineError::EndOfStream) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        let stopped = self.chain.stop();
        outcome?;
        stopped?;

        let summary = RunSummary {
            ticks: self.ticks,
            mean_interval: self.meter.mean(),
            report: self.chain.queue_report(),
        };
        info!(ticks = summary.ticks, drops = summary.report.total_drops(), "run finished");
        Ok(summary)
    }

    /// Items pulled so far
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn into_chain(self) -> Chain<T> {
        self.chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainBuilder;
    use crate::config::ChainConfig;
    use crate::stage::{FnTransform, Flow, IterSource, Map};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn status(stage: &str, depth: usize, drops: u64) -> QueueStatus {
        QueueStatus {
            stage: stage.into(),
            depth,
            drops,
            latency_p95: Duration::ZERO,
        }
    }

    #[test]
    fn test_report_format() {
        let report = QueueReport {
            stages: vec![status("capture", 2, 17), status("infer", 0, 123456)],
        };
        assert_eq!(report.to_string(), "02 000017 - 00 123456");
        assert_eq!(report.pairs(), vec![(2, 17), (0, 123456)]);
        assert_eq!(report.total_drops(), 123473);
    }

    #[test]
    fn test_slowest_stage() {
        let mut report = QueueReport {
            stages: vec![status("capture", 0, 0), status("infer", 1, 0), status("draw", 0, 0)],
        };
        assert!(report.slowest().is_none());
        report.stages[1].latency_p95 = Duration::from_millis(30);
        report.stages[2].latency_p95 = Duration::from_millis(2);
        assert_eq!(report.slowest().map(|s| s.stage.as_str()), Some("infer"));
        // Latency is not part of the status line
        assert_eq!(report.to_string(), "00 000000 - 01 000000 - 00 000000");
    }

    #[test]
    fn test_report_carries_process_latency() {
        let chain = ChainBuilder::new(ChainConfig::default().with_capacity(8))
            .source("capture", IterSource::new(0..3u32))
            .stage("infer", Map::new(|x: u32| {
                std::thread::sleep(Duration::from_millis(5));
                x
            }))
            .build()
            .unwrap();
        chain.start().unwrap();
        while chain.tail().get_timeout(Duration::from_secs(5)).is_ok() {}
        chain.stop().unwrap();

        let report = chain.queue_report();
        assert!(report.stages[1].latency_p95 >= Duration::from_millis(5));
        assert_eq!(report.slowest().map(|s| s.stage.as_str()), Some("infer"));
    }

    #[test]
    fn test_tick_reports_every_stage() {
        let chain = ChainBuilder::new(ChainConfig::default().with_capacity(16))
            .source("capture", IterSource::new(0..3u32))
            .stage("double", Map::new(|x: u32| x * 2))
            .build()
            .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let mut orchestrator = Orchestrator::new(chain)
            .with_sink(FnSink(move |report: &QueueReport| sink_seen.lock().push(report.stages.len())));
        orchestrator.start().unwrap();

        let tick = orchestrator.tick_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(tick.item, 0);
        assert_eq!(tick.report.unwrap().stages.len(), 2);
        assert!(tick.interval.is_none());
        assert_eq!(*seen.lock(), vec![2]);
        orchestrator.stop().unwrap();
    }

    #[test]
    fn test_run_until_end_of_stream() {
        let config = ChainConfig::default().with_capacity(32).with_rate_window(3);
        let chain = ChainBuilder::new(config)
            .source("capture", IterSource::new(0..10u32))
            .stage("inc", Map::new(|x: u32| x + 1))
            .build()
            .unwrap();
        let mut items = Vec::new();
        let summary = Orchestrator::new(chain)
            .run(|tick| {
                items.push(tick.item);
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(items, (1..=10).collect::<Vec<_>>());
        assert_eq!(summary.ticks, 10);
        assert!(summary.mean_interval.is_some());
        assert_eq!(summary.report.total_drops(), 0);
    }

    #[test]
    fn test_run_handler_break_stops_chain() {
        let chain = ChainBuilder::new(ChainConfig::default())
            .source("capture", IterSource::new(0u64..))
            .build()
            .unwrap();
        let summary = Orchestrator::new(chain)
            .run(|tick| {
                if tick.item >= 5 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();
        assert!(summary.ticks >= 1);
    }

    #[test]
    fn test_run_surfaces_fault() {
        let chain = ChainBuilder::new(ChainConfig::default())
            .source("capture", IterSource::new(0..5u32))
            .stage(
                "infer",
                FnTransform::new(|x: u32| if x == 3 { Flow::Fault("nan output".into()) } else { Flow::Continue(x) }),
            )
            .build()
            .unwrap();
        let err = Orchestrator::new(chain).run(|_| ControlFlow::Continue(())).unwrap_err();
        match err {
            PipelineError::StageFault { stage, reason } => {
                assert_eq!(stage, "infer");
                assert_eq!(reason, "nan output");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
