use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How many recent `process` calls a stage keeps for its latency quantiles
pub const LATENCY_WINDOW: usize = 256;

/// Recent `process` durations of one stage.
///
/// The stage thread records, observers read quantiles; the oldest sample is
/// evicted once the window is full, the same policy the relays use.
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: Arc<Mutex<VecDeque<Duration>>>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn record(&self, elapsed: Duration) {
        let mut samples = self.samples.lock();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(elapsed);
    }

    /// Nearest-rank quantile, `q` clamped to `0.0..=1.0`; zero while empty
    pub fn quantile(&self, q: f64) -> Duration {
        let mut sorted: Vec<Duration> = self.samples.lock().iter().copied().collect();
        if sorted.is_empty() {
            return Duration::ZERO;
        }
        sorted.sort_unstable();
        let rank = (sorted.len() as f64 * q.clamp(0.0, 1.0)).ceil() as usize;
        sorted[rank.saturating_sub(1)]
    }

    /// Most recent sample
    pub fn last(&self) -> Option<Duration> {
        self.samples.lock().back().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }
}

/// Per-stage counters, shared between the stage thread and observers
#[derive(Debug, Clone)]
pub struct StageMetrics {
    /// Outputs pushed to the stage's relay
    processed: Arc<AtomicU64>,
    /// Inputs consumed without producing an output
    skipped: Arc<AtomicU64>,
    /// Outputs evicted from the relay before anyone read them
    dropped: Arc<AtomicU64>,
    /// Time spent inside `process`
    latency: LatencyWindow,
    start_time: Instant,
}

impl StageMetrics {
    pub fn new() -> Self {
        Self {
            processed: Arc::new(AtomicU64::new(0)),
            skipped: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            latency: LatencyWindow::new(LATENCY_WINDOW),
            start_time: Instant::now(),
        }
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, elapsed: Duration) {
        self.latency.record(elapsed);
    }

    pub fn total_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn total_skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn total_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Outputs per second since the metrics were created
    pub fn throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.total_processed() as f64 / elapsed
        }
    }

    pub fn latency(&self) -> &LatencyWindow {
        &self.latency
    }

    /// 95th percentile `process` time over the recent window
    pub fn latency_p95(&self) -> Duration {
        self.latency.quantile(0.95)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_processed: self.total_processed(),
            total_skipped: self.total_skipped(),
            total_dropped: self.total_dropped(),
            throughput: self.throughput(),
            latency_p50: self.latency.quantile(0.50),
            latency_p95: self.latency.quantile(0.95),
            latency_p99: self.latency.quantile(0.99),
            elapsed: self.start_time.elapsed(),
        }
    }
}

impl Default for StageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub total_processed: u64,
    pub total_skipped: u64,
    pub total_dropped: u64,
    pub throughput: f64,
    pub latency_p50: Duration,
    pub latency_p95: Duration,
    pub latency_p99: Duration,
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    /// Format metrics as a human-readable string
    pub fn format(&self) -> String {
        let micros = |d: Duration| d.as_secs_f64() * 1e6;
        format!(
            "Processed: {}, Skipped: {}, Dropped: {}, Throughput: {:.2} items/s, \
             Latency P50: {:.2}µs, P95: {:.2}µs, P99: {:.2}µs, Elapsed: {:.2}s",
            self.total_processed,
            self.total_skipped,
            self.total_dropped,
            self.throughput,
            micros(self.latency_p50),
            micros(self.latency_p95),
            micros(self.latency_p99),
            self.elapsed.as_secs_f64()
        )
    }
}
