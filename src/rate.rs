use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Sliding-window estimator of the interval between successive calls.
///
/// Keeps the last `window` intervals and reports their mean once `window`
/// calls have been measured. Earlier calls return `None` so a cold start
/// never reports a misleading rate.
#[derive(Debug, Clone)]
pub struct RateMeter {
    samples: VecDeque<Duration>,
    window: usize,
    last: Instant,
    count: u64,
}

impl RateMeter {
    /// Create a meter averaging over the last `window` intervals
    ///
    /// # Panics
    ///
    /// Panics if `window` is zero.
    pub fn new(window: usize) -> Self {
        Self::starting_at(window, Instant::now())
    }

    /// Create a meter whose first interval is measured from `origin`
    pub fn starting_at(window: usize, origin: Instant) -> Self {
        assert!(window > 0, "rate window must be non-zero");
        Self {
            samples: std::iter::repeat(Duration::ZERO).take(window).collect(),
            window,
            last: origin,
            count: 0,
        }
    }

    /// Record the time since the previous call and return the mean interval
    pub fn measure(&mut self) -> Option<Duration> {
        self.measure_at(Instant::now())
    }

    /// Record an observation taken at `now`
    pub fn measure_at(&mut self, now: Instant) -> Option<Duration> {
        let elapsed = now.saturating_duration_since(self.last);
        self.last = now;
        self.samples.pop_front();
        self.samples.push_back(elapsed);
        self.count += 1;
        self.mean()
    }

    /// Mean interval of the window, once it is full
    pub fn mean(&self) -> Option<Duration> {
        if self.count < self.window as u64 {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.window as u32)
    }

    /// Calls per second derived from the mean interval
    pub fn rate_hz(&self) -> Option<f64> {
        self.mean().and_then(|mean| {
            let secs = mean.as_secs_f64();
            (secs > 0.0).then(|| 1.0 / secs)
        })
    }

    /// Total number of calls measured
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn window(&self) -> usize {
        self.window
    }
}
