use crate::error::{PipelineError, Result};
use crossbeam::queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why a relay stopped accepting items
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Producer finished; consumers drain what is queued
    EndOfStream,
    /// Producer aborted; queued items are discarded
    Fault { stage: String, reason: String },
}

impl Termination {
    /// Build a fault termination for the named stage
    pub fn fault(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Termination::Fault {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    /// Error a consumer observes once the relay is closed and empty
    pub fn to_error(&self) -> PipelineError {
        match self {
            Termination::EndOfStream => PipelineError::EndOfStream,
            Termination::Fault { stage, reason } => PipelineError::StageFault {
                stage: stage.clone(),
                reason: reason.clone(),
            },
        }
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, Termination::Fault { .. })
    }
}

struct Shared<T> {
    queue: ArrayQueue<T>,
    /// `Some` once closed. Guards every state change so waiters never miss a wake-up.
    gate: Mutex<Option<Termination>>,
    ready: Condvar,
    dropped_count: AtomicU64,
}

/// A bounded FIFO hand-off between two pipeline threads.
///
/// `push` never blocks: when the relay is full the oldest item is evicted
/// and counted as a drop. `pop` blocks until an item arrives, the relay is
/// closed, or (for [`pop_until`](Self::pop_until)) a stop is requested.
pub struct BoundedRelay<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BoundedRelay<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for BoundedRelay<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedRelay")
            .field("depth", &self.depth())
            .field("capacity", &self.capacity())
            .field("dropped", &self.drop_count())
            .finish()
    }
}

impl<T> BoundedRelay<T> {
    /// Create a relay holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "relay capacity must be non-zero");
        Self {
            shared: Arc::new(Shared {
                queue: ArrayQueue::new(capacity),
                gate: Mutex::new(None),
                ready: Condvar::new(),
                dropped_count: AtomicU64::new(0),
            }),
        }
    }

    /// Append an item, evicting the oldest one if the relay is full.
    ///
    /// Returns the evicted item, if any. A closed relay refuses the item
    /// and hands it back in `Err`.
    pub fn push(&self, item: T) -> std::result::Result<Option<T>, T> {
        let gate = self.shared.gate.lock();
        if gate.is_some() {
            return Err(item);
        }
        let evicted = self.shared.queue.force_push(item);
        if evicted.is_some() {
            self.shared.dropped_count.fetch_add(1, Ordering::Relaxed);
        }
        drop(gate);
        self.shared.ready.notify_one();
        Ok(evicted)
    }

    /// Block until the oldest item is available and remove it.
    ///
    /// Fails with the closing [`Termination`] once the relay is closed and
    /// has nothing left to hand out.
    pub fn pop(&self) -> Result<T> {
        self.wait(None, None)
    }

    /// Like [`pop`](Self::pop), but gives up with `PipelineError::Cancelled`
    /// once `cancel` is set and [`wake_all`](Self::wake_all) is called.
    pub fn pop_until(&self, cancel: &AtomicBool) -> Result<T> {
        self.wait(None, Some(cancel))
    }

    /// Like [`pop`](Self::pop), but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<T> {
        self.wait(Some((Instant::now() + timeout, timeout)), None)
    }

    /// Remove the oldest item without blocking.
    ///
    /// `Ok(None)` means the relay is open but currently empty.
    pub fn try_pop(&self) -> Result<Option<T>> {
        if let Some(item) = self.shared.queue.pop() {
            return Ok(Some(item));
        }
        let gate = self.shared.gate.lock();
        match self.shared.queue.pop() {
            Some(item) => Ok(Some(item)),
            None => match gate.as_ref() {
                Some(termination) => Err(termination.to_error()),
                None => Ok(None),
            },
        }
    }

    fn wait(
        &self,
        deadline: Option<(Instant, Duration)>,
        cancel: Option<&AtomicBool>,
    ) -> Result<T> {
        let mut gate = self.shared.gate.lock();
        loop {
            if let Some(item) = self.shared.queue.pop() {
                return Ok(item);
            }
            if let Some(termination) = gate.as_ref() {
                return Err(termination.to_error());
            }
            if cancel.is_some_and(|flag| flag.load(Ordering::Acquire)) {
                return Err(PipelineError::Cancelled);
            }
            match deadline {
                Some((at, timeout)) => {
                    if self.shared.ready.wait_until(&mut gate, at).timed_out() {
                        return match self.shared.queue.pop() {
                            Some(item) => Ok(item),
                            None => Err(PipelineError::Timeout(timeout)),
                        };
                    }
                }
                None => self.shared.ready.wait(&mut gate),
            }
        }
    }

    /// Close the relay. Returns `false` if it was already closed.
    ///
    /// End-of-stream keeps queued items for consumers to drain; a fault
    /// discards them.
    pub fn close(&self, termination: Termination) -> bool {
        let mut gate = self.shared.gate.lock();
        if gate.is_some() {
            return false;
        }
        if termination.is_fault() {
            while self.shared.queue.pop().is_some() {}
        }
        *gate = Some(termination);
        drop(gate);
        self.shared.ready.notify_all();
        true
    }

    /// Wake every blocked consumer so it re-checks its cancel flag
    pub fn wake_all(&self) {
        let _gate = self.shared.gate.lock();
        self.shared.ready.notify_all();
    }

    /// How the relay was closed, if it was
    pub fn termination(&self) -> Option<Termination> {
        self.shared.gate.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.gate.lock().is_some()
    }

    /// Current number of queued items
    pub fn depth(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.queue.is_empty()
    }

    /// Maximum number of queued items
    pub fn capacity(&self) -> usize {
        self.shared.queue.capacity()
    }

    /// Get the utilization of the relay as a percentage (0-100)
    pub fn utilization(&self) -> u32 {
        ((self.depth() * 100) / self.capacity()).min(100) as u32
    }

    /// Cumulative number of items evicted by overflow
    pub fn drop_count(&self) -> u64 {
        self.shared.dropped_count.load(Ordering::Relaxed)
    }
}
