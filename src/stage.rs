use crate::buffer::{BoundedRelay, Termination};
use crate::config::{StageConfig, TerminationMode};
use crate::error::{PipelineError, Result};
use crate::metrics::StageMetrics;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Outcome of one `produce` or `process` step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow<T> {
    /// Hand the value downstream
    Continue(T),
    /// Input consumed, nothing to emit
    Skip,
    /// Normal end: consumers drain what is queued
    EndOfStream,
    /// Abort: consumers discard what is queued
    Fault(String),
}

impl<T> Flow<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Flow<U> {
        match self {
            Flow::Continue(value) => Flow::Continue(f(value)),
            Flow::Skip => Flow::Skip,
            Flow::EndOfStream => Flow::EndOfStream,
            Flow::Fault(reason) => Flow::Fault(reason),
        }
    }

    /// Turn a fallible result into a step, errors become faults
    pub fn from_result<E: std::fmt::Display>(result: std::result::Result<T, E>) -> Self {
        match result {
            Ok(value) => Flow::Continue(value),
            Err(e) => Flow::Fault(e.to_string()),
        }
    }
}

impl<T> From<Option<T>> for Flow<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Flow::Continue(value),
            None => Flow::EndOfStream,
        }
    }
}

/// Head-of-chain collaborator, e.g. a capture device
pub trait Source: Send + 'static {
    type Item: Send + 'static;

    /// Produce the next item. May block until one is available.
    fn produce(&mut self) -> Flow<Self::Item>;
}

/// Per-stage work applied to every item pulled from upstream
pub trait Transform<In>: Send + 'static {
    type Output: Send + 'static;

    fn process(&mut self, input: In) -> Flow<Self::Output>;

    /// Called on the stage thread before the first item
    fn on_start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called on the stage thread after the last item
    fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Forwards every item unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl<T: Send + 'static> Transform<T> for Passthrough {
    type Output = T;

    fn process(&mut self, input: T) -> Flow<T> {
        Flow::Continue(input)
    }
}

/// Infallible one-to-one transform
#[derive(Debug, Clone)]
pub struct Map<F> {
    mapper: F,
}

impl<F> Map<F> {
    pub fn new(mapper: F) -> Self {
        Self { mapper }
    }
}

impl<In, Out, F> Transform<In> for Map<F>
where
    F: FnMut(In) -> Out + Send + 'static,
    Out: Send + 'static,
{
    type Output = Out;

    fn process(&mut self, input: In) -> Flow<Out> {
        Flow::Continue((self.mapper)(input))
    }
}

/// Passes through items matching a predicate, skips the rest
#[derive(Debug, Clone)]
pub struct Filter<F> {
    predicate: F,
}

impl<F> Filter<F> {
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<T, F> Transform<T> for Filter<F>
where
    F: FnMut(&T) -> bool + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn process(&mut self, input: T) -> Flow<T> {
        if (self.predicate)(&input) {
            Flow::Continue(input)
        } else {
            Flow::Skip
        }
    }
}

/// Closure transform that decides the flow itself
#[derive(Debug, Clone)]
pub struct FnTransform<F> {
    step: F,
}

impl<F> FnTransform<F> {
    pub fn new(step: F) -> Self {
        Self { step }
    }
}

impl<In, Out, F> Transform<In> for FnTransform<F>
where
    F: FnMut(In) -> Flow<Out> + Send + 'static,
    Out: Send + 'static,
{
    type Output = Out;

    fn process(&mut self, input: In) -> Flow<Out> {
        (self.step)(input)
    }
}

/// Source draining an iterator, ending the stream when it is exhausted
#[derive(Debug)]
pub struct IterSource<I> {
    iter: I,
}

impl<I> IterSource<I> {
    pub fn new(iter: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            iter: iter.into_iter(),
        }
    }
}

impl<I> Source for IterSource<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    type Item = I::Item;

    fn produce(&mut self) -> Flow<I::Item> {
        self.iter.next().into()
    }
}

/// Source backed by a closure
#[derive(Debug)]
pub struct FnSource<F> {
    produce: F,
}

impl<F> FnSource<F> {
    pub fn new(produce: F) -> Self {
        Self { produce }
    }
}

impl<T, F> Source for FnSource<F>
where
    F: FnMut() -> Flow<T> + Send + 'static,
    T: Send + 'static,
{
    type Item = T;

    fn produce(&mut self) -> Flow<T> {
        (self.produce)()
    }
}

/// Lifecycle of a stage. Stages are single-use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

/// Type-erased view of a stage, used for topology and lifecycle control
pub trait StageControl: Send + Sync {
    fn name(&self) -> &str;
    /// Index in the chain, the head is 0
    fn position(&self) -> usize;
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn lifecycle(&self) -> Lifecycle;
    fn is_running(&self) -> bool;
    fn termination(&self) -> Option<Termination>;
    fn depth(&self) -> usize;
    fn capacity(&self) -> usize;
    fn drop_count(&self) -> u64;
    fn metrics(&self) -> &StageMetrics;
    /// The stage this one pulls from, `None` for the head
    fn upstream(&self) -> Option<Arc<dyn StageControl>>;
    /// Wake consumers blocked on this stage's relay
    fn wake_consumers(&self);
}

enum Pulled<T> {
    Item(T),
    Stopped,
    Ended(Termination),
}

trait Input<In>: Send + 'static {
    fn next(&mut self, stage: &str, stop: &AtomicBool) -> Pulled<In>;
}

struct SourceInput<S> {
    source: S,
    mode: TerminationMode,
}

impl<S: Source> Input<S::Item> for SourceInput<S> {
    fn next(&mut self, stage: &str, stop: &AtomicBool) -> Pulled<S::Item> {
        loop {
            if stop.load(Ordering::Acquire) {
                return Pulled::Stopped;
            }
            let source = &mut self.source;
            match guarded(self.mode, || source.produce()) {
                Flow::Continue(item) => return Pulled::Item(item),
                Flow::Skip => continue,
                Flow::EndOfStream => return Pulled::Ended(Termination::EndOfStream),
                Flow::Fault(reason) => return Pulled::Ended(Termination::fault(stage, reason)),
            }
        }
    }
}

struct RelayInput<T> {
    relay: BoundedRelay<T>,
    mode: TerminationMode,
}

impl<T: Send + 'static> Input<T> for RelayInput<T> {
    fn next(&mut self, stage: &str, stop: &AtomicBool) -> Pulled<T> {
        let popped = match self.mode {
            TerminationMode::Propagate => self.relay.pop_until(stop),
            TerminationMode::Starve => self.relay.pop(),
        };
        match popped {
            Ok(item) => Pulled::Item(item),
            Err(PipelineError::Cancelled) => Pulled::Stopped,
            Err(PipelineError::EndOfStream) => Pulled::Ended(Termination::EndOfStream),
            Err(PipelineError::StageFault { stage, reason }) => {
                Pulled::Ended(Termination::Fault { stage, reason })
            }
            Err(e) => Pulled::Ended(Termination::fault(stage, e.to_string())),
        }
    }
}

/// Run a collaborator call, catching a panic as its message when propagating
fn contained<R>(mode: TerminationMode, call: impl FnOnce() -> R) -> std::result::Result<R, String> {
    match mode {
        TerminationMode::Starve => Ok(call()),
        TerminationMode::Propagate => {
            panic::catch_unwind(AssertUnwindSafe(call)).map_err(|payload| panic_message(&*payload))
        }
    }
}

/// Run a collaborator step, turning panics into faults when propagating
fn guarded<T>(mode: TerminationMode, step: impl FnOnce() -> Flow<T>) -> Flow<T> {
    contained(mode, step).unwrap_or_else(|message| Flow::Fault(format!("panicked: {message}")))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// State moved onto the stage thread
struct Worker<T> {
    name: String,
    mode: TerminationMode,
    relay: BoundedRelay<T>,
    stop: Arc<AtomicBool>,
    metrics: StageMetrics,
    exit: Arc<Mutex<Option<Termination>>>,
}

impl<T: Send + 'static> Worker<T> {
    fn run<In, I, X>(self, mut input: I, mut transform: X)
    where
        I: Input<In>,
        X: Transform<In, Output = T>,
    {
        let termination = match contained(self.mode, || transform.on_start()) {
            Ok(Ok(())) => self.pump(&mut input, &mut transform),
            Ok(Err(e)) => Termination::fault(&self.name, e.to_string()),
            Err(message) => Termination::fault(&self.name, format!("on_start panicked: {message}")),
        };
        match contained(self.mode, || transform.on_shutdown()) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(stage = %self.name, error = %e, "shutdown hook failed"),
            Err(message) => warn!(stage = %self.name, panic = %message, "shutdown hook panicked"),
        }

        match &termination {
            Termination::EndOfStream => info!(stage = %self.name, "stage reached end of stream"),
            Termination::Fault { stage, reason } => {
                warn!(stage = %self.name, origin = %stage, reason = %reason, "stage aborted")
            }
        }
        *self.exit.lock() = Some(termination.clone());
        if self.mode == TerminationMode::Propagate {
            self.relay.close(termination);
        }
    }

    fn pump<In, I, X>(&self, input: &mut I, transform: &mut X) -> Termination
    where
        I: Input<In>,
        X: Transform<In, Output = T>,
    {
        loop {
            if self.stop.load(Ordering::Acquire) {
                debug!(stage = %self.name, "stop requested");
                return Termination::EndOfStream;
            }
            let item = match input.next(&self.name, &self.stop) {
                Pulled::Item(item) => item,
                Pulled::Stopped => {
                    debug!(stage = %self.name, "stop requested while waiting for input");
                    return Termination::EndOfStream;
                }
                Pulled::Ended(termination) => return termination,
            };

            let started = Instant::now();
            let flow = guarded(self.mode, || transform.process(item));
            self.metrics.record_latency(started.elapsed());

            match flow {
                Flow::Continue(output) => match self.relay.push(output) {
                    Ok(evicted) => {
                        self.metrics.record_processed();
                        if evicted.is_some() {
                            self.metrics.record_dropped();
                            trace!(stage = %self.name, dropped = self.relay.drop_count(), "evicted oldest output");
                        }
                    }
                    // Closed from outside; nobody will read further output
                    Err(_) => return Termination::EndOfStream,
                },
                Flow::Skip => self.metrics.record_skipped(),
                Flow::EndOfStream => return Termination::EndOfStream,
                Flow::Fault(reason) => return Termination::fault(&self.name, reason),
            }
        }
    }
}

struct Control {
    lifecycle: Lifecycle,
    worker: Option<Box<dyn FnOnce() + Send>>,
    handle: Option<JoinHandle<()>>,
}

/// One pipeline node: a dedicated thread pulling from upstream, applying a
/// transform, and pushing into its own drop-oldest relay.
///
/// Consumers read finished items with [`get`](Stage::get).
pub struct Stage<T> {
    name: String,
    position: usize,
    mode: TerminationMode,
    relay: BoundedRelay<T>,
    stop_requested: Arc<AtomicBool>,
    upstream: Option<Arc<dyn StageControl>>,
    metrics: StageMetrics,
    exit: Arc<Mutex<Option<Termination>>>,
    control: Mutex<Control>,
    /// Held by the `stop` caller that joins the thread
    joining: Mutex<()>,
}

impl<T: Send + 'static> Stage<T> {
    /// Head stage reading from an external source, transforming each item
    pub fn head<S, X>(config: StageConfig, source: S, transform: X) -> Result<Arc<Self>>
    where
        S: Source,
        X: Transform<S::Item, Output = T>,
    {
        let input = SourceInput {
            source,
            mode: config.termination,
        };
        Self::wire::<S::Item, _, _>(config, 0, None, input, transform)
    }

    /// Head stage forwarding source items unchanged
    pub fn source<S>(config: StageConfig, source: S) -> Result<Arc<Self>>
    where
        S: Source<Item = T>,
    {
        Self::head(config, source, Passthrough)
    }

    /// Stage pulling from `upstream`
    pub fn downstream<U, X>(upstream: &Arc<Stage<U>>, config: StageConfig, transform: X) -> Result<Arc<Self>>
    where
        U: Send + 'static,
        X: Transform<U, Output = T>,
    {
        let input = RelayInput {
            relay: upstream.relay.clone(),
            mode: config.termination,
        };
        let link: Arc<dyn StageControl> = upstream.clone();
        Self::wire::<U, _, _>(config, upstream.position + 1, Some(link), input, transform)
    }

    fn wire<In, I, X>(
        config: StageConfig,
        position: usize,
        upstream: Option<Arc<dyn StageControl>>,
        input: I,
        transform: X,
    ) -> Result<Arc<Self>>
    where
        In: 'static,
        I: Input<In>,
        X: Transform<In, Output = T>,
    {
        config.validate()?;
        let relay = BoundedRelay::new(config.capacity);
        let stop_requested = Arc::new(AtomicBool::new(false));
        let metrics = StageMetrics::new();
        let exit = Arc::new(Mutex::new(None));

        let worker = Worker {
            name: config.name.clone(),
            mode: config.termination,
            relay: relay.clone(),
            stop: Arc::clone(&stop_requested),
            metrics: metrics.clone(),
            exit: Arc::clone(&exit),
        };

        Ok(Arc::new(Self {
            name: config.name,
            position,
            mode: config.termination,
            relay,
            stop_requested,
            upstream,
            metrics,
            exit,
            control: Mutex::new(Control {
                lifecycle: Lifecycle::Idle,
                worker: Some(Box::new(move || worker.run(input, transform))),
                handle: None,
            }),
            joining: Mutex::new(()),
        }))
    }

    /// Block until the next output is available
    pub fn get(&self) -> Result<T> {
        self.relay.pop()
    }

    /// Like [`get`](Self::get), giving up after `timeout`
    pub fn get_timeout(&self, timeout: Duration) -> Result<T> {
        self.relay.pop_timeout(timeout)
    }

    /// Take the next output if one is queued
    pub fn try_get(&self) -> Result<Option<T>> {
        self.relay.try_pop()
    }

    /// Spawn the stage thread.
    ///
    /// Starting a running stage is a no-op; a stopped stage cannot be
    /// restarted.
    pub fn start(&self) -> Result<()> {
        let mut control = self.control.lock();
        match control.lifecycle {
            Lifecycle::Running => return Ok(()),
            Lifecycle::Stopped => {
                return Err(PipelineError::AlreadyStopped {
                    stage: self.name.clone(),
                })
            }
            Lifecycle::Idle => {}
        }
        let Some(worker) = control.worker.take() else {
            control.lifecycle = Lifecycle::Stopped;
            return Err(PipelineError::AlreadyStopped {
                stage: self.name.clone(),
            });
        };

        let dispatch = tracing::dispatcher::get_default(|current| current.clone());
        let spawned = thread::Builder::new()
            .name(format!("stage-{}", self.name))
            .spawn(move || tracing::dispatcher::with_default(&dispatch, worker));
        match spawned {
            Ok(handle) => {
                control.handle = Some(handle);
                control.lifecycle = Lifecycle::Running;
                debug!(stage = %self.name, position = self.position, "stage started");
                Ok(())
            }
            Err(e) => {
                control.lifecycle = Lifecycle::Stopped;
                self.finish_unstarted(Termination::fault(&self.name, e.to_string()));
                Err(PipelineError::Spawn(e))
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.control.lock().lifecycle
    }

    /// Whether the thread is started and has not exited yet
    pub fn is_running(&self) -> bool {
        self.lifecycle() == Lifecycle::Running && self.exit.lock().is_none()
    }

    /// How the stage thread ended, once it has
    pub fn termination(&self) -> Option<Termination> {
        self.exit.lock().clone()
    }

    /// Outputs currently queued
    pub fn depth(&self) -> usize {
        self.relay.depth()
    }

    pub fn capacity(&self) -> usize {
        self.relay.capacity()
    }

    /// Outputs evicted before a consumer read them
    pub fn drop_count(&self) -> u64 {
        self.relay.drop_count()
    }

    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    pub fn termination_mode(&self) -> TerminationMode {
        self.mode
    }
}

impl<T> Stage<T> {
    /// Request the stage thread to exit and join it.
    ///
    /// Under [`TerminationMode::Propagate`] a pending read from upstream is
    /// interrupted, so this returns after at most one `process` call (or one
    /// `produce` call for the head). Under [`TerminationMode::Starve`] the
    /// thread only notices the request between items: stopping a stage whose
    /// upstream will never produce again blocks forever, so stop chains from
    /// the sink towards the source.
    ///
    /// Concurrent callers all return only once the thread has been joined.
    pub fn stop(&self) -> Result<()> {
        let (handle, _joining) = {
            let mut control = self.control.lock();
            let lifecycle = control.lifecycle;
            match lifecycle {
                Lifecycle::Stopped => {
                    drop(control);
                    // Wait out a caller that is still joining
                    let _joined = self.joining.lock();
                    return Ok(());
                }
                Lifecycle::Idle => {
                    control.lifecycle = Lifecycle::Stopped;
                    control.worker = None;
                    self.finish_unstarted(Termination::EndOfStream);
                    return Ok(());
                }
                Lifecycle::Running => {
                    control.lifecycle = Lifecycle::Stopped;
                    let joining = self.joining.lock();
                    (control.handle.take(), joining)
                }
            }
        };

        self.stop_requested.store(true, Ordering::Release);
        if self.mode == TerminationMode::Propagate {
            if let Some(upstream) = &self.upstream {
                upstream.wake_consumers();
            }
        }

        if let Some(handle) = handle {
            handle.join().map_err(|payload| {
                PipelineError::ThreadError(format!(
                    "stage '{}' panicked: {}",
                    self.name,
                    panic_message(&*payload)
                ))
            })?;
        }
        debug!(stage = %self.name, "stage stopped");
        Ok(())
    }

    fn finish_unstarted(&self, termination: Termination) {
        *self.exit.lock() = Some(termination.clone());
        if self.mode == TerminationMode::Propagate {
            self.relay.close(termination);
        }
    }
}

impl<T> Drop for Stage<T> {
    fn drop(&mut self) {
        if self.control.get_mut().lifecycle == Lifecycle::Running {
            debug!(stage = %self.name, "stage dropped while running");
        }
        if let Err(e) = self.stop() {
            warn!(stage = %self.name, error = %e, "failed to stop stage on drop");
        }
    }
}

impl<T: Send + 'static> StageControl for Stage<T> {
    fn name(&self) -> &str {
        Stage::name(self)
    }

    fn position(&self) -> usize {
        self.position
    }

    fn start(&self) -> Result<()> {
        Stage::start(self)
    }

    fn stop(&self) -> Result<()> {
        Stage::stop(self)
    }

    fn lifecycle(&self) -> Lifecycle {
        Stage::lifecycle(self)
    }

    fn is_running(&self) -> bool {
        Stage::is_running(self)
    }

    fn termination(&self) -> Option<Termination> {
        Stage::termination(self)
    }

    fn depth(&self) -> usize {
        self.relay.depth()
    }

    fn capacity(&self) -> usize {
        self.relay.capacity()
    }

    fn drop_count(&self) -> u64 {
        self.relay.drop_count()
    }

    fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    fn upstream(&self) -> Option<Arc<dyn StageControl>> {
        self.upstream.clone()
    }

    fn wake_consumers(&self) {
        self.relay.wake_all();
    }
}

impl<T> std::fmt::Debug for Stage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("position", &self.position)
            .field("mode", &self.mode)
            .field("relay", &self.relay)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    const WAIT: Duration = Duration::from_secs(5);

    fn config(name: &str, capacity: usize) -> StageConfig {
        StageConfig::new(name, capacity)
    }

    #[test]
    fn test_flow_conversions() {
        assert_eq!(Flow::from(Some(3)), Flow::Continue(3));
        assert_eq!(Flow::<u8>::from(None), Flow::EndOfStream);
        assert_eq!(Flow::Continue(2).map(|x| x * 10), Flow::Continue(20));
        let failed: std::result::Result<u8, &str> = Err("boom");
        assert_eq!(Flow::from_result(failed), Flow::Fault("boom".into()));
    }

    #[test]
    fn test_builtin_transforms() {
        assert_eq!(Passthrough.process(vec![1, 2]), Flow::Continue(vec![1, 2]));

        let mut double = Map::new(|x: u32| x * 2);
        assert_eq!(double.process(5), Flow::Continue(10));

        let mut even = Filter::new(|x: &u32| x % 2 == 0);
        assert_eq!(even.process(3), Flow::Skip);
        assert_eq!(even.process(4), Flow::Continue(4));

        let mut checked = FnTransform::new(|x: u32| if x > 9 { Flow::Fault("too big".into()) } else { Flow::Continue(x) });
        assert_eq!(checked.process(10), Flow::Fault("too big".into()));
    }

    #[test]
    fn test_iter_source_ends() {
        let mut source = IterSource::new(vec![1, 2]);
        assert_eq!(source.produce(), Flow::Continue(1));
        assert_eq!(source.produce(), Flow::Continue(2));
        assert_eq!(source.produce(), Flow::EndOfStream);
    }

    #[test]
    fn test_single_stage_then_end_of_stream() {
        let stage = Stage::head(config("double", 16), IterSource::new(0..5u32), Map::new(|x: u32| x * 2)).unwrap();
        stage.start().unwrap();
        let outputs: Vec<u32> = (0..5).map(|_| stage.get_timeout(WAIT).unwrap()).collect();
        assert_eq!(outputs, vec![0, 2, 4, 6, 8]);
        assert!(stage.get_timeout(WAIT).unwrap_err().is_end_of_stream());
        assert_eq!(stage.termination(), Some(Termination::EndOfStream));
        assert!(!stage.is_running());
        assert_eq!(stage.metrics().total_processed(), 5);
        stage.stop().unwrap();
    }

    #[test]
    fn test_skip_counts() {
        let stage = Stage::head(config("evens", 16), IterSource::new(0..10u32), Filter::new(|x: &u32| x % 2 == 0)).unwrap();
        stage.start().unwrap();
        let mut outputs = Vec::new();
        while let Ok(x) = stage.get_timeout(WAIT) {
            outputs.push(x);
        }
        assert_eq!(outputs, vec![0, 2, 4, 6, 8]);
        assert_eq!(stage.metrics().total_skipped(), 5);
        stage.stop().unwrap();
    }

    #[test]
    fn test_downstream_wiring() {
        let head = Stage::source(config("capture", 4), IterSource::new(vec![1u8])).unwrap();
        let tail = Stage::downstream(&head, config("widen", 4), Map::new(|x: u8| x as u64)).unwrap();
        assert_eq!(head.position(), 0);
        assert_eq!(tail.position(), 1);
        let link = StageControl::upstream(&*tail).unwrap();
        assert_eq!(link.name(), "capture");
        assert!(StageControl::upstream(&*head).is_none());
    }

    #[test]
    fn test_zero_capacity_is_config_error() {
        let err = Stage::source(config("capture", 0), IterSource::new(vec![1u8])).unwrap_err();
        assert!(matches!(err, PipelineError::ConfigError(_)));
    }

    #[test]
    fn test_lifecycle_is_idempotent() {
        let stage = Stage::source(config("ticks", 2), FnSource::new(|| {
            thread::sleep(Duration::from_millis(1));
            Flow::Continue(())
        }))
        .unwrap();
        assert_eq!(stage.lifecycle(), Lifecycle::Idle);
        stage.start().unwrap();
        stage.start().unwrap();
        assert_eq!(stage.lifecycle(), Lifecycle::Running);
        stage.stop().unwrap();
        stage.stop().unwrap();
        assert_eq!(stage.lifecycle(), Lifecycle::Stopped);
        assert!(matches!(stage.start(), Err(PipelineError::AlreadyStopped { .. })));
    }

    #[test]
    fn test_stop_before_start_closes_relay() {
        let stage = Stage::source(config("idle", 2), IterSource::new(vec![1u8])).unwrap();
        stage.stop().unwrap();
        assert!(stage.get().unwrap_err().is_end_of_stream());
        assert!(matches!(stage.start(), Err(PipelineError::AlreadyStopped { .. })));
    }

    #[test]
    fn test_fault_reaches_consumer() {
        let stage = Stage::head(
            config("decode", 4),
            IterSource::new(0..3u32),
            FnTransform::new(|x: u32| if x == 2 { Flow::Fault("corrupt frame".into()) } else { Flow::Continue(x) }),
        )
        .unwrap();
        stage.start().unwrap();
        // Fault discards whatever was still queued, so only the error is guaranteed
        let err = loop {
            match stage.get_timeout(WAIT) {
                Ok(_) => continue,
                Err(e) => break e,
            }
        };
        match err {
            PipelineError::StageFault { stage, reason } => {
                assert_eq!(stage, "decode");
                assert_eq!(reason, "corrupt frame");
            }
            other => panic!("unexpected: {other:?}"),
        }
        stage.stop().unwrap();
    }

    #[test]
    fn test_panic_becomes_fault() {
        let stage = Stage::head(
            config("boom", 4),
            IterSource::new(vec![1u32]),
            Map::new(|_: u32| -> u32 { panic!("kaboom") }),
        )
        .unwrap();
        stage.start().unwrap();
        match stage.get_timeout(WAIT) {
            Err(PipelineError::StageFault { reason, .. }) => assert!(reason.contains("kaboom")),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(stage.stop().is_ok());
    }

    #[test]
    fn test_starve_mode_panic_kills_thread() {
        let stage = Stage::head(
            config("boom", 4).with_termination(TerminationMode::Starve),
            IterSource::new(vec![1u32]),
            Map::new(|_: u32| -> u32 { panic!("kaboom") }),
        )
        .unwrap();
        stage.start().unwrap();
        // Nothing is ever published and the relay stays open
        assert!(matches!(stage.get_timeout(Duration::from_millis(100)), Err(PipelineError::Timeout(_))));
        assert!(matches!(stage.stop(), Err(PipelineError::ThreadError(_))));
    }

    #[test]
    fn test_starve_mode_end_is_silent() {
        let stage = Stage::source(
            config("short", 4).with_termination(TerminationMode::Starve),
            IterSource::new(vec![7u32]),
        )
        .unwrap();
        stage.start().unwrap();
        assert_eq!(stage.get_timeout(WAIT).unwrap(), 7);
        assert!(matches!(stage.get_timeout(Duration::from_millis(50)), Err(PipelineError::Timeout(_))));
        stage.stop().unwrap();
    }

    #[test]
    fn test_on_start_failure_is_fault() {
        struct Broken;
        impl Transform<u8> for Broken {
            type Output = u8;
            fn process(&mut self, input: u8) -> Flow<u8> {
                Flow::Continue(input)
            }
            fn on_start(&mut self) -> Result<()> {
                Err(PipelineError::ConfigError("model missing".into()))
            }
        }

        let stage = Stage::head(config("infer", 2), IterSource::new(vec![1u8]), Broken).unwrap();
        stage.start().unwrap();
        assert!(matches!(stage.get_timeout(WAIT), Err(PipelineError::StageFault { .. })));
        stage.stop().unwrap();
    }

    /// Fails in `on_start` or `on_shutdown` by panicking
    struct PanickingHook {
        in_start: bool,
    }

    impl Transform<u8> for PanickingHook {
        type Output = u8;
        fn process(&mut self, input: u8) -> Flow<u8> {
            Flow::Continue(input)
        }
        fn on_start(&mut self) -> Result<()> {
            if self.in_start {
                panic!("weights corrupt");
            }
            Ok(())
        }
        fn on_shutdown(&mut self) -> Result<()> {
            if !self.in_start {
                panic!("device lost");
            }
            Ok(())
        }
    }

    #[test]
    fn test_on_start_panic_is_fault() {
        let stage = Stage::head(config("infer", 2), IterSource::new(vec![1u8]), PanickingHook { in_start: true }).unwrap();
        stage.start().unwrap();
        match stage.get_timeout(WAIT) {
            Err(PipelineError::StageFault { stage, reason }) => {
                assert_eq!(stage, "infer");
                assert!(reason.contains("weights corrupt"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(stage.termination().is_some_and(|t| t.is_fault()));
        stage.stop().unwrap();
    }

    #[test]
    fn test_on_shutdown_panic_keeps_end_of_stream() {
        let stage = Stage::head(config("infer", 4), IterSource::new(vec![1u8, 2]), PanickingHook { in_start: false }).unwrap();
        stage.start().unwrap();
        assert_eq!(stage.get_timeout(WAIT).unwrap(), 1);
        assert_eq!(stage.get_timeout(WAIT).unwrap(), 2);
        assert!(stage.get_timeout(WAIT).unwrap_err().is_end_of_stream());
        stage.stop().unwrap();
    }

    #[test]
    fn test_concurrent_stop_waits_for_join() {
        let stage = Stage::head(
            config("slow", 4),
            IterSource::new(0u32..),
            Map::new(|x: u32| {
                thread::sleep(Duration::from_millis(300));
                x
            }),
        )
        .unwrap();
        stage.start().unwrap();
        // Let the worker enter its first `process` call
        thread::sleep(Duration::from_millis(20));

        let first = {
            let stage = Arc::clone(&stage);
            thread::spawn(move || stage.stop())
        };
        thread::sleep(Duration::from_millis(20));
        stage.stop().unwrap();

        // Whichever caller joined, the worker has exited by now
        assert!(stage.termination().is_some());
        let depth = stage.depth();
        thread::sleep(Duration::from_millis(400));
        assert_eq!(stage.depth(), depth);
        first.join().unwrap().unwrap();
    }

    #[test]
    fn test_drop_stops_running_stage() {
        let polls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&polls);
        let stage = Stage::source(
            config("camera", 2),
            FnSource::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
                thread::sleep(Duration::from_millis(1));
                Flow::Continue(0u8)
            }),
        )
        .unwrap();
        stage.start().unwrap();
        assert!(stage.get_timeout(WAIT).is_ok());

        drop(stage);
        let after_drop = polls.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(polls.load(Ordering::Relaxed), after_drop);
    }
}
