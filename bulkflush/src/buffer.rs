// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use tokio::sync::{Notify, mpsc, oneshot};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;

use crate::{
    backpressure::Backpressure,
    builder::BatchBufferBuilder,
    coordinator::{self, FlushFlag, FlushReason, FlushRequest},
    dispatch::Dispatcher,
    metrics::{BufferMetrics, MetricsSnapshot},
    processor::Processor,
    rate_limit::{LOG_INTERVAL, RateLimit},
    recorder::MetricRecorder,
    state::Aggregation,
};

/// Where a [`BatchBuffer`] is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    /// Built, accepting items, but not flushing on its own yet.
    Created = 0,
    /// The coordinator is running.
    Running = 1,
    /// `stop` was called, the final flush is in progress.
    Stopping = 2,
    /// Everything was delivered, new items are dropped.
    Stopped = 3,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

#[derive(Debug)]
struct LifecycleCell(AtomicU8);

impl LifecycleCell {
    fn get(&self) -> Lifecycle {
        Lifecycle::from_u8(self.0.load(Ordering::Acquire))
    }

    fn transition(&self, from: Lifecycle, to: Lifecycle) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Why [`BatchBuffer::start`] failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum StartError {
    /// The buffer was already started, or already stopped.
    AlreadyStarted,
    /// `start` was called outside of a tokio runtime.
    NoRuntime,
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyStarted => f.write_str("buffer was already started"),
            Self::NoRuntime => f.write_str("buffer must be started from within a tokio runtime"),
        }
    }
}

impl std::error::Error for StartError {}

pub(crate) struct Shared<T> {
    pub(crate) name: Arc<str>,
    pub(crate) flush_interval: Duration,
    pub(crate) backpressure: Backpressure,
    pub(crate) aggregation: Aggregation<T>,
    // size trigger: a single stored permit, so repeated crossings collapse into one request
    pub(crate) trigger: Notify,
    // wakes every producer suspended on a full buffer
    pub(crate) space: Notify,
    pub(crate) flushing: FlushFlag,
    pub(crate) metrics: Arc<BufferMetrics>,
    pub(crate) dispatcher: Dispatcher<T>,
    pub(crate) recorder: Option<Box<dyn MetricRecorder>>,
    pub(crate) drop_warnings: RateLimit,
    pub(crate) shutdown: CancellationToken,
    #[cfg(test)]
    pub(crate) swap_counter: coordinator::SwapCounter,
    lifecycle: LifecycleCell,
    tracker: TaskTracker,
    flush_requests: mpsc::UnboundedSender<FlushRequest>,
    flush_receiver: Mutex<Option<mpsc::UnboundedReceiver<FlushRequest>>>,
}

impl<T: Send + 'static> Shared<T> {
    fn lock_receiver(&self) -> MutexGuard<'_, Option<mpsc::UnboundedReceiver<FlushRequest>>> {
        self.flush_receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_coordinator(self: &Arc<Self>, requests: mpsc::UnboundedReceiver<FlushRequest>) {
        let span = tracing::info_span!("bulkflush coordinator", buffer = &*self.name);
        self.tracker
            .spawn(coordinator::run(Arc::clone(self), requests).instrument(span));
    }
}

/// Accumulates items from any number of producers and hands them to a [`Processor`] in batches of at most
/// `max_items`, whenever `max_items` are pending or `flush_interval` elapsed since the last flush.
///
/// Create one with [`BatchBuffer::builder`]. Cloning is cheap and every clone appends to the same buffer.
///
/// The buffer never fails at runtime: a processor that wants its errors seen has to report them itself. Processor
/// invocations are fire-and-forget from the buffer's point of view, except that [`BatchBuffer::stop`] waits for
/// every one of them.
///
/// ```
/// # #[tokio::main(flavor = "current_thread", start_paused = true)]
/// # async fn main() {
/// use std::sync::{Arc, Mutex};
/// use std::time::Duration;
/// use bulkflush::BatchBuffer;
///
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let seen_ = seen.clone();
/// let buffer = BatchBuffer::builder()
///     .max_items(5)
///     .flush_interval(Duration::from_secs(1))
///     .build(move |batch: Vec<char>| {
///         let seen = seen_.clone();
///         async move { seen.lock().unwrap().push(batch) }
///     })
///     .unwrap();
/// buffer.start().unwrap();
///
/// buffer.append(['a', 'b', 'c', 'd']).await;
/// assert_eq!(buffer.queue_length(), 4);
/// buffer.add('e').await;
/// tokio::time::sleep(Duration::from_millis(1)).await;
/// assert_eq!(buffer.queue_length(), 0);
/// assert_eq!(*seen.lock().unwrap(), vec![vec!['a', 'b', 'c', 'd', 'e']]);
///
/// buffer.stop().await;
/// # }
/// ```
pub struct BatchBuffer<T>(Arc<Shared<T>>);

impl<T> Clone for BatchBuffer<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> fmt::Debug for BatchBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchBuffer")
            .field("name", &self.0.name)
            .field("max_items", &self.0.aggregation.max_items())
            .field("flush_interval", &self.0.flush_interval)
            .field("backpressure", &self.0.backpressure)
            .field("lifecycle", &self.0.lifecycle.get())
            .field("metrics", &self.0.metrics.snapshot())
            .finish()
    }
}

impl BatchBuffer<()> {
    /// Creates a [`BatchBufferBuilder`]
    pub fn builder() -> BatchBufferBuilder {
        BatchBufferBuilder::new()
    }
}

impl<T: Send + 'static> BatchBuffer<T> {
    pub(crate) fn from_parts(
        max_items: usize,
        flush_interval: Duration,
        max_concurrent_flushes: usize,
        backpressure: Backpressure,
        name: String,
        recorder: Option<Box<dyn MetricRecorder>>,
        processor: impl Processor<T>,
    ) -> Self {
        let tracker = TaskTracker::new();
        let metrics = Arc::new(BufferMetrics::default());
        let (flush_requests, flush_receiver) = mpsc::unbounded_channel();
        let name: Arc<str> = name.into();
        let dispatcher = Dispatcher::new(
            Arc::clone(&name),
            Box::new(processor),
            max_concurrent_flushes,
            tracker.clone(),
            Arc::clone(&metrics),
        );
        Self(Arc::new(Shared {
            name,
            flush_interval,
            backpressure,
            aggregation: Aggregation::new(max_items),
            trigger: Notify::new(),
            space: Notify::new(),
            flushing: FlushFlag::default(),
            metrics,
            dispatcher,
            recorder,
            drop_warnings: RateLimit::new(LOG_INTERVAL),
            shutdown: CancellationToken::new(),
            #[cfg(test)]
            swap_counter: Default::default(),
            lifecycle: LifecycleCell(AtomicU8::new(Lifecycle::Created as u8)),
            tracker,
            flush_requests,
            flush_receiver: Mutex::new(Some(flush_receiver)),
        }))
    }

    /// Spawns the coordinator on the current tokio runtime. From now on the buffer flushes on its own.
    ///
    /// Can only be called once.
    pub fn start(&self) -> Result<(), StartError> {
        let shared = &self.0;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(StartError::NoRuntime);
        }
        let mut receiver = shared.lock_receiver();
        if !shared
            .lifecycle
            .transition(Lifecycle::Created, Lifecycle::Running)
        {
            return Err(StartError::AlreadyStarted);
        }
        let Some(requests) = receiver.take() else {
            return Err(StartError::AlreadyStarted);
        };
        shared.spawn_coordinator(requests);
        tracing::info!(
            buffer = &*shared.name,
            max_items = shared.aggregation.max_items(),
            flush_interval = ?shared.flush_interval,
            "started batch buffer"
        );
        Ok(())
    }

    /// Performs a final flush of everything pending and waits until every processor invocation has returned.
    ///
    /// Producers suspended on a full buffer when `stop` is called still get their items delivered; items added after
    /// the final flush completed are dropped. A processor that never returns makes `stop` wait forever.
    ///
    /// Calling `stop` again, or concurrently, waits for the same completion. A buffer that was never started is
    /// drained as well.
    pub async fn stop(&self) {
        let shared = &self.0;
        {
            // the receiver lock orders this against `start` and other `stop` calls, so the coordinator is tracked
            // before anyone waits on the tracker
            let mut receiver = shared.lock_receiver();
            if shared
                .lifecycle
                .transition(Lifecycle::Running, Lifecycle::Stopping)
            {
                shared.shutdown.cancel();
            } else if shared
                .lifecycle
                .transition(Lifecycle::Created, Lifecycle::Stopping)
            {
                // never started: run a coordinator that goes straight to the final flush
                shared.shutdown.cancel();
                if let Some(requests) = receiver.take() {
                    shared.spawn_coordinator(requests);
                }
            }
            shared.tracker.close();
        }

        tracing::debug!(buffer = &*shared.name, "awaiting batch buffer shutdown");
        shared.tracker.wait().await;
        if shared
            .lifecycle
            .transition(Lifecycle::Stopping, Lifecycle::Stopped)
        {
            tracing::info!(buffer = &*shared.name, "batch buffer shut down");
        }
    }

    /// Adds one item. See [`Self::append`].
    pub async fn add(&self, item: T) {
        self.0.offer(vec![item]).await
    }

    /// Adds `items`, in order.
    ///
    /// With [`Backpressure::NonBlocking`] this completes without suspending. With [`Backpressure::Blocking`] it
    /// suspends while the buffer is full; if the future is dropped while suspended, the items not yet appended are
    /// discarded. Appending nothing is a no-op.
    pub async fn append(&self, items: impl IntoIterator<Item = T>) {
        self.0.offer(items.into_iter().collect()).await
    }

    /// Flushes whatever is pending now, without waiting for the size or time trigger.
    ///
    /// Resolves once the pending items were swapped out and dispatched, not when the processor finished with them.
    /// If another flush is already swapping, this one is coalesced into it.
    pub async fn flush(&self) {
        let shared = &self.0;
        if shared.lifecycle.get() == Lifecycle::Running {
            let (ack, done) = oneshot::channel();
            if shared.flush_requests.send(ack).is_ok() && done.await.is_ok() {
                return;
            }
            // the coordinator exited meanwhile, its final flush took care of the buffer
        }
        if shared.flush_cycle(FlushReason::Requested).is_none() {
            shared.trigger.notify_one();
        }
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        self.0.lifecycle.get()
    }

    /// Items currently pending, as of the last append or flush.
    pub fn queue_length(&self) -> usize {
        self.0.metrics.queue_length()
    }

    /// Processor invocations currently executing.
    pub fn active_flushes(&self) -> usize {
        self.0.metrics.active_flushes()
    }

    /// All counters at once. Safe to call at any time, including before `start` and after `stop`.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.0.metrics.snapshot()
    }

    /// Name given by [`BatchBufferBuilder::name`].
    pub fn name(&self) -> &str {
        &self.0.name
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared<T>> {
        &self.0
    }
}
