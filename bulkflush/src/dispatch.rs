// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    any::Any,
    collections::VecDeque,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::task::TaskTracker;

use crate::{
    metrics::{BatchTicket, BufferMetrics},
    processor::Processor,
    rate_limit::{LOG_INTERVAL, RateLimit},
};

/// Runs the processor on swapped-out batches, at most `max_concurrent` at a time.
///
/// Batches go through a single FIFO lane: one task at a time takes them in dispatch order, waits for a permit, calls
/// the processor and spawns the future it returned. So the processor is called in dispatch order on any runtime, and
/// with `max_concurrent == 1` invocations run one after the other in that order.
pub(crate) struct Dispatcher<T>(Arc<Lane<T>>);

struct Lane<T> {
    name: Arc<str>,
    processor: Box<dyn Processor<T>>,
    // `None` means unbounded
    permits: Option<Arc<Semaphore>>,
    tracker: TaskTracker,
    metrics: Arc<BufferMetrics>,
    panic_reports: RateLimit,
    queue: Mutex<Queue<T>>,
}

struct Queue<T> {
    batches: VecDeque<(Vec<T>, BatchTicket)>,
    // a lane task is running and will pick up anything pushed to `batches`
    draining: bool,
}

impl<T: Send + 'static> Dispatcher<T> {
    pub(crate) fn new(
        name: Arc<str>,
        processor: Box<dyn Processor<T>>,
        max_concurrent: usize,
        tracker: TaskTracker,
        metrics: Arc<BufferMetrics>,
    ) -> Self {
        Self(Arc::new(Lane {
            name,
            processor,
            permits: (max_concurrent > 0).then(|| Arc::new(Semaphore::new(max_concurrent))),
            tracker,
            metrics,
            panic_reports: RateLimit::new(LOG_INTERVAL),
            queue: Mutex::new(Queue {
                batches: VecDeque::new(),
                draining: false,
            }),
        }))
    }

    /// Queues `batch` for the processor and returns immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn execute(&self, batch: Vec<T>) {
        let ticket = self.0.metrics.batch_queued(batch.len());
        let mut queue = self.0.lock();
        queue.batches.push_back((batch, ticket));
        if !queue.draining {
            queue.draining = true;
            self.0.tracker.spawn(Arc::clone(&self.0).drain());
        }
    }
}

impl<T: Send + 'static> Lane<T> {
    // nothing panics while holding the lock
    fn lock(&self) -> MutexGuard<'_, Queue<T>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next(&self) -> Option<(Vec<T>, BatchTicket)> {
        let mut queue = self.lock();
        let next = queue.batches.pop_front();
        if next.is_none() {
            queue.draining = false;
        }
        next
    }

    // Tokio's semaphore is fair and only this task acquires, so permits are granted in dispatch order.
    async fn drain(self: Arc<Self>) {
        while let Some((batch, ticket)) = self.next() {
            let permit = match &self.permits {
                Some(permits) => match Arc::clone(permits).acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        // the semaphore is never closed
                        tracing::error!(
                            buffer = &*self.name,
                            "dispatch permits closed, dropping batch"
                        );
                        continue;
                    }
                },
                None => None,
            };
            self.invoke(batch, ticket, permit);
        }
    }

    fn invoke(
        self: &Arc<Self>,
        batch: Vec<T>,
        ticket: BatchTicket,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let active = ticket.start();
        // a processor may panic before returning its future
        let call = AssertUnwindSafe(|| self.processor.process(batch));
        let invocation = match std::panic::catch_unwind(call) {
            Ok(invocation) => invocation,
            Err(panic) => {
                self.report_panic(&*panic);
                return;
            }
        };
        let lane = Arc::clone(self);
        self.tracker.spawn(async move {
            let _permit = permit;
            let _active = active;
            if let Err(panic) = AssertUnwindSafe(invocation).catch_unwind().await {
                lane.report_panic(&*panic);
            }
        });
    }

    fn report_panic(&self, panic: &(dyn Any + Send)) {
        self.metrics.record_panic();
        if let Some(suppressed) = self.panic_reports.check() {
            tracing::error!(
                buffer = &*self.name,
                panic = panic_message(panic),
                suppressed,
                "batch processor panicked, batch was lost"
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "<non-string panic payload>"
    }
}
