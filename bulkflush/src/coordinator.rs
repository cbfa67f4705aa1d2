// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    pin::pin,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use tokio::{
    sync::{mpsc, oneshot},
    time::{Instant, sleep_until},
};

use crate::{buffer::Shared, state::into_batches};

/// What asked for a flush. Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushReason {
    Size,
    Timer,
    Requested,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FlushState {
    Idle = 0,
    Flushing = 1,
}

/// Two-state machine guarding the swap section: at most one flush swaps a buffer at any time.
#[derive(Debug)]
pub(crate) struct FlushFlag(AtomicU8);

impl Default for FlushFlag {
    fn default() -> Self {
        Self(AtomicU8::new(FlushState::Idle as u8))
    }
}

impl FlushFlag {
    /// `Idle -> Flushing`. The guard moves the flag back to `Idle` when dropped.
    pub(crate) fn try_begin(&self) -> Option<FlushGuard<'_>> {
        self.0
            .compare_exchange(
                FlushState::Idle as u8,
                FlushState::Flushing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()
            .map(|_| FlushGuard(self))
    }

    pub(crate) fn is_flushing(&self) -> bool {
        self.0.load(Ordering::Acquire) == FlushState::Flushing as u8
    }
}

pub(crate) struct FlushGuard<'a>(&'a FlushFlag);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.0.store(FlushState::Idle as u8, Ordering::Release);
    }
}

pub(crate) type FlushRequest = oneshot::Sender<()>;

/// Counts swap sections running at once.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct SwapCounter {
    current: std::sync::atomic::AtomicUsize,
    pub(crate) peak: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl SwapCounter {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        // widen the window for a racing flush
        std::thread::yield_now();
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<T: Send + 'static> Shared<T> {
    /// Swaps out the pending items and dispatches them in batches of at most `max_items`.
    ///
    /// Keeps swapping while the buffer is back at the watermark, so items that arrived during the swap don't have to
    /// wait for another trigger. Returns `None` without touching the buffer if another flush holds the flag,
    /// otherwise the number of items dispatched.
    pub(crate) fn flush_cycle(&self, reason: FlushReason) -> Option<usize> {
        let Some(_flushing) = self.flushing.try_begin() else {
            tracing::trace!(?reason, "flush already in progress");
            return None;
        };
        #[cfg(test)]
        self.swap_counter.enter();

        let max_items = self.aggregation.max_items();
        let mut flushed = 0;
        while let Some(items) = self.aggregation.take(&self.metrics) {
            // the buffer has room again, let suspended producers race for it
            self.space.notify_waiters();
            let observed = items.len();
            flushed += observed;
            for batch in into_batches(items, max_items) {
                self.record_batch(batch.len());
                self.dispatcher.execute(batch);
            }
            self.record_swap(observed);

            if !self.aggregation.at_watermark() {
                break;
            }
        }

        #[cfg(test)]
        self.swap_counter.exit();
        if flushed > 0 {
            tracing::debug!(?reason, items = flushed, "flushed buffer");
        }
        Some(flushed)
    }

    fn record_batch(&self, len: usize) {
        if let Some(recorder) = &self.recorder {
            recorder.record_histogram(
                "bulkflush_batch_size",
                &self.name,
                len.try_into().unwrap_or(u32::MAX),
            );
        }
    }

    fn record_swap(&self, observed: usize) {
        if let Some(recorder) = &self.recorder {
            recorder.record_histogram(
                "bulkflush_queue_len",
                &self.name,
                observed.try_into().unwrap_or(u32::MAX),
            );
            recorder.increment_counter("bulkflush_items_flushed", &self.name, observed as u64);
            recorder.increment_counter("bulkflush_flushes", &self.name, 1);
            recorder.set_gauge(
                "bulkflush_active_flushes",
                &self.name,
                self.metrics.active_flushes() as f64,
            );
        }
    }

    /// Final flush: delivers everything pending, including items of producers that were suspended when the stop
    /// began, then closes the buffer.
    pub(crate) async fn drain_for_shutdown(&self) {
        self.aggregation.begin_drain();
        loop {
            // registered before the check, so an append racing with it still wakes us
            let mut appended = pin!(self.trigger.notified());
            appended.as_mut().enable();

            if self.flush_cycle(FlushReason::Shutdown).is_none() {
                // an inline flush() holds the flag, it won't hold it for long
                tokio::task::yield_now().await;
                continue;
            }
            if self.aggregation.try_close() {
                break;
            }
            appended.await;
        }
        tracing::debug!("buffer drained and closed");
    }
}

/// The coordinator loop of a running buffer.
///
/// Waits for one of: the stop signal, an explicit flush request, a size trigger or the flush deadline. The deadline
/// is measured from the last flush, whatever triggered it.
pub(crate) async fn run<T: Send + 'static>(
    shared: Arc<Shared<T>>,
    mut requests: mpsc::UnboundedReceiver<FlushRequest>,
) {
    let interval = shared.flush_interval;
    let mut deadline = Instant::now() + interval;

    loop {
        tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            Some(request) = requests.recv() => {
                let mut acks = vec![request];
                while let Ok(request) = requests.try_recv() {
                    acks.push(request);
                }
                if shared.flush_cycle(FlushReason::Requested).is_some() {
                    deadline = Instant::now() + interval;
                } else {
                    shared.trigger.notify_one();
                }
                for ack in acks {
                    let _ = ack.send(());
                }
            }
            _ = shared.trigger.notified() => {
                // a trigger raised while a flush was running may already have been served by its re-check
                if !shared.aggregation.at_watermark() {
                    tracing::trace!("stale size trigger");
                    continue;
                }
                if shared.flush_cycle(FlushReason::Size).is_some() {
                    deadline = Instant::now() + interval;
                } else {
                    // an inline flush() holds the flag and may have re-checked before these items landed
                    tokio::task::yield_now().await;
                    shared.trigger.notify_one();
                }
            }
            _ = sleep_until(deadline) => {
                // whether or not this flush got the flag, the timer restarts
                shared.flush_cycle(FlushReason::Timer);
                deadline = Instant::now() + interval;
            }
        }
    }

    tracing::info!("caught stop signal, draining buffer");
    shared.drain_for_shutdown().await;
    // pending requests are acknowledged by dropping them, the buffer is empty by now
    requests.close();
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::BatchBuffer;

    #[test]
    fn flag_admits_one_flush_at_a_time() {
        let flag = FlushFlag::default();
        let guard = flag.try_begin();
        assert!(guard.is_some());
        assert!(flag.is_flushing());
        assert!(flag.try_begin().is_none());
        drop(guard);
        assert!(!flag.is_flushing());
        assert!(flag.try_begin().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn swaps_never_overlap() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_ = Arc::clone(&seen);
        let buffer = BatchBuffer::builder()
            .max_items(8)
            .build(move |batch: Vec<u32>| {
                let seen = Arc::clone(&seen_);
                async move { seen.lock().unwrap().extend(batch) }
            })
            .unwrap();

        // not started: every flush() races for the flag inline
        let tasks: Vec<_> = (0..8)
            .map(|p| {
                let buffer = buffer.clone();
                tokio::spawn(async move {
                    for i in 0..200 {
                        buffer.add(p * 1000 + i).await;
                        buffer.flush().await;
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        buffer.stop().await;

        assert_eq!(buffer.shared().swap_counter.peak.load(Ordering::SeqCst), 1);
        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        let mut expected: Vec<u32> = (0..8)
            .flat_map(|p| (0..200).map(move |i| p * 1000 + i))
            .collect();
        expected.sort_unstable();
        assert_eq!(seen, expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn running_triggers_and_requests_never_overlap() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_ = Arc::clone(&seen);
        let buffer = BatchBuffer::builder()
            .max_items(8)
            .flush_interval(std::time::Duration::from_millis(1))
            .build(move |batch: Vec<u32>| {
                let seen = Arc::clone(&seen_);
                async move { seen.lock().unwrap().extend(batch) }
            })
            .unwrap();
        buffer.start().unwrap();

        // size and timer flushes on the coordinator, explicit requests from a separate task
        let flusher = tokio::spawn({
            let buffer = buffer.clone();
            async move {
                for _ in 0..500 {
                    buffer.flush().await;
                    tokio::task::yield_now().await;
                }
            }
        });
        let producers: Vec<_> = (0..8)
            .map(|p| {
                let buffer = buffer.clone();
                tokio::spawn(async move {
                    for i in 0..500 {
                        buffer.add(p * 1000 + i).await;
                        if i % 50 == 0 {
                            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                        }
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.await.unwrap();
        }
        flusher.await.unwrap();
        buffer.stop().await;

        assert_eq!(buffer.shared().swap_counter.peak.load(Ordering::SeqCst), 1);
        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        let mut expected: Vec<u32> = (0..8)
            .flat_map(|p| (0..500).map(move |i| p * 1000 + i))
            .collect();
        expected.sort_unstable();
        assert_eq!(seen, expected);
    }
}
