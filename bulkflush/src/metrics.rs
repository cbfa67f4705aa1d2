// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Lock-free counters describing a buffer's state.

use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

/// Point-in-time view of a buffer's counters, see [`BatchBuffer::metrics`].
///
/// The gauges are read one at a time without any lock, so a snapshot taken while producers and flushes are running
/// is only eventually consistent across fields.
///
/// [`BatchBuffer::metrics`]: crate::BatchBuffer::metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub struct MetricsSnapshot {
    /// Items waiting in the pending buffer, as of the last append or swap.
    pub queue_length: usize,
    /// Processor invocations currently executing.
    pub active_flushes: usize,
    /// Batches that were swapped out but are still waiting for a concurrency permit.
    pub pending_batches: usize,
    /// Producers suspended on a full buffer (blocking backpressure only).
    pub waiting_producers: usize,
    /// Items handed to the dispatch engine whose processor call has not returned yet.
    pub in_flight_items: usize,
    /// Batches dispatched since the buffer was built.
    pub batches_flushed: u64,
    /// Items dispatched since the buffer was built.
    pub items_flushed: u64,
    /// Items offered after the buffer stopped, which were discarded.
    pub dropped_items: u64,
    /// Processor invocations that panicked.
    pub processor_panics: u64,
}

#[derive(Debug, Default)]
pub(crate) struct BufferMetrics {
    queue_length: AtomicUsize,
    active_flushes: AtomicUsize,
    pending_batches: AtomicUsize,
    waiting_producers: AtomicUsize,
    in_flight_items: AtomicUsize,
    batches_flushed: AtomicU64,
    items_flushed: AtomicU64,
    dropped_items: AtomicU64,
    processor_panics: AtomicU64,
}

impl BufferMetrics {
    pub(crate) fn queue_length(&self) -> usize {
        self.queue_length.load(Ordering::Relaxed)
    }

    pub(crate) fn active_flushes(&self) -> usize {
        self.active_flushes.load(Ordering::Relaxed)
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queue_length: self.queue_length(),
            active_flushes: self.active_flushes(),
            pending_batches: self.pending_batches.load(Ordering::Relaxed),
            waiting_producers: self.waiting_producers.load(Ordering::Relaxed),
            in_flight_items: self.in_flight_items.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            items_flushed: self.items_flushed.load(Ordering::Relaxed),
            dropped_items: self.dropped_items.load(Ordering::Relaxed),
            processor_panics: self.processor_panics.load(Ordering::Relaxed),
        }
    }

    // only called with the pending-state lock held, so stores are ordered with the buffer itself
    pub(crate) fn set_queue_length(&self, len: usize) {
        self.queue_length.store(len, Ordering::Relaxed);
    }

    pub(crate) fn set_waiting_producers(&self, waiting: usize) {
        self.waiting_producers.store(waiting, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self, count: usize) {
        self.dropped_items.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_panic(&self) {
        self.processor_panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Accounts for a batch entering the dispatch engine. The returned ticket keeps it counted as pending until
    /// [`BatchTicket::start`] is called or the ticket is dropped.
    pub(crate) fn batch_queued(self: &Arc<Self>, items: usize) -> BatchTicket {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.items_flushed.fetch_add(items as u64, Ordering::Relaxed);
        self.in_flight_items.fetch_add(items, Ordering::Relaxed);
        self.pending_batches.fetch_add(1, Ordering::Relaxed);
        BatchTicket {
            metrics: Arc::clone(self),
            items,
            started: false,
        }
    }
}

/// A dispatched batch that has not started executing yet.
#[must_use]
pub(crate) struct BatchTicket {
    metrics: Arc<BufferMetrics>,
    items: usize,
    started: bool,
}

impl BatchTicket {
    /// Moves the batch from pending to active. The active count drops again when the guard is dropped, which also
    /// covers a processor that panics.
    pub(crate) fn start(mut self) -> ActiveFlush {
        self.started = true;
        self.metrics.pending_batches.fetch_sub(1, Ordering::Relaxed);
        self.metrics.active_flushes.fetch_add(1, Ordering::Relaxed);
        ActiveFlush {
            metrics: Arc::clone(&self.metrics),
            items: self.items,
        }
    }
}

impl Drop for BatchTicket {
    fn drop(&mut self) {
        if !self.started {
            self.metrics.pending_batches.fetch_sub(1, Ordering::Relaxed);
            self.metrics
                .in_flight_items
                .fetch_sub(self.items, Ordering::Relaxed);
        }
    }
}

pub(crate) struct ActiveFlush {
    metrics: Arc<BufferMetrics>,
    items: usize,
}

impl Drop for ActiveFlush {
    fn drop(&mut self) {
        self.metrics.active_flushes.fetch_sub(1, Ordering::Relaxed);
        self.metrics
            .in_flight_items
            .fetch_sub(self.items, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_moves_batch_from_pending_to_active() {
        let metrics = Arc::new(BufferMetrics::default());
        let ticket = metrics.batch_queued(3);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pending_batches, 1);
        assert_eq!(snapshot.active_flushes, 0);
        assert_eq!(snapshot.in_flight_items, 3);

        let active = ticket.start();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pending_batches, 0);
        assert_eq!(snapshot.active_flushes, 1);

        drop(active);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_flushes, 0);
        assert_eq!(snapshot.in_flight_items, 0);
        assert_eq!(snapshot.batches_flushed, 1);
        assert_eq!(snapshot.items_flushed, 3);
    }

    #[test]
    fn dropped_ticket_is_no_longer_pending() {
        let metrics = Arc::new(BufferMetrics::default());
        drop(metrics.batch_queued(5));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pending_batches, 0);
        assert_eq!(snapshot.in_flight_items, 0);
        assert_eq!(snapshot.items_flushed, 5);
    }
}
