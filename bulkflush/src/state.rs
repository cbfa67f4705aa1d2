// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::metrics::BufferMetrics;

/// The pending items of a buffer plus the bookkeeping that has to change atomically with them.
pub(crate) struct Aggregation<T> {
    inner: Mutex<Pending<T>>,
    max_items: usize,
}

struct Pending<T> {
    items: Vec<T>,
    // producers suspended on a full buffer, counted while they are parked
    waiting: usize,
    // set once the final flush started: every append must wake the coordinator
    draining: bool,
    // set once the final flush finished: nothing can be delivered anymore
    closed: bool,
}

/// Result of a non-blocking append
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Pushed {
    Accepted { raise_trigger: bool },
    Closed { dropped: usize },
}

/// Result of one blocking fill attempt
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Filled {
    /// Every item was appended.
    Done { raise_trigger: bool },
    /// The buffer is full and items remain, the caller is now registered as a waiter.
    Full,
    Closed { dropped: usize },
}

impl<T> Aggregation<T> {
    pub(crate) fn new(max_items: usize) -> Self {
        Self {
            inner: Mutex::new(Pending {
                items: Vec::with_capacity(max_items),
                waiting: 0,
                draining: false,
                closed: false,
            }),
            max_items,
        }
    }

    pub(crate) fn max_items(&self) -> usize {
        self.max_items
    }

    // nothing panics while holding the lock, but a poisoned lock still holds consistent state
    fn lock(&self) -> MutexGuard<'_, Pending<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends all `items`, overshooting `max_items` if needed.
    pub(crate) fn push(
        &self,
        items: impl IntoIterator<Item = T>,
        metrics: &BufferMetrics,
    ) -> Pushed {
        let mut pending = self.lock();
        if pending.closed {
            return Pushed::Closed {
                dropped: items.into_iter().count(),
            };
        }
        pending.items.extend(items);
        let len = pending.items.len();
        metrics.set_queue_length(len);
        Pushed::Accepted {
            raise_trigger: len >= self.max_items || (pending.draining && len > 0),
        }
    }

    /// Appends as many of `rest` as fit below `max_items`.
    ///
    /// `registered` tracks whether the caller is counted as a waiter. It is cleared here, under the same lock that
    /// appends, so a final flush never sees a producer that is neither waiting nor done.
    pub(crate) fn fill(
        &self,
        rest: &mut Vec<T>,
        registered: &mut bool,
        metrics: &BufferMetrics,
    ) -> Filled {
        let mut pending = self.lock();
        if std::mem::take(registered) {
            pending.waiting -= 1;
            metrics.set_waiting_producers(pending.waiting);
        }
        if pending.closed {
            let dropped = rest.len();
            rest.clear();
            return Filled::Closed { dropped };
        }

        let room = self.max_items.saturating_sub(pending.items.len());
        let take = room.min(rest.len());
        pending.items.extend(rest.drain(..take));
        let len = pending.items.len();
        metrics.set_queue_length(len);

        if rest.is_empty() {
            Filled::Done {
                raise_trigger: len >= self.max_items || (pending.draining && len > 0),
            }
        } else {
            pending.waiting += 1;
            *registered = true;
            metrics.set_waiting_producers(pending.waiting);
            Filled::Full
        }
    }

    /// Deregisters a waiter that gave up (its future was dropped while suspended).
    pub(crate) fn abandon_wait(&self, metrics: &BufferMetrics) {
        let mut pending = self.lock();
        pending.waiting -= 1;
        metrics.set_waiting_producers(pending.waiting);
    }

    /// Swaps the pending items for a fresh, pre-sized sequence. Returns `None` when there is nothing to flush.
    pub(crate) fn take(&self, metrics: &BufferMetrics) -> Option<Vec<T>> {
        let mut pending = self.lock();
        if pending.items.is_empty() {
            return None;
        }
        let batch = std::mem::replace(&mut pending.items, Vec::with_capacity(self.max_items));
        metrics.set_queue_length(0);
        Some(batch)
    }

    /// Whether the buffer holds at least `max_items`, i.e. a size trigger is due.
    pub(crate) fn at_watermark(&self) -> bool {
        self.lock().items.len() >= self.max_items
    }

    pub(crate) fn begin_drain(&self) {
        self.lock().draining = true;
    }

    /// Closes the buffer if nothing is pending and no producer is still waiting to append.
    pub(crate) fn try_close(&self) -> bool {
        let mut pending = self.lock();
        if pending.items.is_empty() && pending.waiting == 0 {
            pending.closed = true;
        }
        pending.closed
    }
}

/// Splits a swapped-out sequence into batches of at most `max_items`, preserving order.
pub(crate) fn into_batches<T>(mut items: Vec<T>, max_items: usize) -> Vec<Vec<T>> {
    let mut batches = Vec::with_capacity(items.len().div_ceil(max_items));
    while items.len() > max_items {
        let rest = items.split_off(max_items);
        batches.push(std::mem::replace(&mut items, rest));
    }
    if !items.is_empty() {
        batches.push(items);
    }
    batches
}
