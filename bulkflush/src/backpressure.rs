// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::pin::pin;

use crate::{
    buffer::Shared,
    state::{Filled, Pushed},
};

/// What a producer does when the buffer already holds `max_items`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Backpressure {
    /// Producers never wait. Reaching `max_items` raises a flush trigger; further triggers raised before the
    /// coordinator picks it up collapse into that one, and the buffer may briefly hold more than `max_items` (it is
    /// then flushed in several batches).
    #[default]
    NonBlocking,
    /// Producers that would push the buffer past `max_items` are suspended until a flush makes room. The buffer never
    /// holds more than `max_items`.
    Blocking,
}

impl<T: Send + 'static> Shared<T> {
    pub(crate) async fn offer(&self, items: Vec<T>) {
        if items.is_empty() {
            return;
        }
        match self.backpressure {
            Backpressure::NonBlocking => self.offer_non_blocking(items),
            Backpressure::Blocking => self.offer_blocking(items).await,
        }
    }

    fn offer_non_blocking(&self, items: Vec<T>) {
        match self.aggregation.push(items, &self.metrics) {
            Pushed::Accepted { raise_trigger } => {
                if raise_trigger {
                    self.trigger.notify_one();
                }
            }
            Pushed::Closed { dropped } => self.record_dropped(dropped),
        }
    }

    // Monitor pattern: register for the wake-up, re-check the predicate under the lock, then wait. Every flush wakes
    // all waiters, so this has to loop: another producer may have taken the room first.
    async fn offer_blocking(&self, items: Vec<T>) {
        let mut rest = items;
        let mut waiter = Waiter {
            shared: self,
            registered: false,
        };
        loop {
            let mut space = pin!(self.space.notified());
            space.as_mut().enable();

            match self
                .aggregation
                .fill(&mut rest, &mut waiter.registered, &self.metrics)
            {
                Filled::Done { raise_trigger } => {
                    if raise_trigger {
                        self.trigger.notify_one();
                    }
                    return;
                }
                Filled::Closed { dropped } => {
                    self.record_dropped(dropped);
                    return;
                }
                Filled::Full => {
                    self.trigger.notify_one();
                    space.await;
                }
            }
        }
    }

    fn record_dropped(&self, dropped: usize) {
        self.metrics.record_dropped(dropped);
        if let Some(suppressed) = self.drop_warnings.check() {
            tracing::warn!(
                buffer = &*self.name,
                dropped,
                suppressed,
                "buffer is stopped, dropping items"
            );
        }
    }
}

// Keeps the waiter count honest when a suspended producer's future is dropped.
struct Waiter<'a, T> {
    shared: &'a Shared<T>,
    registered: bool,
}

impl<T> Drop for Waiter<'_, T> {
    fn drop(&mut self) {
        if self.registered {
            self.shared.aggregation.abandon_wait(&self.shared.metrics);
            // a final flush may be waiting for this producer
            self.shared.trigger.notify_one();
        }
    }
}
