// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use tokio::time::Instant;

/// How often a buffer repeats the same warning.
pub(crate) const LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Lets one log line through per interval and counts the calls it held back, so a buffer dropping items or running a
/// panicking processor shows up in the logs without flooding them.
///
/// Every buffer owns its limiters: a noisy buffer never mutes another one. Time comes from tokio, so paused-clock
/// tests drive it.
#[derive(Debug)]
pub(crate) struct RateLimit {
    epoch: Instant,
    interval_ms: u64,
    // milliseconds since `epoch` from which the next line may go out
    next_ms: AtomicU64,
    suppressed: AtomicU64,
}

impl RateLimit {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            epoch: Instant::now(),
            interval_ms: millis(interval),
            next_ms: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    /// `Some(suppressed)` if the caller should log now, with the number of calls held back since the last line.
    pub(crate) fn check(&self) -> Option<u64> {
        let now = millis(Instant::now().saturating_duration_since(self.epoch));
        let next = self.next_ms.load(Ordering::Relaxed);
        if now >= next
            && self
                .next_ms
                .compare_exchange(
                    next,
                    now.saturating_add(self.interval_ms),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
        {
            return Some(self.suppressed.swap(0, Ordering::Relaxed));
        }
        self.suppressed.fetch_add(1, Ordering::Relaxed);
        None
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use assert2::check;
    use tokio::time::sleep;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn one_line_per_interval() {
        let limit = RateLimit::new(LOG_INTERVAL);
        check!(limit.check() == Some(0));
        for _ in 0..5 {
            check!(limit.check().is_none());
        }

        sleep(Duration::from_millis(999)).await;
        check!(limit.check().is_none());
        sleep(Duration::from_millis(1)).await;
        check!(limit.check() == Some(6));
        check!(limit.check().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_periods_reset_the_count() {
        let limit = RateLimit::new(LOG_INTERVAL);
        check!(limit.check() == Some(0));
        sleep(Duration::from_secs(60)).await;
        check!(limit.check() == Some(0));
    }

    #[test]
    fn limiters_are_independent() {
        let first = RateLimit::new(Duration::MAX);
        let second = RateLimit::new(Duration::MAX);
        check!(first.check() == Some(0));
        check!(first.check().is_none());
        check!(second.check() == Some(0));
    }
}
