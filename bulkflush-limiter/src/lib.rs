// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]
#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

use std::{
    fmt::{self, Debug},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

/// Module containing fake memory readers for testing
///
/// To enable this module, you must enable the `test-util` feature.
#[cfg(feature = "test-util")]
pub mod fakes;

const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(100);

/// Trait for sampling how much memory is in use
///
/// Implementors of this trait are injected into a [`MemoryLimiter`], which makes it possible to test code that sheds
/// load under memory pressure without actually allocating. The `fakes` module has ready-made readers.
pub trait MemoryReader: Send + Sync + Debug {
    /// Bytes currently in use
    fn used_bytes(&self) -> Result<u64, ReadError>;
}

/// A [`MemoryReader`] failed to produce a sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadError {
    reason: String,
}

impl ReadError {
    /// Create a new ReadError with a human readable reason
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to read memory usage: {}", self.reason)
    }
}

impl std::error::Error for ReadError {}

/// Reads the resident memory of the current process through `sysinfo`
///
/// This requires that the `process-memory` feature be enabled (it is by default).
#[cfg(feature = "process-memory")]
pub struct ProcessMemory {
    system: std::sync::Mutex<sysinfo::System>,
    pid: sysinfo::Pid,
}

#[cfg(feature = "process-memory")]
impl ProcessMemory {
    /// Create a reader for the current process
    pub fn new() -> Self {
        Self {
            system: std::sync::Mutex::new(sysinfo::System::new()),
            pid: sysinfo::Pid::from_u32(std::process::id()),
        }
    }
}

#[cfg(feature = "process-memory")]
impl Default for ProcessMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "process-memory")]
impl Debug for ProcessMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessMemory")
            .field("pid", &self.pid)
            .finish()
    }
}

#[cfg(feature = "process-memory")]
impl MemoryReader for ProcessMemory {
    fn used_bytes(&self) -> Result<u64, ReadError> {
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[self.pid]), true);
        system
            .process(self.pid)
            .map(|process| process.memory())
            .ok_or_else(|| ReadError::new(format!("process {} not found", self.pid)))
    }
}

#[derive(Debug)]
struct Shared {
    reader: Box<dyn MemoryReader>,
    limit_bytes: AtomicU64,
    used_bytes: AtomicU64,
    // whether the last sample failed, so a failing reader logs once per outage
    failing: AtomicBool,
}

impl Shared {
    fn refresh(&self) {
        match self.reader.used_bytes() {
            Ok(used) => {
                self.used_bytes.store(used, Ordering::Relaxed);
                if self.failing.swap(false, Ordering::Relaxed) {
                    tracing::info!(used_bytes = used, "memory reader recovered");
                }
            }
            Err(err) => {
                if !self.failing.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        %err,
                        used_bytes = self.used_bytes.load(Ordering::Relaxed),
                        "memory reader failed, keeping the previous sample"
                    );
                }
            }
        }
    }
}

/// Tells producers whether memory is available, based on a periodically refreshed sample
///
/// The limiter never blocks anything by itself: callers ask [`Self::check_available`] before doing work that
/// allocates, such as appending to a buffer, and decide what to do when memory is short.
///
/// ```
/// # #[tokio::main(flavor = "current_thread", start_paused = true)]
/// # async fn main() {
/// use std::time::Duration;
/// use bulkflush_limiter::{MemoryLimiter, fakes::ManualMemory};
///
/// let memory = ManualMemory::new(512);
/// let limiter = MemoryLimiter::new(1024, memory.clone())
///     .refresh_interval(Duration::from_millis(10));
/// limiter.start();
/// assert!(limiter.check_available());
///
/// memory.set_used_bytes(2048);
/// tokio::time::sleep(Duration::from_millis(15)).await;
/// assert!(!limiter.check_available());
/// limiter.close();
/// # }
/// ```
#[derive(Debug)]
pub struct MemoryLimiter {
    shared: Arc<Shared>,
    refresh_interval: Duration,
    shutdown: CancellationToken,
}

impl MemoryLimiter {
    /// Create a limiter allowing up to `limit_bytes`, sampled through `reader`. A limit of `0` disables the limit.
    ///
    /// The reader is sampled once right away, so [`Self::used_bytes`] is meaningful before [`Self::start`].
    pub fn new(limit_bytes: u64, reader: impl MemoryReader + 'static) -> Self {
        let shared = Arc::new(Shared {
            reader: Box::new(reader),
            limit_bytes: AtomicU64::new(limit_bytes),
            used_bytes: AtomicU64::new(0),
            failing: AtomicBool::new(false),
        });
        shared.refresh();
        Self {
            shared,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            shutdown: CancellationToken::new(),
        }
    }

    /// How often the background task samples the reader. Defaults to 100ms.
    ///
    /// Only takes effect for tasks started afterwards.
    ///
    /// # Panics
    ///
    /// Panics if `refresh_interval` is zero.
    pub fn refresh_interval(mut self, refresh_interval: Duration) -> Self {
        assert!(!refresh_interval.is_zero(), "refresh interval must be positive");
        self.refresh_interval = refresh_interval;
        self
    }

    /// Change the limit. `0` disables it.
    pub fn set_limit_bytes(&self, limit_bytes: u64) {
        self.shared.limit_bytes.store(limit_bytes, Ordering::Relaxed);
    }

    /// Current limit in bytes
    pub fn limit_bytes(&self) -> u64 {
        self.shared.limit_bytes.load(Ordering::Relaxed)
    }

    /// Spawn a task sampling the reader every refresh interval, until [`Self::close`] is called or the limiter is
    /// dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let shared = Arc::clone(&self.shared);
        let shutdown = self.shutdown.clone();
        let period = self.refresh_interval;
        tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticks.tick() => shared.refresh(),
                }
            }
            tracing::debug!("memory limiter stopped");
        });
    }

    /// Sample the reader now
    pub fn refresh(&self) {
        self.shared.refresh();
    }

    /// Stop the background task. The last sample stays readable.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// `true` unless the last sample exceeds the limit
    pub fn check_available(&self) -> bool {
        let limit = self.limit_bytes();
        limit == 0 || self.used_bytes() <= limit
    }

    /// Bytes in use as of the last successful sample
    pub fn used_bytes(&self) -> u64 {
        self.shared.used_bytes.load(Ordering::Relaxed)
    }
}

impl Drop for MemoryLimiter {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use assert2::check;

    use super::*;
    use crate::fakes::{FixedMemory, ManualMemory};

    const GIB: u64 = 1024 * 1024 * 1024;

    #[tokio::test(start_paused = true)]
    async fn limit_against_sampled_usage() {
        let limiter = MemoryLimiter::new(GIB, FixedMemory::new(GIB));
        limiter.start();
        tokio::time::sleep(Duration::from_secs(1)).await;

        check!(limiter.check_available());
        check!(limiter.used_bytes() == GIB);

        limiter.set_limit_bytes(1024 * 1024);
        check!(!limiter.check_available());
        check!(limiter.used_bytes() == GIB);
        limiter.close();
    }

    #[test]
    fn zero_limit_is_unlimited() {
        let limiter = MemoryLimiter::new(0, FixedMemory::new(u64::MAX));
        check!(limiter.check_available());
    }

    #[test]
    #[should_panic(expected = "refresh interval must be positive")]
    fn zero_refresh_interval_panics() {
        let _ = MemoryLimiter::new(0, FixedMemory::new(0)).refresh_interval(Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn background_task_picks_up_changes() {
        let memory = ManualMemory::new(100);
        let limiter =
            MemoryLimiter::new(1000, memory.clone()).refresh_interval(Duration::from_millis(50));
        limiter.start();

        memory.set_used_bytes(2000);
        tokio::time::sleep(Duration::from_millis(40)).await;
        check!(limiter.used_bytes() == 100);
        tokio::time::sleep(Duration::from_millis(20)).await;
        check!(limiter.used_bytes() == 2000);
        check!(!limiter.check_available());

        limiter.close();
        memory.set_used_bytes(10);
        tokio::time::sleep(Duration::from_millis(200)).await;
        check!(limiter.used_bytes() == 2000);
    }

    #[test]
    fn failing_reader_keeps_previous_sample() {
        let memory = ManualMemory::new(300);
        let limiter = MemoryLimiter::new(1000, memory.clone());
        memory.set_failing(true);
        memory.set_used_bytes(5000);
        limiter.refresh();
        check!(limiter.used_bytes() == 300);
        check!(limiter.check_available());

        memory.set_failing(false);
        limiter.refresh();
        check!(limiter.used_bytes() == 5000);
    }

    #[cfg(feature = "process-memory")]
    #[test]
    fn process_memory_reads_something() {
        let used = ProcessMemory::new().used_bytes().unwrap();
        check!(used > 0);
    }
}
