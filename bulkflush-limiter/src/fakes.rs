// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use crate::{MemoryReader, ReadError};

/// Simple static reader that will always report the same usage
#[derive(Debug, Clone, Copy)]
pub struct FixedMemory {
    used_bytes: u64,
}

impl FixedMemory {
    /// Create a new FixedMemory that always reports `used_bytes`
    ///
    /// # Examples
    ///
    /// ```
    /// use bulkflush_limiter::{MemoryLimiter, fakes::FixedMemory};
    ///
    /// let limiter = MemoryLimiter::new(1024, FixedMemory::new(4096));
    /// assert_eq!(limiter.used_bytes(), 4096);
    /// assert!(!limiter.check_available());
    /// ```
    pub fn new(used_bytes: u64) -> Self {
        Self { used_bytes }
    }
}

impl MemoryReader for FixedMemory {
    fn used_bytes(&self) -> Result<u64, ReadError> {
        Ok(self.used_bytes)
    }
}

/// Dummy reader that is loaded with one value,
/// but you can clone it and further modify the reported usage via a shared handle
#[derive(Debug, Clone, Default)]
pub struct ManualMemory {
    used_bytes: Arc<AtomicU64>,
    failing: Arc<AtomicBool>,
}

impl ManualMemory {
    /// Create a new ManualMemory that initially reports `used_bytes`.
    ///
    /// You can subsequently call [`Self::set_used_bytes`] to change the reported usage.
    pub fn new(used_bytes: u64) -> Self {
        Self {
            used_bytes: Arc::new(AtomicU64::new(used_bytes)),
            failing: Arc::default(),
        }
    }

    /// Update the usage reported by this reader and every clone of it.
    ///
    /// # Examples
    ///
    /// ```
    /// use bulkflush_limiter::{MemoryLimiter, fakes::ManualMemory};
    ///
    /// let memory = ManualMemory::new(10);
    /// let limiter = MemoryLimiter::new(100, memory.clone());
    /// memory.set_used_bytes(1000);
    /// assert!(limiter.check_available());
    /// limiter.refresh();
    /// assert!(!limiter.check_available());
    /// ```
    pub fn set_used_bytes(&self, used_bytes: u64) {
        self.used_bytes.store(used_bytes, Ordering::Relaxed);
    }

    /// Make every read fail (`true`) or succeed again (`false`).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

impl MemoryReader for ManualMemory {
    fn used_bytes(&self) -> Result<u64, ReadError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(ReadError::new("injected failure"));
        }
        Ok(self.used_bytes.load(Ordering::Relaxed))
    }
}
