// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{fmt, time::Duration};

use crate::{
    BatchBuffer,
    backpressure::Backpressure,
    processor::Processor,
    recorder::{GlobalRecorderVersion, LocalRecorderVersion, MetricRecorder},
};

const DEFAULT_MAX_ITEMS: usize = 1000;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Builder for [`BatchBuffer`]
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// use std::time::Duration;
/// use bulkflush::{Backpressure, BatchBuffer};
///
/// let buffer = BatchBuffer::builder()
///     .max_items(500)
///     .flush_interval(Duration::from_millis(200))
///     .max_concurrent_flushes(4)
///     .backpressure(Backpressure::Blocking)
///     .name("clickhouse-events")
///     .build(|batch: Vec<String>| async move {
///         // one bulk insert per batch
///         # let _ = batch;
///     })
///     .unwrap();
/// buffer.start().unwrap();
/// buffer.add("event".to_string()).await;
/// buffer.stop().await;
/// # }
/// ```
pub struct BatchBufferBuilder {
    max_items: usize,
    flush_interval: Duration,
    max_concurrent_flushes: usize,
    backpressure: Backpressure,
    name: String,
    metric_recorder: Option<Box<dyn MetricRecorder>>,
}

impl fmt::Debug for BatchBufferBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchBufferBuilder")
            .field("max_items", &self.max_items)
            .field("flush_interval", &self.flush_interval)
            .field("max_concurrent_flushes", &self.max_concurrent_flushes)
            .field("backpressure", &self.backpressure)
            .field("name", &self.name)
            .field("metric_recorder", &self.metric_recorder.is_some())
            .finish()
    }
}

impl Default for BatchBufferBuilder {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_MAX_ITEMS,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_concurrent_flushes: 0,
            backpressure: Backpressure::default(),
            name: "bulkflush".into(),
            metric_recorder: None,
        }
    }
}

impl BatchBufferBuilder {
    /// A builder with every setting at its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from a deserialized [`BufferConfig`].
    pub fn from_config(config: &BufferConfig) -> Self {
        let builder = Self::new()
            .max_items(config.max_items)
            .flush_interval(Duration::from_millis(config.flush_interval_ms))
            .max_concurrent_flushes(config.max_concurrent_flushes)
            .backpressure(config.backpressure);
        match &config.name {
            Some(name) => builder.name(name.clone()),
            None => builder,
        }
    }

    /// Number of pending items that triggers a flush, and the upper bound on the size of every batch.
    ///
    /// Defaults to 1000. Must be positive.
    pub fn max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items;
        self
    }

    /// Flush pending items at least this often, even if fewer than `max_items` accumulated. The interval restarts
    /// after every flush, whatever triggered it.
    ///
    /// Defaults to one second. Must be positive.
    pub fn flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Maximum number of processor invocations running at once. `0` (the default) means unbounded.
    ///
    /// Batches over the limit wait for a slot in dispatch order, and keep counting towards
    /// [`MetricsSnapshot::pending_batches`](crate::MetricsSnapshot::pending_batches) meanwhile.
    pub fn max_concurrent_flushes(mut self, max_concurrent_flushes: usize) -> Self {
        self.max_concurrent_flushes = max_concurrent_flushes;
        self
    }

    /// What producers do when the buffer is full. Defaults to [`Backpressure::NonBlocking`].
    pub fn backpressure(mut self, backpressure: Backpressure) -> Self {
        self.backpressure = backpressure;
        self
    }

    /// Name used for the tracing span and the `buffer` label of exported metrics. Defaults to `bulkflush`.
    ///
    /// Must not be empty.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Export flush metrics (see [`BUFFER_METRICS`](crate::BUFFER_METRICS)) to `recorder`.
    ///
    /// Most callers want [`Self::metrics_recorder_global`] or [`Self::metrics_recorder_local`] instead.
    pub fn metric_recorder(mut self, recorder: Option<Box<dyn MetricRecorder>>) -> Self {
        self.metric_recorder = recorder;
        self
    }

    /// Send metrics to the global recorder. Pass `dyn metrics::Recorder` as a type parameter
    /// to allow it to autodetect the right metrics.rs version.
    #[allow(private_bounds)]
    pub fn metrics_recorder_global<V: GlobalRecorderVersion + ?Sized>(self) -> Self {
        self.metric_recorder(Some(Box::new(V::recorder())))
    }

    /// Send metrics to a local metrics recorder. Pass `dyn metrics::Recorder` as the first type parameter
    /// to allow it to autodetect the right metrics.rs version.
    #[allow(private_bounds)]
    pub fn metrics_recorder_local<V: LocalRecorderVersion<R> + ?Sized, R>(
        self,
        recorder: R,
    ) -> Self {
        self.metric_recorder(Some(Box::new(V::recorder(recorder))))
    }

    /// Build a [`BatchBuffer`] delivering batches to `processor`.
    ///
    /// The buffer accepts items right away but only flushes on its own after [`BatchBuffer::start`].
    pub fn build<T, P>(self, processor: P) -> Result<BatchBuffer<T>, BuildError>
    where
        T: Send + 'static,
        P: Processor<T>,
    {
        if self.max_items == 0 {
            return Err(BuildError::ZeroMaxItems);
        }
        if self.flush_interval.is_zero() {
            return Err(BuildError::ZeroFlushInterval);
        }
        if self.name.is_empty() {
            return Err(BuildError::EmptyName);
        }
        Ok(BatchBuffer::from_parts(
            self.max_items,
            self.flush_interval,
            self.max_concurrent_flushes,
            self.backpressure,
            self.name,
            self.metric_recorder,
            processor,
        ))
    }
}

/// Buffer settings in a form that can be read from a configuration file.
///
/// ```
/// # #[cfg(feature = "serde")] {
/// use bulkflush::BufferConfig;
///
/// let config: BufferConfig = toml::from_str(r#"
///     max_items = 200
///     flush_interval_ms = 500
///     backpressure = "blocking"
/// "#).unwrap();
/// assert_eq!(config.max_items, 200);
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default, deny_unknown_fields))]
#[non_exhaustive]
pub struct BufferConfig {
    /// See [`BatchBufferBuilder::max_items`]
    pub max_items: usize,
    /// See [`BatchBufferBuilder::flush_interval`], in milliseconds
    pub flush_interval_ms: u64,
    /// See [`BatchBufferBuilder::max_concurrent_flushes`]
    pub max_concurrent_flushes: usize,
    /// See [`BatchBufferBuilder::backpressure`]
    pub backpressure: Backpressure,
    /// See [`BatchBufferBuilder::name`]
    pub name: Option<String>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_MAX_ITEMS,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL.as_millis() as u64,
            max_concurrent_flushes: 0,
            backpressure: Backpressure::default(),
            name: None,
        }
    }
}

/// Why a [`BatchBufferBuilder`] couldn't build a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum BuildError {
    /// `max_items` was zero.
    ZeroMaxItems,
    /// `flush_interval` was zero.
    ZeroFlushInterval,
    /// `name` was empty.
    EmptyName,
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroMaxItems => f.write_str("max_items must be positive"),
            Self::ZeroFlushInterval => f.write_str("flush_interval must be positive"),
            Self::EmptyName => f.write_str("name must not be empty"),
        }
    }
}

impl std::error::Error for BuildError {}

#[cfg(test)]
mod tests {
    use assert2::check;

    use super::*;

    async fn noop(_batch: Vec<u8>) {}

    #[test]
    fn rejects_zero_max_items() {
        let err = BatchBufferBuilder::new().max_items(0).build(noop).unwrap_err();
        check!(err == BuildError::ZeroMaxItems);
        check!(err.to_string() == "max_items must be positive");
    }

    #[test]
    fn rejects_zero_flush_interval() {
        let err = BatchBufferBuilder::new()
            .flush_interval(Duration::ZERO)
            .build(noop)
            .unwrap_err();
        check!(err == BuildError::ZeroFlushInterval);
    }

    #[test]
    fn rejects_empty_name() {
        let err = BatchBufferBuilder::new().name("").build(noop).unwrap_err();
        check!(err == BuildError::EmptyName);
        check!(err.to_string() == "name must not be empty");
    }

    #[test]
    fn zero_concurrency_means_unbounded() {
        check!(
            BatchBufferBuilder::new()
                .max_concurrent_flushes(0)
                .build(noop)
                .is_ok()
        );
    }

    #[cfg(feature = "serde")]
    #[test]
    fn config_from_toml() {
        let config: BufferConfig = toml::from_str(
            r#"
            max_items = 5
            flush_interval_ms = 1000
            max_concurrent_flushes = 2
            backpressure = "non_blocking"
            name = "orders"
            "#,
        )
        .unwrap();
        let builder = BatchBufferBuilder::from_config(&config);
        check!(builder.max_items == 5);
        check!(builder.flush_interval == Duration::from_secs(1));
        check!(builder.max_concurrent_flushes == 2);
        check!(builder.backpressure == Backpressure::NonBlocking);
        check!(builder.name == "orders");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn empty_name_in_config_is_a_build_error() {
        let config: BufferConfig = toml::from_str("name = ''").unwrap();
        let err = BatchBufferBuilder::from_config(&config)
            .build(noop)
            .unwrap_err();
        check!(err == BuildError::EmptyName);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn config_defaults_and_unknown_fields() {
        let config: BufferConfig = toml::from_str("max_items = 7").unwrap();
        check!(config == BufferConfig { max_items: 7, ..BufferConfig::default() });
        check!(toml::from_str::<BufferConfig>("max_itemz = 7").is_err());
    }
}
