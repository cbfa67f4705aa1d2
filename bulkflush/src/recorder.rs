// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Exporting buffer metrics to an external recorder.

/// Defines callbacks for recording buffer metrics
pub trait MetricRecorder: Send + Sync {
    /// Records a histogram entry. `metric` names the metric, `buffer` is the buffer name, `value` the observation
    fn record_histogram(&self, metric: &'static str, buffer: &str, value: u32);
    /// Increments a counter. `metric` names the metric, `buffer` is the buffer name, `value` the increment
    fn increment_counter(&self, metric: &'static str, buffer: &str, value: u64);
    /// Sets a gauge. `metric` names the metric, `buffer` is the buffer name, `value` the new gauge value
    fn set_gauge(&self, metric: &'static str, buffer: &str, value: f64);
}

/// Contains metadata for the metrics emitted by a [`BatchBuffer`], for implementing your own describe function.
///
/// [`BatchBuffer`]: crate::BatchBuffer
pub const BUFFER_METRICS: &[DescribedMetric] = &[
    DescribedMetric {
        name: "bulkflush_batch_size",
        unit: MetricsRsUnit::Count,
        r#type: MetricsRsType::Histogram,
        description: "Number of items in each batch handed to the processor",
    },
    DescribedMetric {
        name: "bulkflush_queue_len",
        unit: MetricsRsUnit::Count,
        r#type: MetricsRsType::Histogram,
        description: "Pending items observed when a flush swapped the buffer",
    },
    DescribedMetric {
        name: "bulkflush_items_flushed",
        unit: MetricsRsUnit::Count,
        r#type: MetricsRsType::Counter,
        description: "Number of items handed to the processor",
    },
    DescribedMetric {
        name: "bulkflush_flushes",
        unit: MetricsRsUnit::Count,
        r#type: MetricsRsType::Counter,
        description: "Number of flush cycles that swapped out pending items",
    },
    DescribedMetric {
        name: "bulkflush_active_flushes",
        unit: MetricsRsUnit::Count,
        r#type: MetricsRsType::Gauge,
        description: "Number of processor invocations currently executing",
    },
];

/// Implements MetricRecorder for the global metrics-rs 0.24 recorder
#[cfg(feature = "metrics-rs-024")]
#[derive(Debug, Copy, Clone)]
pub(crate) struct GlobalMetricsRs024Bridge;

#[cfg(feature = "metrics-rs-024")]
impl MetricRecorder for GlobalMetricsRs024Bridge {
    fn record_histogram(&self, metric: &'static str, buffer: &str, value: u32) {
        metrics_024::histogram!(metric, "buffer" => buffer.to_owned()).record(value);
    }

    fn increment_counter(&self, metric: &'static str, buffer: &str, value: u64) {
        metrics_024::counter!(metric, "buffer" => buffer.to_owned()).increment(value);
    }

    fn set_gauge(&self, metric: &'static str, buffer: &str, value: f64) {
        metrics_024::gauge!(metric, "buffer" => buffer.to_owned()).set(value);
    }
}

/// Implements MetricRecorder for a local metrics-rs 0.24 recorder
#[cfg(feature = "metrics-rs-024")]
#[derive(Debug, Copy, Clone)]
pub(crate) struct LocalMetricsRs024Bridge<R>(pub(crate) R);

#[cfg(feature = "metrics-rs-024")]
impl<R> LocalMetricsRs024Bridge<R> {
    fn key(metric: &'static str, buffer: &str) -> metrics_024::Key {
        metrics_024::Key::from_parts(
            metric,
            vec![metrics_024::Label::new("buffer", buffer.to_owned())],
        )
    }

    fn metadata() -> metrics_024::Metadata<'static> {
        metrics_024::Metadata::new(
            module_path!(),
            metrics_024::Level::INFO,
            Some(module_path!()),
        )
    }
}

#[cfg(feature = "metrics-rs-024")]
impl<R: metrics_024::Recorder + Send + Sync> MetricRecorder for LocalMetricsRs024Bridge<R> {
    fn record_histogram(&self, metric: &'static str, buffer: &str, value: u32) {
        self.0
            .register_histogram(&Self::key(metric, buffer), &Self::metadata())
            .record(value);
    }

    fn increment_counter(&self, metric: &'static str, buffer: &str, value: u64) {
        self.0
            .register_counter(&Self::key(metric, buffer), &Self::metadata())
            .increment(value);
    }

    fn set_gauge(&self, metric: &'static str, buffer: &str, value: f64) {
        self.0
            .register_gauge(&Self::key(metric, buffer), &Self::metadata())
            .set(value);
    }
}

pub(crate) trait GlobalRecorderVersion {
    fn recorder() -> impl MetricRecorder + 'static;
    fn describe(metrics: &[DescribedMetric]);
}

#[cfg(feature = "metrics-rs-024")]
impl GlobalRecorderVersion for dyn metrics_024::Recorder {
    fn describe(metrics: &[DescribedMetric]) {
        for metric in metrics {
            let unit = match metric.unit {
                MetricsRsUnit::Count => metrics_024::Unit::Count,
            };
            match metric.r#type {
                MetricsRsType::Counter => {
                    metrics_024::describe_counter!(metric.name, unit, metric.description)
                }
                MetricsRsType::Gauge => {
                    metrics_024::describe_gauge!(metric.name, unit, metric.description)
                }
                MetricsRsType::Histogram => {
                    metrics_024::describe_histogram!(metric.name, unit, metric.description)
                }
            }
        }
    }

    fn recorder() -> impl MetricRecorder {
        GlobalMetricsRs024Bridge
    }
}

pub(crate) trait LocalRecorderVersion<R> {
    fn recorder(recorder: R) -> impl MetricRecorder + 'static;
}

#[cfg(feature = "metrics-rs-024")]
impl<R> LocalRecorderVersion<R> for dyn metrics_024::Recorder
where
    R: metrics_024::Recorder + Send + Sync + 'static,
{
    fn recorder(recorder: R) -> impl MetricRecorder + 'static {
        LocalMetricsRs024Bridge(recorder)
    }
}

/// Registers units and descriptions for the [`BUFFER_METRICS`] with the global recorder.
///
/// Call it with a recorder type, to allow it to autodetect your metrics.rs version. Some recorders are not
/// idempotent in describe, so call this once per recorder.
///
/// ```no_run
/// bulkflush::describe_buffer_metrics::<dyn metrics_024::Recorder>();
/// ```
#[allow(private_bounds)]
pub fn describe_buffer_metrics<V: GlobalRecorderVersion + ?Sized>() {
    V::describe(BUFFER_METRICS);
}

/// Describes a metrics.rs unit in a non-exhaustive fashion
#[non_exhaustive]
#[derive(Copy, Clone, Debug)]
pub enum MetricsRsUnit {
    /// A plain count
    Count,
}

/// Describes a metrics.rs metric type in a non-exhaustive fashion
#[non_exhaustive]
#[derive(Copy, Clone, Debug)]
pub enum MetricsRsType {
    /// A gauge
    Gauge,
    /// A monotonic counter
    Counter,
    /// A histogram
    Histogram,
}

/// Name, unit, type and description of a metric a buffer emits
#[derive(Copy, Clone, Debug)]
#[non_exhaustive]
pub struct DescribedMetric {
    /// Metric name
    pub name: &'static str,
    /// Metric unit
    pub unit: MetricsRsUnit,
    /// Metric type
    pub r#type: MetricsRsType,
    /// Human readable description
    pub description: &'static str,
}
