// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use assert2::check;
use bulkflush::{BUFFER_METRICS, BatchBuffer, MetricRecorder};

#[derive(Debug, Clone, PartialEq)]
struct Recorded {
    metric: &'static str,
    buffer: String,
    value: f64,
}

#[derive(Clone, Default)]
struct TestRecorder(Arc<Mutex<Vec<Recorded>>>);

impl TestRecorder {
    fn push(&self, metric: &'static str, buffer: &str, value: f64) {
        self.0.lock().unwrap().push(Recorded {
            metric,
            buffer: buffer.to_owned(),
            value,
        });
    }

    fn values(&self, metric: &str) -> Vec<f64> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|recorded| recorded.metric == metric)
            .map(|recorded| recorded.value)
            .collect()
    }
}

impl MetricRecorder for TestRecorder {
    fn record_histogram(&self, metric: &'static str, buffer: &str, value: u32) {
        self.push(metric, buffer, value.into());
    }

    fn increment_counter(&self, metric: &'static str, buffer: &str, value: u64) {
        self.push(metric, buffer, value as f64);
    }

    fn set_gauge(&self, metric: &'static str, buffer: &str, value: f64) {
        self.push(metric, buffer, value);
    }
}

async fn noop(_batch: Vec<u32>) {}

#[tokio::test(start_paused = true)]
async fn flushes_are_exported_to_recorder() {
    let recorder = TestRecorder::default();
    let buffer = BatchBuffer::builder()
        .max_items(2)
        .name("orders")
        .metric_recorder(Some(Box::new(recorder.clone())))
        .build(noop)
        .unwrap();
    buffer.start().unwrap();

    buffer.append([1, 2, 3, 4, 5]).await;
    buffer.stop().await;

    check!(recorder.values("bulkflush_batch_size") == vec![2.0, 2.0, 1.0]);
    check!(recorder.values("bulkflush_queue_len") == vec![5.0]);
    check!(recorder.values("bulkflush_items_flushed") == vec![5.0]);
    check!(recorder.values("bulkflush_flushes") == vec![1.0]);
    check!(recorder.values("bulkflush_active_flushes").len() == 1);
    check!(
        recorder
            .0
            .lock()
            .unwrap()
            .iter()
            .all(|recorded| recorded.buffer == "orders")
    );
}

#[tokio::test(start_paused = true)]
async fn empty_timer_flushes_are_not_exported() {
    let recorder = TestRecorder::default();
    let buffer = BatchBuffer::builder()
        .flush_interval(Duration::from_millis(100))
        .metric_recorder(Some(Box::new(recorder.clone())))
        .build(noop)
        .unwrap();
    buffer.start().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    buffer.stop().await;
    check!(recorder.0.lock().unwrap().is_empty());
}

#[test]
fn every_exported_metric_is_described() {
    let names: Vec<_> = BUFFER_METRICS.iter().map(|metric| metric.name).collect();
    check!(
        names
            == [
                "bulkflush_batch_size",
                "bulkflush_queue_len",
                "bulkflush_items_flushed",
                "bulkflush_flushes",
                "bulkflush_active_flushes",
            ]
    );
}

#[cfg(feature = "metrics-rs-024")]
#[tokio::test(start_paused = true)]
async fn local_metrics_rs_recorder() {
    use metrics_util_020::debugging::{DebugValue, DebuggingRecorder};

    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    let buffer = BatchBuffer::builder()
        .max_items(3)
        .name("events")
        .metrics_recorder_local::<dyn metrics_024::Recorder, _>(recorder)
        .build(noop)
        .unwrap();
    buffer.start().unwrap();
    buffer.append(0..7).await;
    buffer.stop().await;

    let snapshot = snapshotter.snapshot().into_vec();
    let counter = |name: &str| {
        snapshot.iter().find_map(|(key, _unit, _description, value)| {
            let key = key.key();
            let labelled = key
                .labels()
                .any(|label| label.key() == "buffer" && label.value() == "events");
            match value {
                DebugValue::Counter(count) if key.name() == name && labelled => Some(*count),
                _ => None,
            }
        })
    };
    check!(counter("bulkflush_items_flushed") == Some(7));
    check!(counter("bulkflush_flushes") == Some(1));

    let batch_sizes = snapshot
        .iter()
        .find_map(|(key, _unit, _description, value)| match value {
            DebugValue::Histogram(values) if key.key().name() == "bulkflush_batch_size" => {
                Some(values.len())
            }
            _ => None,
        });
    check!(batch_sizes == Some(3));
}
