// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]
#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod backpressure;
mod buffer;
mod builder;
mod coordinator;
mod dispatch;
pub mod metrics;
pub mod processor;
pub(crate) mod rate_limit;
pub mod recorder;
mod state;

pub use backpressure::Backpressure;
pub use buffer::{BatchBuffer, Lifecycle, StartError};
pub use builder::{BatchBufferBuilder, BufferConfig, BuildError};
pub use metrics::MetricsSnapshot;
pub use processor::{Processor, blocking};
pub use recorder::{BUFFER_METRICS, MetricRecorder, describe_buffer_metrics};
