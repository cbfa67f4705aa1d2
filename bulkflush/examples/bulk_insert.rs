// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Many request handlers recording rows, one bulk insert per batch.
//!
//! Run with `RUST_LOG=bulkflush=debug cargo run --example bulk_insert` to see every flush.

use std::time::Duration;

use bulkflush::{Backpressure, BatchBuffer};
use bulkflush_limiter::{MemoryLimiter, ProcessMemory};
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
struct Row {
    handler: u32,
    seq: u32,
}

// stands in for a database client taking a whole batch in one round trip
async fn insert_rows(rows: Vec<Row>) {
    let newest = rows.iter().map(|row| (row.seq, row.handler)).max();
    sleep(Duration::from_millis(20)).await;
    info!(rows = rows.len(), ?newest, "inserted rows");
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let limiter = MemoryLimiter::new(1024 * 1024 * 1024, ProcessMemory::new());
    limiter.start();

    let buffer = BatchBuffer::builder()
        .name("rows")
        .max_items(200)
        .flush_interval(Duration::from_millis(100))
        .max_concurrent_flushes(4)
        .backpressure(Backpressure::Blocking)
        .build(insert_rows)
        .unwrap();
    buffer.start().unwrap();

    let handlers: Vec<_> = (0..16)
        .map(|handler| {
            let buffer = buffer.clone();
            let available = limiter.check_available();
            tokio::spawn(async move {
                if !available {
                    warn!(handler, "memory limit reached, shedding handler");
                    return;
                }
                for seq in 0..500 {
                    buffer.add(Row { handler, seq }).await;
                    if seq % 100 == 0 {
                        sleep(Duration::from_millis(5)).await;
                    }
                }
            })
        })
        .collect();
    for handler in handlers {
        handler.await.unwrap();
    }

    buffer.stop().await;
    limiter.close();

    let metrics = buffer.metrics();
    info!(
        batches = metrics.batches_flushed,
        items = metrics.items_flushed,
        used_bytes = limiter.used_bytes(),
        "done"
    );
}
