// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The function a buffer hands its batches to.

use std::{future::Future, sync::Arc};

use futures::future::BoxFuture;

/// Consumes one batch of items.
///
/// A processor returns nothing: retries, acknowledgements and error reporting are its own business, done inside its
/// body. Any `Fn(Vec<T>) -> impl Future<Output = ()>` closure is a processor. Synchronous functions can be wrapped
/// with [`blocking`].
///
/// ```
/// use bulkflush::Processor;
///
/// fn assert_processor<P: Processor<u64>>(_: P) {}
/// assert_processor(|batch: Vec<u64>| async move {
///     println!("writing {} rows", batch.len());
/// });
/// ```
pub trait Processor<T>: Send + Sync + 'static {
    /// Processes `batch`. Invocations may run concurrently with each other.
    fn process(&self, batch: Vec<T>) -> BoxFuture<'static, ()>;
}

impl<T, F, Fut> Processor<T> for F
where
    F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn process(&self, batch: Vec<T>) -> BoxFuture<'static, ()> {
        Box::pin(self(batch))
    }
}

/// A synchronous processor run on tokio's blocking thread pool, see [`blocking`].
#[derive(Debug)]
pub struct Blocking<F>(Arc<F>);

impl<F> Clone for Blocking<F> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

/// Wraps a synchronous batch function, such as a call into a blocking database client, so each invocation runs on
/// [`tokio::task::spawn_blocking`] instead of stalling the runtime.
///
/// A panic in `f` is propagated to the invocation, where the buffer records it like any other processor panic.
pub fn blocking<T, F>(f: F) -> Blocking<F>
where
    F: Fn(Vec<T>) + Send + Sync + 'static,
{
    Blocking(Arc::new(f))
}

impl<T, F> Processor<T> for Blocking<F>
where
    T: Send + 'static,
    F: Fn(Vec<T>) + Send + Sync + 'static,
{
    fn process(&self, batch: Vec<T>) -> BoxFuture<'static, ()> {
        let f = Arc::clone(&self.0);
        Box::pin(async move {
            if let Err(err) = tokio::task::spawn_blocking(move || f(batch)).await {
                if err.is_panic() {
                    std::panic::resume_unwind(err.into_panic());
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[tokio::test]
    async fn closure_receives_batch() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_ = Arc::clone(&seen);
        let processor = move |batch: Vec<u32>| {
            let seen = Arc::clone(&seen_);
            async move { seen.lock().unwrap().extend(batch) }
        };
        processor.process(vec![1, 2, 3]).await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blocking_runs_off_the_runtime() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_ = Arc::clone(&seen);
        let processor = blocking(move |batch: Vec<u32>| {
            std::thread::sleep(std::time::Duration::from_millis(5));
            seen_.lock().unwrap().extend(batch);
        });
        processor.process(vec![4, 5]).await;
        assert_eq!(*seen.lock().unwrap(), vec![4, 5]);
    }

    #[tokio::test]
    #[should_panic(expected = "processor failed")]
    async fn blocking_propagates_panics() {
        let processor = blocking(|_batch: Vec<u32>| panic!("processor failed"));
        processor.process(vec![1]).await;
    }
}
