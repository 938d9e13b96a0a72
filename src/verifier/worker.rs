//! Bounded worker pool for CPU-bound inference work.
//!
//! Audio decoding, the encoder forward pass, and PLDA algebra all block a
//! thread for tens of milliseconds. They run on the blocking pool behind a
//! semaphore so a burst of requests cannot starve the async runtime or
//! oversubscribe the CPU.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task;

use crate::error::{Error, Result};

/// Semaphore-gated `spawn_blocking` wrapper.
#[derive(Clone)]
pub struct InferencePool {
    permits: Arc<Semaphore>,
}

impl InferencePool {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Run a CPU-bound closure on the blocking pool, waiting for a permit
    /// first. The permit is held for the duration of the closure.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::internal("inference pool is closed"))?;
        task::spawn_blocking(move || {
            let result = f();
            drop(permit);
            result
        })
        .await?
    }
}
