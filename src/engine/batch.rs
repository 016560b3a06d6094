//! Batch Executor
//!
//! Splits an ordered work list into consecutive fixed-size chunks and runs an
//! operation on each chunk, strictly in index order. Every chunk goes through
//! the retry engine on its own; the first chunk that fails for good stops the
//! run and later chunks are never attempted.

use crate::engine::retry::{FatalFailure, RetryEngine, RetryPolicy};
use crate::error::ProvisionError;
use std::fmt;
use std::ops::Range;
use thiserror::Error;
use tracing::info;

/// Chunking configuration for one work list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    batch_size: usize,
}

impl BatchConfig {
    /// # Errors
    ///
    /// `InvalidPolicy` if `batch_size` is zero.
    pub fn new(batch_size: usize) -> Result<Self, ProvisionError> {
        if batch_size == 0 {
            return Err(ProvisionError::invalid_policy("batch_size must be at least 1"));
        }
        Ok(Self { batch_size })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

/// A chunk exhausted its retries (or failed fatally).
#[derive(Error, Debug)]
#[error("batch {batch_index} {failure}")]
pub struct BatchFailure<E> {
    /// 0-based index of the failed chunk
    pub batch_index: usize,
    pub failure: FatalFailure<E>,
}

/// Index ranges of every chunk, in execution order.
///
/// Chunk `i` covers `[i * batch_size, min((i + 1) * batch_size, len))`.
pub fn chunk_bounds(len: usize, config: BatchConfig) -> Vec<Range<usize>> {
    let size = config.batch_size;
    (0..len.div_ceil(size))
        .map(|i| i * size..((i + 1) * size).min(len))
        .collect()
}

#[derive(Clone)]
pub struct BatchExecutor {
    retry: RetryEngine,
}

impl BatchExecutor {
    pub fn new(retry: RetryEngine) -> Self {
        Self { retry }
    }

    /// Run `per_batch` over every chunk of `items`.
    pub fn run<T, E, F>(
        &self,
        items: &[T],
        config: BatchConfig,
        per_batch: F,
        policy: &RetryPolicy<E>,
    ) -> Result<(), BatchFailure<E>>
    where
        F: FnMut(&[T]) -> Result<(), E>,
        E: fmt::Display,
    {
        self.run_from(0, items, config, per_batch, policy)
    }

    /// Like [`run`](Self::run), skipping chunks before `start_batch`.
    ///
    /// Chunk indices in the result still refer to the full list.
    pub fn run_from<T, E, F>(
        &self,
        start_batch: usize,
        items: &[T],
        config: BatchConfig,
        mut per_batch: F,
        policy: &RetryPolicy<E>,
    ) -> Result<(), BatchFailure<E>>
    where
        F: FnMut(&[T]) -> Result<(), E>,
        E: fmt::Display,
    {
        let bounds = chunk_bounds(items.len(), config);
        let total = bounds.len();

        for (batch_index, range) in bounds.into_iter().enumerate().skip(start_batch) {
            let chunk = &items[range];
            info!("Running batch {}/{} ({} item(s))", batch_index + 1, total, chunk.len());

            self.retry
                .execute(|| per_batch(chunk), policy)
                .map_err(|failure| BatchFailure {
                    batch_index,
                    failure,
                })?;
        }

        Ok(())
    }
}
