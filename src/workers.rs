// Worker Pool - bounded parallelism over independent units
//
// One unit = one table of a module (write), one partition (deletion), or one
// (module, fiscal year) pair (reconciliation). Units are pulled from a shared
// queue by a fixed number of threads. Cancellation is observed between units;
// a unit that already started runs to completion.

use backon::{BlockingRetryable, ExponentialBuilder};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::ArchiveResult;

// ============================================================================
// UNIT STATUS
// ============================================================================

/// Outcome class of one unit; ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Succeeded,
    Skipped,
    Alerted,
    Cancelled,
    Partial,
    Failed,
}

impl UnitStatus {
    pub fn is_failure(self) -> bool {
        matches!(self, UnitStatus::Partial | UnitStatus::Failed)
    }
}

// ============================================================================
// CANCELLATION
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// RETRY
// ============================================================================

pub fn backoff(retry: &RetryConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(retry.min_delay())
        .with_max_delay(retry.max_delay())
        .with_max_times(retry.max_times)
        .with_jitter()
}

/// Retry an operation while it fails transiently; permanent errors return at once
pub fn retry_transient<T>(
    retry: &RetryConfig,
    operation: &str,
    op: impl FnMut() -> ArchiveResult<T>,
) -> ArchiveResult<T> {
    op.retry(backoff(retry))
        .sleep(std::thread::sleep)
        .when(|e| e.is_transient())
        .notify(|e, delay| {
            warn!(operation, error = %e, ?delay, "Transient failure, retrying");
        })
        .call()
}

// ============================================================================
// WORKER POOL
// ============================================================================

pub struct WorkerPool {
    workers: usize,
    cancel: CancelToken,
}

impl WorkerPool {
    pub fn new(workers: usize, cancel: CancelToken) -> Self {
        WorkerPool {
            workers: workers.max(1),
            cancel,
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Run every unit, returning results in unit order; None marks a unit
    /// skipped because the sweep was cancelled before it started
    pub fn run<U, R, F>(&self, units: Vec<U>, work: F) -> Vec<Option<R>>
    where
        U: Send,
        R: Send,
        F: Fn(U) -> R + Sync,
    {
        let total = units.len();
        if total == 0 {
            return Vec::new();
        }

        // Both queues hold every unit, so filling them never blocks
        let (job_tx, job_rx) = crossbeam_channel::bounded(total);
        let (result_tx, result_rx) = crossbeam_channel::bounded(total);
        for job in units.into_iter().enumerate() {
            // Receiver is alive until the scope below ends
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        let threads = self.workers.min(total);
        std::thread::scope(|scope| {
            for worker in 0..threads {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let work = &work;
                let cancel = &self.cancel;
                scope.spawn(move || {
                    while let Ok((index, unit)) = job_rx.recv() {
                        if cancel.is_cancelled() {
                            debug!(worker, index, "Sweep cancelled, leaving unit untouched");
                            let _ = result_tx.send((index, None));
                            continue;
                        }
                        let _ = result_tx.send((index, Some(work(unit))));
                    }
                });
            }
        });
        drop(result_tx);

        let mut results: Vec<Option<R>> = (0..total).map(|_| None).collect();
        for (index, result) in result_rx.iter() {
            results[index] = result;
        }
        results
    }
}
