//! Long-lived queue workers.
//!
//! Each worker claims the next queue item, runs it through the
//! [`Dispatcher`], and deletes the item once the run record is durable.
//! When the queue is empty it sleeps for the poll interval. Shutdown is
//! observed only between iterations; runs still executing when the grace
//! period ends are cancelled so they finish as `cancelled`.
//!
//! Every write to a claimed item is guarded by the claim's `started_at`,
//! so a worker whose claim was reaped and handed to another worker can no
//! longer touch the item.

use std::sync::Arc;
use std::time::Duration;

use robotq_db::models::status::QueueStatus;
use robotq_db::store::{SharedStore, StoreError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{Dispatcher, ExecuteRequest};
use crate::error::ServiceResult;

/// How long cancelled runs get to write their outcome during shutdown
/// before their workers are aborted.
pub const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Worker count and polling cadence.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub workers: usize,
    pub poll_interval: Duration,
}

/// What one iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iteration {
    /// The queue had nothing to claim.
    Idle,
    /// An item was claimed and its run finished.
    Processed,
    /// The request was rejected before a run was opened; the item is
    /// marked failed.
    Failed,
    /// The run executed but its outcome could not be written. The item
    /// stays `processing` until the reaper settles it.
    Unsettled,
}

/// Owned handle to the running workers.
pub struct WorkerPool {
    cancel: CancellationToken,
    dispatcher: Arc<Dispatcher>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `settings.workers` workers, each with its own store handle.
    pub fn start(store: SharedStore, dispatcher: Arc<Dispatcher>, settings: PoolSettings) -> Self {
        let cancel = CancellationToken::new();
        let handles = (0..settings.workers)
            .map(|worker| {
                let store = Arc::clone(&store);
                let dispatcher = Arc::clone(&dispatcher);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    worker_loop(worker, store, dispatcher, settings.poll_interval, cancel).await;
                })
            })
            .collect();

        tracing::info!(
            workers = settings.workers,
            poll_interval_ms = settings.poll_interval.as_millis() as u64,
            "Worker pool started",
        );
        Self {
            cancel,
            dispatcher,
            handles,
        }
    }

    /// Token observed by every worker; cancelling it starts shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the workers, waiting up to `grace` for in-flight runs.
    ///
    /// Runs still executing after `grace` are cancelled through the
    /// dispatcher (this includes ad-hoc runs sharing it) and get
    /// [`CANCEL_GRACE`] to record their `cancelled` outcome. Workers busy
    /// beyond that are aborted; their child processes are killed and the
    /// claimed items are left for the stale-claim reaper. Returns the
    /// number of aborted workers.
    pub async fn shutdown(self, grace: Duration) -> usize {
        self.cancel.cancel();
        let deadline = tokio::time::Instant::now() + grace;
        let mut busy = Vec::new();
        for mut handle in self.handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(joined) => log_exit(joined),
                Err(_) => busy.push(handle),
            }
        }

        let mut aborted = 0;
        if !busy.is_empty() {
            let runs = self.dispatcher.cancel_all();
            tracing::warn!(workers = busy.len(), runs, "Grace period elapsed; cancelling in-flight runs");

            let deadline = tokio::time::Instant::now() + CANCEL_GRACE;
            for mut handle in busy {
                match tokio::time::timeout_at(deadline, &mut handle).await {
                    Ok(joined) => log_exit(joined),
                    Err(_) => {
                        handle.abort();
                        aborted += 1;
                    }
                }
            }
        }

        if aborted > 0 {
            tracing::warn!(aborted, "Workers did not stop after cancellation; aborted");
        }
        tracing::info!("Worker pool stopped");
        aborted
    }
}

fn log_exit(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "Worker task panicked");
    }
}

async fn worker_loop(
    worker: usize,
    store: SharedStore,
    dispatcher: Arc<Dispatcher>,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    tracing::debug!(worker, "Worker started");

    while !cancel.is_cancelled() {
        let idle = match process_next(&store, &dispatcher).await {
            Ok(Iteration::Idle | Iteration::Unsettled) => true,
            Ok(Iteration::Processed | Iteration::Failed) => false,
            Err(e) => {
                tracing::error!(worker, error = %e, "Worker iteration failed");
                true
            }
        };

        if idle {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    tracing::debug!(worker, "Worker stopped");
}

/// Claim and process at most one queue item.
///
/// The item is deleted only after the run record is terminal, so it never
/// disappears before its outcome is durable. Requests rejected before a
/// run is opened fail the item. Once a run exists the item is never marked
/// failed here: if the outcome cannot be written, or the store fails
/// before the run opens, the item is left `processing` for the reaper.
pub async fn process_next(store: &SharedStore, dispatcher: &Dispatcher) -> ServiceResult<Iteration> {
    let Some(item) = store.dequeue_next().await? else {
        return Ok(Iteration::Idle);
    };
    let Some(claimed_at) = item.started_at else {
        return Err(StoreError::Corrupt {
            table: "queue_items",
            detail: format!("claimed item {} has no started_at", item.id),
        }
        .into());
    };
    tracing::info!(
        item_id = item.id,
        case_id = item.case_id,
        priority = item.priority,
        attempt = item.attempts,
        "Claimed queue item",
    );

    let prepared = match dispatcher.begin(&ExecuteRequest::for_queue_item(&item)).await {
        Ok(prepared) => prepared,
        Err(e) if e.is_client_error() => {
            tracing::warn!(item_id = item.id, case_id = item.case_id, error = %e, "Dispatch rejected");
            if !store.mark_finished(item.id, claimed_at, QueueStatus::Failed).await? {
                tracing::warn!(item_id = item.id, "Queue item was reclaimed before it could be failed");
            }
            return Ok(Iteration::Failed);
        }
        Err(e) => return Err(e),
    };
    let run_id = prepared.record.id;

    let run = match dispatcher.complete(prepared).await {
        Ok(run) => run,
        Err(e) => {
            tracing::error!(item_id = item.id, run_id, error = %e, "Run outcome not recorded; leaving item to the reaper");
            return Ok(Iteration::Unsettled);
        }
    };

    if store.delete_claimed(item.id, claimed_at).await? {
        tracing::info!(item_id = item.id, run_id, status = %run.status, "Queue item done");
    } else {
        tracing::warn!(item_id = item.id, run_id, status = %run.status, "Queue item was reclaimed; leaving it to the new claim");
    }
    Ok(Iteration::Processed)
}
