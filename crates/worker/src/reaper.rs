//! Recovery sweep for queue items stuck in `processing`.
//!
//! A worker that dies after claiming an item leaves it `processing`
//! forever. Every sweep looks at claims older than `stale_after` and
//! resolves each one against the run history:
//!
//! - a terminal run opened under the claim: the outcome is durable, so the
//!   item is deleted;
//! - a `running` run opened under the claim: the run is finished as
//!   `error`, then the item is requeued or failed;
//! - no run: the item is requeued or failed.
//!
//! Requeueing is allowed while `attempts < max_attempts`. Ad-hoc runs
//! have no queue item to claim; any still `running` after `stale_after`
//! lost their process and are finished as `error`. The sweep also purges
//! finished queue items past the retention window.

use std::time::Duration;

use robotq_core::types::{self, DbId};
use robotq_db::models::queue_item::QueueItem;
use robotq_db::models::run_record::RunCompletion;
use robotq_db::models::status::{QueueStatus, RunStatus};
use robotq_db::store::SharedStore;
use tokio_util::sync::CancellationToken;

use crate::config::ReaperConfig;
use crate::error::ServiceResult;

/// Message written to runs whose worker vanished.
pub const ABANDONED_MESSAGE: &str = "Run abandoned by worker (claim went stale)";

#[derive(Debug, Clone, Copy)]
pub struct ReaperSettings {
    pub stale_after: Duration,
    pub sweep_interval: Duration,
    pub finished_retention: Duration,
    pub max_attempts: i32,
}

impl ReaperSettings {
    pub fn new(config: &ReaperConfig, max_attempts: i32) -> Self {
        Self {
            stale_after: config.stale_after,
            sweep_interval: config.sweep_interval,
            finished_retention: config.finished_retention,
            max_attempts,
        }
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: usize,
    pub failed: usize,
    /// Items deleted because their run had already finished.
    pub cleared: usize,
    /// Running records of stale claims finished as `error`.
    pub abandoned_runs: usize,
    /// Ad-hoc runs finished as `error`.
    pub orphaned_runs: usize,
    /// Items that changed under us between the scan and the update.
    pub skipped: usize,
    pub purged: u64,
}

enum Resolution {
    Requeued,
    Failed,
    Cleared,
    Skipped,
}

pub struct StaleClaimReaper {
    store: SharedStore,
    settings: ReaperSettings,
}

impl StaleClaimReaper {
    pub fn new(store: SharedStore, settings: ReaperSettings) -> Self {
        Self { store, settings }
    }

    /// Run one sweep. Per-item failures are logged and do not stop the
    /// sweep; only the scans and the purge can fail it.
    pub async fn sweep_once(&self) -> ServiceResult<SweepReport> {
        let now = types::now();
        let cutoff = now - chrono_duration(self.settings.stale_after);
        let mut report = SweepReport::default();

        let stale = self.store.find_stale(cutoff).await?;
        for item in &stale {
            match self.resolve(item, &mut report).await {
                Ok(Resolution::Requeued) => report.requeued += 1,
                Ok(Resolution::Failed) => report.failed += 1,
                Ok(Resolution::Cleared) => report.cleared += 1,
                Ok(Resolution::Skipped) => report.skipped += 1,
                Err(e) => {
                    tracing::error!(item_id = item.id, error = %e, "Failed to recover stale queue item");
                }
            }
        }

        for run in self.store.find_orphaned_runs(cutoff).await? {
            let completion = RunCompletion::new(RunStatus::Error).with_error(ABANDONED_MESSAGE);
            match self.store.finish_run(run.id, &completion).await {
                Ok(true) => {
                    report.orphaned_runs += 1;
                    tracing::warn!(run_id = run.id, case_id = run.case_id, "Finished orphaned ad-hoc run as error");
                }
                Ok(false) => report.skipped += 1,
                Err(e) => tracing::error!(run_id = run.id, error = %e, "Failed to finish orphaned run"),
            }
        }

        report.purged = self
            .store
            .purge_finished(now - chrono_duration(self.settings.finished_retention))
            .await?;

        if report != SweepReport::default() {
            tracing::info!(?report, "Stale claim sweep finished");
        } else {
            tracing::debug!("Stale claim sweep: nothing to do");
        }
        Ok(report)
    }

    /// Sweep every `sweep_interval` until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            stale_after_secs = self.settings.stale_after.as_secs(),
            interval_secs = self.settings.sweep_interval.as_secs(),
            "Stale claim reaper started",
        );
        let mut interval = tokio::time::interval(self.settings.sweep_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Stale claim reaper stopping");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        tracing::error!(error = %e, "Stale claim sweep failed");
                    }
                }
            }
        }
    }

    async fn resolve(&self, item: &QueueItem, report: &mut SweepReport) -> ServiceResult<Resolution> {
        let Some(claimed_at) = item.started_at else {
            return Ok(Resolution::Skipped);
        };

        // Only a run opened under this claim counts; earlier attempts were
        // settled by previous sweeps.
        let current_run = self
            .store
            .latest_for_queue_item(item.id)
            .await?
            .filter(|run| run.started_at.is_some_and(|t| t >= claimed_at));

        if let Some(run) = current_run {
            if run.is_terminal() {
                if !self.store.delete_claimed(item.id, claimed_at).await? {
                    return Ok(Resolution::Skipped);
                }
                tracing::info!(item_id = item.id, run_id = run.id, status = %run.status, "Cleared stale item with finished run");
                return Ok(Resolution::Cleared);
            }
            let completion = RunCompletion::new(RunStatus::Error).with_error(ABANDONED_MESSAGE);
            if self.store.finish_run(run.id, &completion).await? {
                report.abandoned_runs += 1;
                tracing::warn!(item_id = item.id, run_id = run.id, "Finished abandoned run as error");
            }
        }

        self.requeue_or_fail(item.id, item.attempts, claimed_at).await
    }

    async fn requeue_or_fail(
        &self,
        item_id: DbId,
        attempts: i32,
        claimed_at: types::Timestamp,
    ) -> ServiceResult<Resolution> {
        if attempts < self.settings.max_attempts {
            if self.store.requeue(item_id, claimed_at).await? {
                tracing::warn!(item_id, attempts, "Requeued stale queue item");
                return Ok(Resolution::Requeued);
            }
            return Ok(Resolution::Skipped);
        }

        let failed = self
            .store
            .mark_finished(item_id, claimed_at, QueueStatus::Failed)
            .await?;
        if failed {
            tracing::warn!(item_id, attempts, "Stale queue item exhausted its attempts");
            return Ok(Resolution::Failed);
        }
        Ok(Resolution::Skipped)
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(5200))
}
