//! Caller-facing execution operations.
//!
//! Bulk operations take a list of case ids and report per-case outcomes
//! in a [`BulkOutcome`]: one bad case never aborts the others. Request-wide
//! problems (empty list, invalid config, unknown run kind) are rejected up
//! front with a validation error before anything is written.

use std::sync::Arc;
use std::time::Duration;

use robotq_core::runner::options::RobotOptions;
use robotq_core::runner::{LOG_HTML, OUTPUT_XML, REPORT_HTML};
use robotq_core::types::DbId;
use robotq_db::models::queue_item::{NewQueueItem, QueueFilter, QueueItem};
use robotq_db::models::run_record::{RunFilter, RunRecord};
use robotq_db::models::status::RunKind;
use robotq_db::models::Page;
use robotq_db::store::SharedStore;
use robotq_storage::ArtifactStore;
use serde::Serialize;
use tokio_util::task::TaskTracker;

use crate::dispatcher::{Dispatcher, ExecuteRequest, CONSOLE_LOG};
use crate::error::{ServiceError, ServiceResult};

/// Artifacts offered by [`ExecutionService::get_log_url`], most useful first.
pub const LOG_PREFERENCE: [&str; 4] = [LOG_HTML, REPORT_HTML, OUTPUT_XML, CONSOLE_LOG];

/// Per-case results of a bulk request.
#[derive(Debug, Serialize)]
pub struct BulkOutcome<T> {
    pub succeeded: Vec<T>,
    pub failed: Vec<BulkFailure>,
}

impl<T> Default for BulkOutcome<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BulkFailure {
    pub case_id: DbId,
    pub error: String,
}

/// What `execute` did for one case.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionTicket {
    /// Ad-hoc run opened and executing in the background.
    Started { case_id: DbId, run_id: DbId },
    /// Case placed on the queue for the workers.
    Queued { case_id: DbId, item_id: DbId },
}

impl ExecutionTicket {
    pub fn case_id(&self) -> DbId {
        match self {
            Self::Started { case_id, .. } | Self::Queued { case_id, .. } => *case_id,
        }
    }
}

pub struct ExecutionService {
    store: SharedStore,
    dispatcher: Arc<Dispatcher>,
    artifacts: Arc<dyn ArtifactStore>,
    url_ttl: Duration,
    tasks: TaskTracker,
}

impl ExecutionService {
    pub fn new(
        store: SharedStore,
        dispatcher: Arc<Dispatcher>,
        artifacts: Arc<dyn ArtifactStore>,
        url_ttl: Duration,
    ) -> Self {
        Self {
            store,
            dispatcher,
            artifacts,
            url_ttl,
            tasks: TaskTracker::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Queue
    // -----------------------------------------------------------------------

    /// Queue each case. Unknown cases and cases already active in the queue
    /// are reported as failures.
    pub async fn enqueue(
        &self,
        case_ids: &[DbId],
        priority: i32,
        config: serde_json::Value,
        queued_by: Option<String>,
    ) -> ServiceResult<BulkOutcome<QueueItem>> {
        validate_bulk(case_ids, &config)?;

        let mut outcome = BulkOutcome::default();
        for &case_id in case_ids {
            match self.enqueue_one(case_id, priority, &config, queued_by.clone()).await {
                Ok(item) => outcome.succeeded.push(item),
                Err(e) if e.is_client_error() => outcome.failed.push(BulkFailure {
                    case_id,
                    error: e.to_string(),
                }),
                Err(e) => return Err(e),
            }
        }
        Ok(outcome)
    }

    async fn enqueue_one(
        &self,
        case_id: DbId,
        priority: i32,
        config: &serde_json::Value,
        queued_by: Option<String>,
    ) -> ServiceResult<QueueItem> {
        self.store
            .get_case(case_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("test case", case_id))?;

        let item = self
            .store
            .enqueue(&NewQueueItem {
                case_id,
                priority,
                config: config.clone(),
                queued_by,
            })
            .await?;
        tracing::info!(item_id = item.id, case_id, priority, "Case queued");
        Ok(item)
    }

    /// Delete the case's queue item if it has not been claimed yet.
    pub async fn dequeue_remove(&self, case_id: DbId) -> ServiceResult<bool> {
        let removed = self.store.remove(case_id).await?;
        tracing::debug!(case_id, removed, "Dequeue requested");
        Ok(removed)
    }

    /// Cancel the case's queue item if it has not been claimed yet. The
    /// item stays listed as `cancelled` until purged.
    pub async fn cancel_queued(&self, case_id: DbId) -> ServiceResult<bool> {
        let cancelled = self.store.cancel(case_id).await?;
        tracing::debug!(case_id, cancelled, "Queue cancellation requested");
        Ok(cancelled)
    }

    pub async fn list_queue(&self, filter: &QueueFilter, page: Page) -> ServiceResult<Vec<QueueItem>> {
        Ok(self.store.list_items(filter, page).await?)
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Execute cases as `kind` (`ad_hoc` or `queued`).
    ///
    /// Ad-hoc runs are opened immediately and execute in background tasks;
    /// the returned tickets carry their run ids. Queued execution places
    /// each case on the queue at default priority.
    pub async fn execute(
        &self,
        case_ids: &[DbId],
        kind: &str,
        config: serde_json::Value,
        triggered_by: Option<String>,
    ) -> ServiceResult<BulkOutcome<ExecutionTicket>> {
        let kind: RunKind = kind.parse()?;
        validate_bulk(case_ids, &config)?;

        let mut outcome = BulkOutcome::default();
        for &case_id in case_ids {
            let result = match kind {
                RunKind::AdHoc => self.start_ad_hoc(case_id, &config, triggered_by.clone()).await,
                RunKind::Queued => self
                    .enqueue_one(case_id, 0, &config, triggered_by.clone())
                    .await
                    .map(|item| ExecutionTicket::Queued {
                        case_id,
                        item_id: item.id,
                    }),
            };
            match result {
                Ok(ticket) => outcome.succeeded.push(ticket),
                Err(e) if e.is_client_error() => outcome.failed.push(BulkFailure {
                    case_id,
                    error: e.to_string(),
                }),
                Err(e) => return Err(e),
            }
        }
        Ok(outcome)
    }

    async fn start_ad_hoc(
        &self,
        case_id: DbId,
        config: &serde_json::Value,
        triggered_by: Option<String>,
    ) -> ServiceResult<ExecutionTicket> {
        let mut request = ExecuteRequest::ad_hoc(case_id, config.clone());
        request.triggered_by = triggered_by;

        let prepared = self.dispatcher.begin(&request).await?;
        let run_id = prepared.record.id;

        let dispatcher = Arc::clone(&self.dispatcher);
        self.tasks.spawn(async move {
            if let Err(e) = dispatcher.complete(prepared).await {
                tracing::error!(run_id, error = %e, "Ad-hoc run outcome not recorded; the reaper will finish it");
            }
        });
        Ok(ExecutionTicket::Started { case_id, run_id })
    }

    /// Request cancellation of a run. Returns `false` if the run already
    /// finished or is not executing in this process.
    pub async fn cancel_run(&self, run_id: DbId) -> ServiceResult<bool> {
        let run = self.get_run(run_id).await?;
        if run.is_terminal() {
            return Ok(false);
        }
        Ok(self.dispatcher.cancel_run(run_id))
    }

    // -----------------------------------------------------------------------
    // History and artifacts
    // -----------------------------------------------------------------------

    pub async fn get_run(&self, run_id: DbId) -> ServiceResult<RunRecord> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("run", run_id))
    }

    pub async fn list_runs(&self, filter: &RunFilter, page: Page) -> ServiceResult<Vec<RunRecord>> {
        Ok(self.store.list_runs(filter, page).await?)
    }

    /// Presigned URL for the run's most useful log artifact.
    pub async fn get_log_url(&self, run_id: DbId) -> ServiceResult<String> {
        let run = self.get_run(run_id).await?;
        let key = LOG_PREFERENCE
            .iter()
            .find_map(|name| run.log_keys.get(*name))
            .ok_or_else(|| ServiceError::not_found("run log", run_id))?;
        Ok(self.artifacts.presign(key, self.url_ttl).await?)
    }

    /// Raw bytes of one stored artifact of a run.
    pub async fn download_artifact(&self, run_id: DbId, name: &str) -> ServiceResult<Vec<u8>> {
        let run = self.get_run(run_id).await?;
        let key = run
            .log_keys
            .get(name)
            .ok_or_else(|| ServiceError::not_found("run artifact", run_id))?;
        Ok(self.artifacts.get(key).await?)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Number of ad-hoc runs still executing in the background.
    pub fn background_runs(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for background runs to finish. Returns `false` if `grace`
    /// elapsed first. New ad-hoc runs can still be started afterwards.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.tasks.close();
        let finished = tokio::time::timeout(grace, self.tasks.wait()).await.is_ok();
        self.tasks.reopen();
        finished
    }
}

fn validate_bulk(case_ids: &[DbId], config: &serde_json::Value) -> ServiceResult<()> {
    if case_ids.is_empty() {
        return Err(ServiceError::validation("At least one case id is required"));
    }
    RobotOptions::from_config(config)?;
    Ok(())
}
