//! Store traits consumed by the worker, and their PostgreSQL implementation.
//!
//! Method names are distinct across traits so a single type can implement
//! all three without call-site ambiguity.

use std::sync::Arc;

use async_trait::async_trait;
use robotq_core::error::CoreError;
use robotq_core::types::{DbId, Timestamp};

use crate::models::queue_item::{NewQueueItem, QueueFilter, QueueItem};
use crate::models::run_record::{NewRunRecord, RunCompletion, RunFilter, RunRecord};
use crate::models::status::{QueueStatus, RunStatus};
use crate::models::test_case::TestCaseView;
use crate::models::Page;
use crate::repositories::{CaseRepo, QueueRepo, RunRepo};
use crate::DbPool;

/// Name of the partial unique index enforcing one active item per case.
pub const ACTIVE_CASE_CONSTRAINT: &str = "uq_queue_items_active_case";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Case {case_id} already has an active queue item")]
    Duplicate { case_id: DbId },

    #[error("Invalid transition for {entity} {id}: {detail}")]
    InvalidTransition {
        entity: &'static str,
        id: DbId,
        detail: String,
    },

    #[error("Corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate { case_id } => CoreError::Duplicate { case_id },
            StoreError::InvalidTransition { .. } => CoreError::Validation(err.to_string()),
            other => CoreError::Internal(other.to_string()),
        }
    }
}

/// Returns `true` if `err` is a unique violation on `constraint`.
pub fn is_unique_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().as_deref() == Some("23505") && db_err.constraint() == Some(constraint)
        }
        _ => false,
    }
}

/// Prioritized work queue.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a `queued` item. Fails with [`StoreError::Duplicate`] if the
    /// case already has a queued or processing item.
    async fn enqueue(&self, item: &NewQueueItem) -> Result<QueueItem, StoreError>;

    /// Atomically claim the highest-priority queued item, flipping it to
    /// `processing`, stamping `started_at` and incrementing `attempts`.
    async fn dequeue_next(&self) -> Result<Option<QueueItem>, StoreError>;

    /// Delete the case's item if it is still `queued`.
    async fn remove(&self, case_id: DbId) -> Result<bool, StoreError>;

    /// Move the case's `queued` item to `cancelled`, keeping the row.
    async fn cancel(&self, case_id: DbId) -> Result<bool, StoreError>;

    /// Snapshot ordered by priority, then `queued_at`, then id.
    async fn list_items(&self, filter: &QueueFilter, page: Page)
        -> Result<Vec<QueueItem>, StoreError>;

    async fn find_item(&self, item_id: DbId) -> Result<Option<QueueItem>, StoreError>;

    /// Delete a `processing` item claimed at `claimed_at`. Returns `false`
    /// if the item was requeued, re-claimed or already gone.
    async fn delete_claimed(&self, item_id: DbId, claimed_at: Timestamp)
        -> Result<bool, StoreError>;

    /// Close a `processing` item claimed at `claimed_at` as `failed` or
    /// `cancelled`. Same claim guard as [`QueueStore::delete_claimed`].
    async fn mark_finished(&self, item_id: DbId, claimed_at: Timestamp, status: QueueStatus)
        -> Result<bool, StoreError>;

    /// `processing` items whose claim started before `older_than`.
    async fn find_stale(&self, older_than: Timestamp) -> Result<Vec<QueueItem>, StoreError>;

    /// Return a stale item to `queued`. Only succeeds while the item is
    /// still `processing` under the claim that started at `claimed_at`.
    async fn requeue(&self, item_id: DbId, claimed_at: Timestamp) -> Result<bool, StoreError>;

    /// Delete completed, failed and cancelled items that finished before
    /// `older_than`. Returns the number deleted.
    async fn purge_finished(&self, older_than: Timestamp) -> Result<u64, StoreError>;
}

/// Durable run history.
#[async_trait]
pub trait RunHistoryStore: Send + Sync {
    /// Open a run in `running` with `started_at` from the DTO.
    async fn create_run(&self, run: &NewRunRecord) -> Result<RunRecord, StoreError>;

    /// Write the terminal state. Returns `false` if the run was already
    /// terminal (or does not exist); terminal records never change.
    async fn finish_run(&self, run_id: DbId, completion: &RunCompletion)
        -> Result<bool, StoreError>;

    async fn get_run(&self, run_id: DbId) -> Result<Option<RunRecord>, StoreError>;

    /// Newest first.
    async fn list_runs(&self, filter: &RunFilter, page: Page)
        -> Result<Vec<RunRecord>, StoreError>;

    /// Most recent run opened for a queue item.
    async fn latest_for_queue_item(&self, item_id: DbId)
        -> Result<Option<RunRecord>, StoreError>;

    /// `running` runs without a queue item that started before
    /// `older_than`, oldest first.
    async fn find_orphaned_runs(&self, older_than: Timestamp)
        -> Result<Vec<RunRecord>, StoreError>;
}

/// Read-only lookup of test cases and their scripts.
#[async_trait]
pub trait CaseCatalog: Send + Sync {
    async fn get_case(&self, case_id: DbId) -> Result<Option<TestCaseView>, StoreError>;
}

/// Everything the worker needs from persistence.
pub trait Store: QueueStore + RunHistoryStore + CaseCatalog {}

impl<T> Store for T where T: QueueStore + RunHistoryStore + CaseCatalog {}

/// Shared handle; each worker holds its own clone.
pub type SharedStore = Arc<dyn Store>;

/// Rejects completions the state machine does not allow from `running`.
pub(crate) fn ensure_terminal(run_id: DbId, completion: &RunCompletion) -> Result<(), StoreError> {
    if RunStatus::Running.can_transition_to(completion.status) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            entity: "run",
            id: run_id,
            detail: format!("{} is not a terminal status", completion.status),
        })
    }
}

/// Rejects `mark_finished` targets other than failed/cancelled.
pub(crate) fn ensure_closing_status(item_id: DbId, status: QueueStatus) -> Result<(), StoreError> {
    if matches!(status, QueueStatus::Failed | QueueStatus::Cancelled) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            entity: "queue item",
            id: item_id,
            detail: format!("cannot close an item as {status}"),
        })
    }
}

/// PostgreSQL-backed store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl QueueStore for PgStore {
    async fn enqueue(&self, item: &NewQueueItem) -> Result<QueueItem, StoreError> {
        QueueRepo::enqueue(&self.pool, item).await
    }

    async fn dequeue_next(&self) -> Result<Option<QueueItem>, StoreError> {
        QueueRepo::claim_next(&self.pool).await
    }

    async fn remove(&self, case_id: DbId) -> Result<bool, StoreError> {
        Ok(QueueRepo::remove_queued(&self.pool, case_id).await?)
    }

    async fn cancel(&self, case_id: DbId) -> Result<bool, StoreError> {
        Ok(QueueRepo::cancel_queued(&self.pool, case_id).await?)
    }

    async fn list_items(
        &self,
        filter: &QueueFilter,
        page: Page,
    ) -> Result<Vec<QueueItem>, StoreError> {
        QueueRepo::list(&self.pool, filter, page).await
    }

    async fn find_item(&self, item_id: DbId) -> Result<Option<QueueItem>, StoreError> {
        QueueRepo::find_by_id(&self.pool, item_id).await
    }

    async fn delete_claimed(&self, item_id: DbId, claimed_at: Timestamp) -> Result<bool, StoreError> {
        Ok(QueueRepo::delete_claimed(&self.pool, item_id, claimed_at).await?)
    }

    async fn mark_finished(
        &self,
        item_id: DbId,
        claimed_at: Timestamp,
        status: QueueStatus,
    ) -> Result<bool, StoreError> {
        ensure_closing_status(item_id, status)?;
        Ok(QueueRepo::mark_finished(&self.pool, item_id, claimed_at, status).await?)
    }

    async fn find_stale(&self, older_than: Timestamp) -> Result<Vec<QueueItem>, StoreError> {
        QueueRepo::find_stale(&self.pool, older_than).await
    }

    async fn requeue(&self, item_id: DbId, claimed_at: Timestamp) -> Result<bool, StoreError> {
        Ok(QueueRepo::requeue(&self.pool, item_id, claimed_at).await?)
    }

    async fn purge_finished(&self, older_than: Timestamp) -> Result<u64, StoreError> {
        Ok(QueueRepo::purge_finished(&self.pool, older_than).await?)
    }
}

#[async_trait]
impl RunHistoryStore for PgStore {
    async fn create_run(&self, run: &NewRunRecord) -> Result<RunRecord, StoreError> {
        RunRepo::create(&self.pool, run).await
    }

    async fn finish_run(
        &self,
        run_id: DbId,
        completion: &RunCompletion,
    ) -> Result<bool, StoreError> {
        ensure_terminal(run_id, completion)?;
        RunRepo::finish(&self.pool, run_id, completion).await
    }

    async fn get_run(&self, run_id: DbId) -> Result<Option<RunRecord>, StoreError> {
        RunRepo::find_by_id(&self.pool, run_id).await
    }

    async fn list_runs(&self, filter: &RunFilter, page: Page) -> Result<Vec<RunRecord>, StoreError> {
        RunRepo::list(&self.pool, filter, page).await
    }

    async fn latest_for_queue_item(&self, item_id: DbId) -> Result<Option<RunRecord>, StoreError> {
        RunRepo::latest_for_queue_item(&self.pool, item_id).await
    }

    async fn find_orphaned_runs(&self, older_than: Timestamp) -> Result<Vec<RunRecord>, StoreError> {
        RunRepo::find_orphaned(&self.pool, older_than).await
    }
}

#[async_trait]
impl CaseCatalog for PgStore {
    async fn get_case(&self, case_id: DbId) -> Result<Option<TestCaseView>, StoreError> {
        Ok(CaseRepo::find_view(&self.pool, case_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::models::status::RunStatus;

    #[test]
    fn non_terminal_completion_rejected() {
        let completion = RunCompletion::new(RunStatus::Running);
        assert_matches!(
            ensure_terminal(5, &completion),
            Err(StoreError::InvalidTransition { entity: "run", id: 5, .. })
        );
        assert!(ensure_terminal(5, &RunCompletion::new(RunStatus::Error)).is_ok());
    }

    #[test]
    fn only_failed_or_cancelled_close_items() {
        assert!(ensure_closing_status(1, QueueStatus::Failed).is_ok());
        assert!(ensure_closing_status(1, QueueStatus::Cancelled).is_ok());
        assert!(ensure_closing_status(1, QueueStatus::Queued).is_err());
        assert!(ensure_closing_status(1, QueueStatus::Completed).is_err());
    }

    #[test]
    fn duplicate_maps_to_core_duplicate() {
        let core: CoreError = StoreError::Duplicate { case_id: 4 }.into();
        assert_matches!(core, CoreError::Duplicate { case_id: 4 });
    }

    #[test]
    fn row_not_found_is_not_a_unique_violation() {
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound, ACTIVE_CASE_CONSTRAINT));
    }
}
