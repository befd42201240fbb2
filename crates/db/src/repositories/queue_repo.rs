//! Repository for the `queue_items` table.

use robotq_core::types::{self, DbId, Timestamp};
use sqlx::PgPool;

use crate::models::queue_item::{NewQueueItem, QueueFilter, QueueItem, QueueItemRow};
use crate::models::status::{QueueStatus, StatusId};
use crate::models::Page;
use crate::store::{is_unique_violation, StoreError, ACTIVE_CASE_CONSTRAINT};

/// Column list for `queue_items` queries.
const COLUMNS: &str = "\
    id, case_id, status_id, priority, config, attempts, queued_by, \
    queued_at, started_at, completed_at";

/// Claim order: lowest priority value first, then FIFO.
const CLAIM_ORDER: &str = "priority ASC, queued_at ASC, id ASC";

/// Statuses eligible for retention purge.
const FINISHED_STATUSES: [StatusId; 3] = [
    QueueStatus::Completed as StatusId,
    QueueStatus::Failed as StatusId,
    QueueStatus::Cancelled as StatusId,
];

fn convert(rows: Vec<QueueItemRow>) -> Result<Vec<QueueItem>, StoreError> {
    rows.into_iter().map(QueueItem::try_from).collect()
}

pub struct QueueRepo;

impl QueueRepo {
    /// Insert a new `queued` item.
    ///
    /// The partial unique index `uq_queue_items_active_case` rejects a second
    /// active item for the same case; that violation is reported as
    /// [`StoreError::Duplicate`].
    pub async fn enqueue(pool: &PgPool, input: &NewQueueItem) -> Result<QueueItem, StoreError> {
        let query = format!(
            "INSERT INTO queue_items (case_id, status_id, priority, config, queued_by, queued_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, QueueItemRow>(&query)
            .bind(input.case_id)
            .bind(QueueStatus::Queued.id())
            .bind(input.priority)
            .bind(&input.config)
            .bind(&input.queued_by)
            .bind(types::now())
            .fetch_one(pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e, ACTIVE_CASE_CONSTRAINT) {
                    StoreError::Duplicate {
                        case_id: input.case_id,
                    }
                } else {
                    StoreError::Database(e)
                }
            })?;
        row.try_into()
    }

    /// Atomically claim the next queued item.
    ///
    /// Uses `SELECT FOR UPDATE SKIP LOCKED` so concurrent workers never
    /// claim the same row.
    pub async fn claim_next(pool: &PgPool) -> Result<Option<QueueItem>, StoreError> {
        let query = format!(
            "UPDATE queue_items \
             SET status_id = $1, started_at = $2, attempts = attempts + 1 \
             WHERE id = ( \
                 SELECT id FROM queue_items \
                 WHERE status_id = $3 \
                 ORDER BY {CLAIM_ORDER} \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, QueueItemRow>(&query)
            .bind(QueueStatus::Processing.id())
            .bind(types::now())
            .bind(QueueStatus::Queued.id())
            .fetch_optional(pool)
            .await?
            .map(QueueItem::try_from)
            .transpose()
    }

    /// Delete the case's item only if it is still queued.
    pub async fn remove_queued(pool: &PgPool, case_id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM queue_items WHERE case_id = $1 AND status_id = $2")
            .bind(case_id)
            .bind(QueueStatus::Queued.id())
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move the case's queued item to `cancelled`.
    pub async fn cancel_queued(pool: &PgPool, case_id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE queue_items SET status_id = $2, completed_at = $3 \
             WHERE case_id = $1 AND status_id = $4",
        )
        .bind(case_id)
        .bind(QueueStatus::Cancelled.id())
        .bind(types::now())
        .bind(QueueStatus::Queued.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<QueueItem>, StoreError> {
        let query = format!("SELECT {COLUMNS} FROM queue_items WHERE id = $1");
        sqlx::query_as::<_, QueueItemRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await?
            .map(QueueItem::try_from)
            .transpose()
    }

    /// Delete a processing item, but only under the claim that started at
    /// `claimed_at`. A re-claimed item belongs to its new worker.
    pub async fn delete_claimed(
        pool: &PgPool,
        id: DbId,
        claimed_at: Timestamp,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM queue_items WHERE id = $1 AND status_id = $2 AND started_at = $3",
        )
        .bind(id)
        .bind(QueueStatus::Processing.id())
        .bind(claimed_at)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Close a processing item with `status`, guarded by the claim like
    /// [`delete_claimed`](Self::delete_claimed). Caller validates the status.
    pub async fn mark_finished(
        pool: &PgPool,
        id: DbId,
        claimed_at: Timestamp,
        status: QueueStatus,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE queue_items SET status_id = $2, completed_at = $3 \
             WHERE id = $1 AND status_id = $4 AND started_at = $5",
        )
        .bind(id)
        .bind(status.id())
        .bind(types::now())
        .bind(QueueStatus::Processing.id())
        .bind(claimed_at)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Processing items claimed before `older_than`, oldest claim first.
    pub async fn find_stale(
        pool: &PgPool,
        older_than: Timestamp,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM queue_items \
             WHERE status_id = $1 AND started_at < $2 \
             ORDER BY started_at ASC, id ASC"
        );
        let rows = sqlx::query_as::<_, QueueItemRow>(&query)
            .bind(QueueStatus::Processing.id())
            .bind(older_than)
            .fetch_all(pool)
            .await?;
        convert(rows)
    }

    /// Return a processing item to the queue, guarded by the claim timestamp
    /// so a concurrent requeue or re-claim is not overwritten.
    pub async fn requeue(
        pool: &PgPool,
        id: DbId,
        claimed_at: Timestamp,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE queue_items SET status_id = $2, started_at = NULL \
             WHERE id = $1 AND status_id = $3 AND started_at = $4",
        )
        .bind(id)
        .bind(QueueStatus::Queued.id())
        .bind(QueueStatus::Processing.id())
        .bind(claimed_at)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete finished items whose `completed_at` precedes `older_than`.
    pub async fn purge_finished(pool: &PgPool, older_than: Timestamp) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM queue_items \
             WHERE status_id IN ($1, $2, $3) AND completed_at < $4",
        )
        .bind(FINISHED_STATUSES[0])
        .bind(FINISHED_STATUSES[1])
        .bind(FINISHED_STATUSES[2])
        .bind(older_than)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// List items in claim order with optional filters and pagination.
    pub async fn list(
        pool: &PgPool,
        filter: &QueueFilter,
        page: Page,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let mut conditions: Vec<String> = Vec::new();
        let mut bind_idx: u32 = 1;

        if filter.status.is_some() {
            conditions.push(format!("status_id = ${bind_idx}"));
            bind_idx += 1;
        }
        if filter.case_id.is_some() {
            conditions.push(format!("case_id = ${bind_idx}"));
            bind_idx += 1;
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let query = format!(
            "SELECT {COLUMNS} FROM queue_items \
             {where_clause} \
             ORDER BY {CLAIM_ORDER} \
             LIMIT ${bind_idx} OFFSET ${}",
            bind_idx + 1,
        );

        let mut q = sqlx::query_as::<_, QueueItemRow>(&query);
        if let Some(status) = filter.status {
            q = q.bind(status.id());
        }
        if let Some(case_id) = filter.case_id {
            q = q.bind(case_id);
        }
        q = q.bind(page.clamp_limit()).bind(page.clamp_offset());

        convert(q.fetch_all(pool).await?)
    }
}
