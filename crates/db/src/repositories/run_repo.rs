//! Repository for the `run_records` table.

use robotq_core::types::{DbId, Timestamp};
use sqlx::types::Json;
use sqlx::PgPool;

use crate::models::run_record::{NewRunRecord, RunCompletion, RunFilter, RunRecord, RunRecordRow};
use crate::models::status::{RunStatus, StatusId};
use crate::models::Page;
use crate::store::StoreError;

/// Column list for `run_records` queries.
const COLUMNS: &str = "\
    id, case_id, queue_item_id, kind_id, status_id, started_at, finished_at, \
    results, error_message, log_keys, triggered_by, created_at";

pub struct RunRepo;

impl RunRepo {
    /// Open a run directly in `running`.
    pub async fn create(pool: &PgPool, input: &NewRunRecord) -> Result<RunRecord, StoreError> {
        let query = format!(
            "INSERT INTO run_records \
                 (case_id, queue_item_id, kind_id, status_id, started_at, triggered_by, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $5) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, RunRecordRow>(&query)
            .bind(input.case_id)
            .bind(input.queue_item_id)
            .bind(input.kind.id())
            .bind(RunStatus::Running.id())
            .bind(input.started_at)
            .bind(&input.triggered_by)
            .fetch_one(pool)
            .await?
            .try_into()
    }

    /// Write the terminal state if the state machine allows it from the
    /// run's current status.
    ///
    /// `finished_at` is raised to `started_at` when the supplied value is
    /// earlier, so the ordering check constraint always holds.
    pub async fn finish(
        pool: &PgPool,
        id: DbId,
        completion: &RunCompletion,
    ) -> Result<bool, StoreError> {
        let from: Vec<StatusId> = RunStatus::predecessors(completion.status)
            .into_iter()
            .map(RunStatus::id)
            .collect();
        let result = sqlx::query(
            "UPDATE run_records \
             SET status_id = $2, finished_at = GREATEST($3, started_at), \
                 results = $4, error_message = $5, log_keys = $6 \
             WHERE id = $1 AND status_id = ANY($7)",
        )
        .bind(id)
        .bind(completion.status.id())
        .bind(completion.finished_at)
        .bind(completion.results.as_ref().map(Json))
        .bind(&completion.error_message)
        .bind(Json(&completion.log_keys))
        .bind(&from)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Running ad-hoc runs (no queue item) that started before `older_than`.
    pub async fn find_orphaned(
        pool: &PgPool,
        older_than: Timestamp,
    ) -> Result<Vec<RunRecord>, StoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM run_records \
             WHERE status_id = $1 AND queue_item_id IS NULL AND started_at < $2 \
             ORDER BY started_at ASC, id ASC"
        );
        sqlx::query_as::<_, RunRecordRow>(&query)
            .bind(RunStatus::Running.id())
            .bind(older_than)
            .fetch_all(pool)
            .await?
            .into_iter()
            .map(RunRecord::try_from)
            .collect()
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<RunRecord>, StoreError> {
        let query = format!("SELECT {COLUMNS} FROM run_records WHERE id = $1");
        sqlx::query_as::<_, RunRecordRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await?
            .map(RunRecord::try_from)
            .transpose()
    }

    pub async fn latest_for_queue_item(
        pool: &PgPool,
        item_id: DbId,
    ) -> Result<Option<RunRecord>, StoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM run_records \
             WHERE queue_item_id = $1 \
             ORDER BY created_at DESC, id DESC \
             LIMIT 1"
        );
        sqlx::query_as::<_, RunRecordRow>(&query)
            .bind(item_id)
            .fetch_optional(pool)
            .await?
            .map(RunRecord::try_from)
            .transpose()
    }

    /// List runs newest first with optional filters and pagination.
    pub async fn list(
        pool: &PgPool,
        filter: &RunFilter,
        page: Page,
    ) -> Result<Vec<RunRecord>, StoreError> {
        let mut conditions: Vec<String> = Vec::new();
        let mut bind_idx: u32 = 1;

        if filter.case_id.is_some() {
            conditions.push(format!("case_id = ${bind_idx}"));
            bind_idx += 1;
        }
        if filter.status.is_some() {
            conditions.push(format!("status_id = ${bind_idx}"));
            bind_idx += 1;
        }
        if filter.kind.is_some() {
            conditions.push(format!("kind_id = ${bind_idx}"));
            bind_idx += 1;
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let query = format!(
            "SELECT {COLUMNS} FROM run_records \
             {where_clause} \
             ORDER BY created_at DESC, id DESC \
             LIMIT ${bind_idx} OFFSET ${}",
            bind_idx + 1,
        );

        let mut q = sqlx::query_as::<_, RunRecordRow>(&query);
        if let Some(case_id) = filter.case_id {
            q = q.bind(case_id);
        }
        if let Some(status) = filter.status {
            q = q.bind(status.id());
        }
        if let Some(kind) = filter.kind {
            q = q.bind(kind.id());
        }
        q = q.bind(page.clamp_limit()).bind(page.clamp_offset());

        q.fetch_all(pool)
            .await?
            .into_iter()
            .map(RunRecord::try_from)
            .collect()
    }
}
