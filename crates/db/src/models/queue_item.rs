//! Queue item models (`queue_items` table).

use robotq_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::status::{QueueStatus, StatusId};
use crate::store::StoreError;

/// A raw row from `queue_items`.
#[derive(Debug, Clone, FromRow)]
pub struct QueueItemRow {
    pub id: DbId,
    pub case_id: DbId,
    pub status_id: StatusId,
    pub priority: i32,
    pub config: serde_json::Value,
    pub attempts: i32,
    pub queued_by: Option<String>,
    pub queued_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

/// A pending (or claimed) request to execute one test case.
///
/// Lower `priority` values are claimed first; ties are broken by
/// `queued_at`, then `id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueItem {
    pub id: DbId,
    pub case_id: DbId,
    pub status: QueueStatus,
    pub priority: i32,
    pub config: serde_json::Value,
    /// Number of times the item has been claimed.
    pub attempts: i32,
    pub queued_by: Option<String>,
    pub queued_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

impl TryFrom<QueueItemRow> for QueueItem {
    type Error = StoreError;

    fn try_from(row: QueueItemRow) -> Result<Self, Self::Error> {
        let status = QueueStatus::from_id(row.status_id).ok_or_else(|| StoreError::Corrupt {
            table: "queue_items",
            detail: format!("item {} has unknown status_id {}", row.id, row.status_id),
        })?;
        Ok(Self {
            id: row.id,
            case_id: row.case_id,
            status,
            priority: row.priority,
            config: row.config,
            attempts: row.attempts,
            queued_by: row.queued_by,
            queued_at: row.queued_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

/// DTO for enqueuing a case.
#[derive(Debug, Clone, Deserialize)]
pub struct NewQueueItem {
    pub case_id: DbId,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "empty_config")]
    pub config: serde_json::Value,
    pub queued_by: Option<String>,
}

impl NewQueueItem {
    pub fn new(case_id: DbId, priority: i32, config: serde_json::Value) -> Self {
        Self {
            case_id,
            priority,
            config,
            queued_by: None,
        }
    }
}

fn empty_config() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

/// Filters for listing the queue.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct QueueFilter {
    pub status: Option<QueueStatus>,
    pub case_id: Option<DbId>,
}

impl QueueFilter {
    pub fn matches(&self, item: &QueueItem) -> bool {
        self.status.map_or(true, |s| s == item.status)
            && self.case_id.map_or(true, |c| c == item.case_id)
    }
}
