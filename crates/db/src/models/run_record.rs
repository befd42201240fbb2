//! Run history models (`run_records` table).

use std::collections::BTreeMap;

use robotq_core::runner::OutcomeStatus;
use robotq_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::status::{RunKind, RunStatus, StatusId};
use crate::store::StoreError;

/// A raw row from `run_records`.
#[derive(Debug, Clone, FromRow)]
pub struct RunRecordRow {
    pub id: DbId,
    pub case_id: DbId,
    pub queue_item_id: Option<DbId>,
    pub kind_id: StatusId,
    pub status_id: StatusId,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    pub results: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub log_keys: serde_json::Value,
    pub triggered_by: Option<String>,
    pub created_at: Timestamp,
}

/// Summary stored in the `results` JSONB column of a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResults {
    /// Process exit code; `None` when killed, crashed or never started.
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// How the runner process ended, when it ran at all.
    pub outcome: Option<OutcomeStatus>,
    /// Artifacts the run produced that could not be stored.
    #[serde(default)]
    pub missing_artifacts: Vec<String>,
}

/// Durable history of one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub id: DbId,
    pub case_id: DbId,
    /// The originating queue item on the queued path.
    pub queue_item_id: Option<DbId>,
    pub kind: RunKind,
    pub status: RunStatus,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    pub results: Option<RunResults>,
    pub error_message: Option<String>,
    /// Artifact file name to storage key.
    pub log_keys: BTreeMap<String, String>,
    pub triggered_by: Option<String>,
    pub created_at: Timestamp,
}

impl RunRecord {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl TryFrom<RunRecordRow> for RunRecord {
    type Error = StoreError;

    fn try_from(row: RunRecordRow) -> Result<Self, Self::Error> {
        let corrupt = |detail: String| StoreError::Corrupt {
            table: "run_records",
            detail: format!("run {}: {detail}", row.id),
        };
        let kind = RunKind::from_id(row.kind_id)
            .ok_or_else(|| corrupt(format!("unknown kind_id {}", row.kind_id)))?;
        let status = RunStatus::from_id(row.status_id)
            .ok_or_else(|| corrupt(format!("unknown status_id {}", row.status_id)))?;
        let results = row
            .results
            .map(serde_json::from_value::<RunResults>)
            .transpose()
            .map_err(|e| corrupt(format!("malformed results: {e}")))?;
        let log_keys = serde_json::from_value(row.log_keys)
            .map_err(|e| corrupt(format!("malformed log_keys: {e}")))?;

        Ok(Self {
            id: row.id,
            case_id: row.case_id,
            queue_item_id: row.queue_item_id,
            kind,
            status,
            started_at: row.started_at,
            finished_at: row.finished_at,
            results,
            error_message: row.error_message,
            log_keys,
            triggered_by: row.triggered_by,
            created_at: row.created_at,
        })
    }
}

/// DTO for opening a run. Runs are created directly in `running`.
#[derive(Debug, Clone)]
pub struct NewRunRecord {
    pub case_id: DbId,
    pub queue_item_id: Option<DbId>,
    pub kind: RunKind,
    pub triggered_by: Option<String>,
    pub started_at: Timestamp,
}

impl NewRunRecord {
    pub fn new(case_id: DbId, kind: RunKind) -> Self {
        Self {
            case_id,
            queue_item_id: None,
            kind,
            triggered_by: None,
            started_at: robotq_core::types::now(),
        }
    }

    pub fn for_queue_item(mut self, item_id: DbId) -> Self {
        self.queue_item_id = Some(item_id);
        self
    }

    pub fn triggered_by(mut self, actor: Option<String>) -> Self {
        self.triggered_by = actor;
        self
    }
}

/// Terminal state written exactly once by `finish_run`.
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub status: RunStatus,
    /// Raised to `started_at` by the store if the clock stepped backwards.
    pub finished_at: Timestamp,
    pub results: Option<RunResults>,
    pub error_message: Option<String>,
    pub log_keys: BTreeMap<String, String>,
}

impl RunCompletion {
    pub fn new(status: RunStatus) -> Self {
        Self {
            status,
            finished_at: robotq_core::types::now(),
            results: None,
            error_message: None,
            log_keys: BTreeMap::new(),
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// Filters for listing run history.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct RunFilter {
    pub case_id: Option<DbId>,
    pub status: Option<RunStatus>,
    pub kind: Option<RunKind>,
}

impl RunFilter {
    pub fn matches(&self, run: &RunRecord) -> bool {
        self.case_id.map_or(true, |c| c == run.case_id)
            && self.status.map_or(true, |s| s == run.status)
            && self.kind.map_or(true, |k| k == run.kind)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn row() -> RunRecordRow {
        RunRecordRow {
            id: 1,
            case_id: 2,
            queue_item_id: Some(3),
            kind_id: RunKind::Queued.id(),
            status_id: RunStatus::Completed.id(),
            started_at: Some(robotq_core::types::now()),
            finished_at: Some(robotq_core::types::now()),
            results: Some(json!({
                "exit_code": 0,
                "duration_ms": 1200,
                "outcome": "passed",
                "missing_artifacts": []
            })),
            error_message: None,
            log_keys: json!({"log.html": "runs/1/log.html"}),
            triggered_by: Some("alice".into()),
            created_at: robotq_core::types::now(),
        }
    }

    #[test]
    fn row_converts_results_and_keys() {
        let run = RunRecord::try_from(row()).expect("convert");
        assert_eq!(run.kind, RunKind::Queued);
        assert_eq!(
            run.results.as_ref().and_then(|r| r.outcome),
            Some(OutcomeStatus::Passed)
        );
        assert_eq!(run.log_keys["log.html"], "runs/1/log.html");
    }

    #[test]
    fn malformed_results_are_corrupt() {
        let mut bad = row();
        bad.results = Some(json!("not an object"));
        assert_matches!(RunRecord::try_from(bad), Err(StoreError::Corrupt { .. }));
    }

    #[test]
    fn unknown_kind_is_corrupt() {
        let mut bad = row();
        bad.kind_id = 9;
        assert_matches!(RunRecord::try_from(bad), Err(StoreError::Corrupt { .. }));
    }
}
