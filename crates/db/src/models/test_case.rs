//! Read-only view of a test case joined with its parent script.

use robotq_core::types::DbId;
use serde::Serialize;
use sqlx::FromRow;

/// Everything the dispatcher needs to run one case.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct TestCaseView {
    pub id: DbId,
    pub name: String,
    pub script_id: DbId,
    pub variables: serde_json::Value,
    pub script_name: String,
    pub script_content: String,
}
