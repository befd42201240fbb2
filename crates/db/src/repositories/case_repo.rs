//! Read-only access to `test_cases` joined with `test_scripts`.

use robotq_core::types::DbId;
use sqlx::PgPool;

use crate::models::test_case::TestCaseView;

pub struct CaseRepo;

impl CaseRepo {
    /// Resolve a case and its parent script in one query.
    pub async fn find_view(pool: &PgPool, case_id: DbId) -> Result<Option<TestCaseView>, sqlx::Error> {
        sqlx::query_as::<_, TestCaseView>(
            "SELECT c.id, c.name, c.script_id, c.variables, \
                    s.name AS script_name, s.content AS script_content \
             FROM test_cases c \
             JOIN test_scripts s ON s.id = c.script_id \
             WHERE c.id = $1",
        )
        .bind(case_id)
        .fetch_optional(pool)
        .await
    }
}
