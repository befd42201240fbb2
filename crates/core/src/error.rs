use crate::types::DbId;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: DbId },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Duplicate: case {case_id} already has an active queue item")]
    Duplicate { case_id: DbId },

    #[error("Internal error: {0}")]
    Internal(String),
}
