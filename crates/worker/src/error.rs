use robotq_core::error::CoreError;
use robotq_core::types::DbId;
use robotq_db::store::StoreError;
use robotq_storage::StorageError;

/// Error type for dispatcher and service operations.
///
/// Domain errors (not found, validation, duplicate) arrive as [`CoreError`];
/// infrastructure failures keep their source type.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Persistence error: {0}")]
    Store(StoreError),

    #[error("Artifact storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Duplicate and invalid-transition store errors are domain errors.
impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate { .. } | StoreError::InvalidTransition { .. } => {
                ServiceError::Core(err.into())
            }
            other => ServiceError::Store(other),
        }
    }
}

impl ServiceError {
    pub fn not_found(entity: &'static str, id: DbId) -> Self {
        ServiceError::Core(CoreError::NotFound { entity, id })
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        ServiceError::Core(CoreError::Validation(msg.into()))
    }

    /// `true` for errors caused by the request rather than the system.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServiceError::Core(
                CoreError::NotFound { .. } | CoreError::Validation(_) | CoreError::Duplicate { .. }
            )
        )
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn duplicate_store_error_becomes_core_duplicate() {
        let err: ServiceError = StoreError::Duplicate { case_id: 3 }.into();
        assert_matches!(err, ServiceError::Core(CoreError::Duplicate { case_id: 3 }));
        assert!(err.is_client_error());
    }

    #[test]
    fn corrupt_row_stays_infrastructure() {
        let err: ServiceError = StoreError::Corrupt {
            table: "run_records",
            detail: "unknown status_id 9".into(),
        }
        .into();
        assert_matches!(err, ServiceError::Store(StoreError::Corrupt { .. }));
        assert!(!err.is_client_error());
    }

    #[test]
    fn not_found_names_entity() {
        let err = ServiceError::not_found("run", 12);
        assert_eq!(err.to_string(), "Entity not found: run with id 12");
    }
}
