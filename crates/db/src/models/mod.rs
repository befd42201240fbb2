//! Row models, create DTOs and list filters.
//!
//! Each submodule pairs a `FromRow` row struct (status columns as raw
//! SMALLINT ids) with the typed domain struct callers work with. Rows are
//! converted with `TryFrom`, so an unknown lookup id surfaces as
//! [`crate::store::StoreError::Corrupt`] instead of a panic.

pub mod queue_item;
pub mod run_record;
pub mod status;
pub mod test_case;

use serde::Deserialize;

/// Default page size for list operations.
pub const DEFAULT_LIMIT: i64 = 50;

/// Maximum page size for list operations.
pub const MAX_LIMIT: i64 = 100;

/// Pagination parameters (`limit` / `offset`), clamped before use.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Page {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Page {
    pub fn new(limit: i64, offset: i64) -> Self {
        Self {
            limit: Some(limit),
            offset: Some(offset),
        }
    }

    /// Limit in `1..=MAX_LIMIT`, defaulting to [`DEFAULT_LIMIT`].
    pub fn clamp_limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }

    /// Non-negative offset, defaulting to 0.
    pub fn clamp_offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}
