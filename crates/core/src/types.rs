//! Shared identifier and time types.

use chrono::{SubsecRound, Utc};

/// Primary keys for queue items, run records, cases and scripts (BIGSERIAL).
pub type DbId = i64;

/// Every queued/started/finished column is a UTC timestamp.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Current time truncated to microseconds, so a value written to a
/// `TIMESTAMPTZ` column reads back unchanged.
pub fn now() -> Timestamp {
    Utc::now().trunc_subsecs(6)
}

/// Finish timestamp for a run that started at `started_at`.
///
/// Never earlier than the start, even if the wall clock stepped backwards
/// while the run was executing.
pub fn finish_time(started_at: Timestamp) -> Timestamp {
    now().max(started_at)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_has_microsecond_precision() {
        let ts = now();
        assert_eq!(ts.timestamp_subsec_nanos() % 1_000, 0);
    }

    #[test]
    fn finish_time_never_precedes_start() {
        let future_start = now() + chrono::Duration::seconds(30);
        assert_eq!(finish_time(future_start), future_start);

        let past_start = now() - chrono::Duration::seconds(30);
        assert!(finish_time(past_start) > past_start);
    }
}
