//! Pure fixed-window decision logic.
//!
//! Nothing here touches the store. [`decide`] takes the record as it was
//! fetched and returns both the verdict and the write (if any) that the
//! caller must persist.

use chrono::{DateTime, Utc};

use super::category::CategoryRule;
use super::record::ThrottleRecord;

/// Remaining quota reported when the store could not be consulted.
pub const FAIL_OPEN_REMAINING: u64 = 1;

/// The verdict for a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed.
    Allowed { remaining: u64 },
    /// The request is over the limit for the current window.
    Denied { retry_after_secs: u64 },
}

impl Decision {
    /// The verdict used when the shared store is unavailable.
    pub fn fail_open() -> Self {
        Decision::Allowed {
            remaining: FAIL_OPEN_REMAINING,
        }
    }

    pub fn allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// Remaining requests in the window; always 0 when denied.
    pub fn remaining(&self) -> u64 {
        match self {
            Decision::Allowed { remaining } => *remaining,
            Decision::Denied { .. } => 0,
        }
    }

    /// Seconds until the window frees up, only set when denied.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Decision::Allowed { .. } => None,
            Decision::Denied { retry_after_secs } => Some(*retry_after_secs),
        }
    }
}

/// A write the caller has to apply to the shared store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreWrite {
    Insert(ThrottleRecord),
    Update(ThrottleRecord),
}

impl StoreWrite {
    pub fn record(&self) -> &ThrottleRecord {
        match self {
            StoreWrite::Insert(record) | StoreWrite::Update(record) => record,
        }
    }
}

/// Apply the fixed-window rule to the current record for `key`.
///
/// A rejected request produces no write: the stored count stays at `limit`
/// until the window expires.
pub fn decide(
    key: &str,
    existing: Option<&ThrottleRecord>,
    rule: &CategoryRule,
    now: DateTime<Utc>,
) -> (Decision, Option<StoreWrite>) {
    let first_in_window = Decision::Allowed {
        remaining: rule.limit.saturating_sub(1),
    };

    let Some(record) = existing else {
        let write = StoreWrite::Insert(ThrottleRecord::fresh(key, now));
        return (first_in_window, Some(write));
    };

    let elapsed_ms = elapsed_millis(record.window_start, now);
    let window_ms = rule.window_secs.saturating_mul(1000);

    if elapsed_ms > window_ms {
        let write = StoreWrite::Update(ThrottleRecord::fresh(key, now));
        return (first_in_window, Some(write));
    }

    let new_count = record.count.saturating_add(1);
    if new_count > rule.limit {
        let retry_after_secs = (window_ms - elapsed_ms).div_ceil(1000).max(1);
        return (Decision::Denied { retry_after_secs }, None);
    }

    let write = StoreWrite::Update(ThrottleRecord {
        key: key.to_string(),
        count: new_count,
        window_start: record.window_start,
    });
    (
        Decision::Allowed {
            remaining: rule.limit - new_count,
        },
        Some(write),
    )
}

/// Milliseconds since `start`, clamped to zero if `start` is in the future.
fn elapsed_millis(start: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (now - start).num_milliseconds().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    const KEY: &str = "auth:203.0.113.7";

    fn auth() -> CategoryRule {
        CategoryRule::new(10, 60)
    }

    fn record(count: u64, window_start: DateTime<Utc>) -> ThrottleRecord {
        ThrottleRecord {
            key: KEY.to_string(),
            count,
            window_start,
        }
    }

    #[test]
    fn test_no_record_inserts_fresh_window() {
        let now = Utc::now();
        let (decision, write) = decide(KEY, None, &auth(), now);

        assert_eq!(decision, Decision::Allowed { remaining: 9 });
        assert_eq!(write, Some(StoreWrite::Insert(ThrottleRecord::fresh(KEY, now))));
    }

    #[test]
    fn test_increment_within_window() {
        let start = Utc::now();
        let now = start + TimeDelta::seconds(5);
        let (decision, write) = decide(KEY, Some(&record(4, start)), &auth(), now);

        assert_eq!(decision, Decision::Allowed { remaining: 5 });
        let write = write.unwrap();
        assert!(matches!(write, StoreWrite::Update(_)));
        assert_eq!(write.record().count, 5);
        assert_eq!(write.record().window_start, start);
    }

    #[test]
    fn test_last_allowed_request_leaves_zero_remaining() {
        let start = Utc::now();
        let (decision, write) = decide(KEY, Some(&record(9, start)), &auth(), start);

        assert_eq!(decision, Decision::Allowed { remaining: 0 });
        assert_eq!(write.unwrap().record().count, 10);
    }

    #[test]
    fn test_over_limit_denies_without_write() {
        let start = Utc::now();
        let now = start + TimeDelta::seconds(30);
        let (decision, write) = decide(KEY, Some(&record(10, start)), &auth(), now);

        assert_eq!(decision, Decision::Denied { retry_after_secs: 30 });
        assert_eq!(decision.remaining(), 0);
        assert!(write.is_none());
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let start = Utc::now();
        let now = start + TimeDelta::milliseconds(30_400);
        let (decision, _) = decide(KEY, Some(&record(10, start)), &auth(), now);

        assert_eq!(decision.retry_after_secs(), Some(30));
    }

    #[test]
    fn test_retry_after_is_at_least_one_second() {
        let start = Utc::now();
        let now = start + TimeDelta::seconds(60);
        let (decision, _) = decide(KEY, Some(&record(10, start)), &auth(), now);

        // Exactly at the boundary the window has not expired yet.
        assert_eq!(decision, Decision::Denied { retry_after_secs: 1 });
    }

    #[test]
    fn test_expired_window_resets() {
        let start = Utc::now();
        let now = start + TimeDelta::seconds(61);
        let (decision, write) = decide(KEY, Some(&record(10, start)), &auth(), now);

        assert_eq!(decision, Decision::Allowed { remaining: 9 });
        assert_eq!(write, Some(StoreWrite::Update(ThrottleRecord::fresh(KEY, now))));
    }

    #[test]
    fn test_future_window_start_counts_as_zero_elapsed() {
        let now = Utc::now();
        let start = now + TimeDelta::seconds(5);
        let (decision, _) = decide(KEY, Some(&record(10, start)), &auth(), now);

        assert_eq!(decision, Decision::Denied { retry_after_secs: 60 });
    }

    #[test]
    fn test_zero_limit_never_underflows() {
        let now = Utc::now();
        let rule = CategoryRule::new(0, 60);

        let (decision, _) = decide(KEY, None, &rule, now);
        assert_eq!(decision, Decision::Allowed { remaining: 0 });

        let (decision, _) = decide(KEY, Some(&record(1, now)), &rule, now);
        assert!(!decision.allowed());
    }

    #[test]
    fn test_fail_open_decision() {
        let decision = Decision::fail_open();
        assert!(decision.allowed());
        assert_eq!(decision.remaining(), 1);
        assert_eq!(decision.retry_after_secs(), None);
    }
}
