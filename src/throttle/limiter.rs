//! The request throttle: category lookup, store round trips, fail-open policy.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument, trace, warn};

use super::category::{Category, CategoryRule, CategoryTable};
use super::clock::{Clock, SystemClock};
use super::decision::{decide, Decision, StoreWrite};
use super::record::ThrottleKey;
use crate::store::ThrottleStore;

/// How a check is executed against the shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    /// Fetch, decide in process, then write. Concurrent requests for the same
    /// key may race and overshoot the limit slightly.
    #[default]
    ReadModifyWrite,
    /// Let the store decide and write in a single step.
    Atomic,
}

/// Fixed-window throttle over a shared [`ThrottleStore`].
///
/// This struct is thread-safe and can be shared across request handlers.
pub struct RequestThrottle {
    store: Arc<dyn ThrottleStore>,
    categories: CategoryTable,
    clock: Arc<dyn Clock>,
    consistency: Consistency,
}

impl RequestThrottle {
    /// Create a throttle with the default category table and system clock.
    pub fn new(store: Arc<dyn ThrottleStore>) -> Self {
        Self {
            store,
            categories: CategoryTable::default(),
            clock: Arc::new(SystemClock::new()),
            consistency: Consistency::default(),
        }
    }

    pub fn with_categories(mut self, categories: CategoryTable) -> Self {
        self.categories = categories;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    /// Get the rule applied to a category.
    pub fn rule(&self, category: Category) -> CategoryRule {
        self.categories.rule(category)
    }

    /// Get the clock used for window arithmetic.
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Check whether `client_id` may make another request in `category`.
    ///
    /// Never fails: any store error yields an allowed decision.
    #[instrument(skip(self, category), fields(category = %category))]
    pub async fn check(&self, category: Category, client_id: &str) -> Decision {
        let key = ThrottleKey::new(category, client_id).to_string_key();
        let rule = self.categories.rule(category);
        let now = self.clock.now();

        let decision = match self.consistency {
            Consistency::ReadModifyWrite => self.check_read_modify_write(&key, &rule, now).await,
            Consistency::Atomic => match self.store.check_atomic(&key, &rule, now).await {
                Ok(decision) => decision,
                Err(e) => {
                    warn!(key = %key, error = %e, "Throttle store unavailable, failing open");
                    Decision::fail_open()
                }
            },
        };

        if let Decision::Denied { retry_after_secs } = decision {
            debug!(
                key = %key,
                limit = rule.limit,
                retry_after_secs,
                "Throttle limit exceeded"
            );
        } else {
            trace!(key = %key, remaining = decision.remaining(), "Request allowed");
        }

        decision
    }

    /// Check using a category name; unknown names use the default rule.
    pub async fn check_named(&self, category: &str, client_id: &str) -> Decision {
        self.check(Category::parse_or_default(category), client_id)
            .await
    }

    async fn check_read_modify_write(
        &self,
        key: &str,
        rule: &CategoryRule,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Decision {
        let existing = match self.store.fetch(key).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!(key = %key, error = %e, "Throttle store read failed, failing open");
                return Decision::fail_open();
            }
        };

        let (decision, write) = decide(key, existing.as_ref(), rule, now);

        if let Some(write) = write {
            if matches!(write, StoreWrite::Update(ref r) if r.count == 1) {
                debug!(key = %key, "Throttle window reset");
            }
            // The verdict stands even if persisting it fails.
            if let Err(e) = self.store.apply(&write).await {
                warn!(key = %key, error = %e, "Throttle store write failed");
            }
        }

        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, ThrottleError};
    use crate::store::MemoryStore;
    use crate::throttle::clock::ManualClock;
    use crate::throttle::record::ThrottleRecord;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A store whose reads or writes can be made to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_reads: bool,
        fail_writes: bool,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl ThrottleStore for FlakyStore {
        async fn fetch(&self, key: &str) -> Result<Option<ThrottleRecord>> {
            if self.fail_reads {
                return Err(ThrottleError::Store("connection refused".to_string()));
            }
            self.inner.fetch(key).await
        }

        async fn insert(&self, record: &ThrottleRecord) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.fail_writes {
                return Err(ThrottleError::Store("read-only replica".to_string()));
            }
            self.inner.insert(record).await
        }

        async fn update(&self, record: &ThrottleRecord) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.fail_writes {
                return Err(ThrottleError::Store("read-only replica".to_string()));
            }
            self.inner.update(record).await
        }

        async fn check_atomic(
            &self,
            key: &str,
            rule: &CategoryRule,
            now: DateTime<Utc>,
        ) -> Result<Decision> {
            if self.fail_reads {
                return Err(ThrottleError::Store("connection refused".to_string()));
            }
            self.inner.check_atomic(key, rule, now).await
        }
    }

    fn throttle_with(
        store: Arc<dyn ThrottleStore>,
        consistency: Consistency,
    ) -> (RequestThrottle, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        let throttle = RequestThrottle::new(store)
            .with_clock(Arc::new(clock.clone()))
            .with_consistency(consistency);
        (throttle, clock)
    }

    fn memory_throttle(consistency: Consistency) -> (RequestThrottle, ManualClock, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let (throttle, clock) = throttle_with(store.clone(), consistency);
        (throttle, clock, store)
    }

    #[tokio::test]
    async fn test_first_request_for_every_category() {
        let (throttle, _clock, _) = memory_throttle(Consistency::ReadModifyWrite);

        for category in Category::ALL {
            let decision = throttle.check(category, "198.51.100.1").await;
            let limit = throttle.rule(category).limit;
            assert_eq!(decision, Decision::Allowed { remaining: limit - 1 });
        }
    }

    async fn run_auth_scenario(consistency: Consistency) {
        let (throttle, clock, _) = memory_throttle(consistency);
        let client = "203.0.113.7";

        for expected in (0..10).rev() {
            let decision = throttle.check(Category::Auth, client).await;
            assert_eq!(decision, Decision::Allowed { remaining: expected });
        }

        clock.advance_secs(30);
        let decision = throttle.check(Category::Auth, client).await;
        assert!(!decision.allowed());
        assert_eq!(decision.remaining(), 0);
        assert_eq!(decision.retry_after_secs(), Some(30));

        clock.advance_secs(31);
        let decision = throttle.check(Category::Auth, client).await;
        assert_eq!(decision, Decision::Allowed { remaining: 9 });
    }

    #[tokio::test]
    async fn test_auth_scenario_read_modify_write() {
        run_auth_scenario(Consistency::ReadModifyWrite).await;
    }

    #[tokio::test]
    async fn test_auth_scenario_atomic() {
        run_auth_scenario(Consistency::Atomic).await;
    }

    #[tokio::test]
    async fn test_rejection_does_not_increment_stored_count() {
        let (throttle, clock, store) = memory_throttle(Consistency::ReadModifyWrite);

        for _ in 0..10 {
            throttle.check(Category::Auth, "10.0.0.9").await;
        }
        for _ in 0..5 {
            clock.advance_secs(1);
            assert!(!throttle.check(Category::Auth, "10.0.0.9").await.allowed());
        }

        let record = store.fetch("auth:10.0.0.9").await.unwrap().unwrap();
        assert_eq!(record.count, 10);
    }

    #[tokio::test]
    async fn test_window_does_not_reset_at_exact_boundary() {
        let (throttle, clock, _) = memory_throttle(Consistency::ReadModifyWrite);

        for _ in 0..10 {
            throttle.check(Category::Auth, "c").await;
        }
        clock.advance_secs(60);
        assert!(!throttle.check(Category::Auth, "c").await.allowed());

        clock.advance(chrono::TimeDelta::milliseconds(1));
        assert!(throttle.check(Category::Auth, "c").await.allowed());
    }

    #[tokio::test]
    async fn test_independent_keys() {
        let (throttle, _clock, store) = memory_throttle(Consistency::ReadModifyWrite);

        for _ in 0..10 {
            throttle.check(Category::Auth, "10.0.0.1").await;
        }
        assert!(!throttle.check(Category::Auth, "10.0.0.1").await.allowed());

        assert_eq!(
            throttle.check(Category::Auth, "10.0.0.2").await,
            Decision::Allowed { remaining: 9 }
        );
        assert_eq!(
            throttle.check(Category::Api, "10.0.0.1").await,
            Decision::Allowed { remaining: 49 }
        );
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_category_name_uses_default_rule() {
        let (throttle, _clock, store) = memory_throttle(Consistency::ReadModifyWrite);

        let decision = throttle.check_named("bookings", "10.0.0.1").await;
        assert_eq!(decision, Decision::Allowed { remaining: 99 });
        assert!(store.fetch("default:10.0.0.1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_custom_category_table() {
        let store = Arc::new(MemoryStore::new());
        let categories = CategoryTable {
            api: CategoryRule::new(2, 5),
            ..CategoryTable::default()
        };
        let throttle = RequestThrottle::new(store).with_categories(categories);

        assert!(throttle.check(Category::Api, "x").await.allowed());
        assert!(throttle.check(Category::Api, "x").await.allowed());
        assert!(!throttle.check(Category::Api, "x").await.allowed());
    }

    #[tokio::test]
    async fn test_read_failure_fails_open() {
        for consistency in [Consistency::ReadModifyWrite, Consistency::Atomic] {
            let store = Arc::new(FlakyStore {
                fail_reads: true,
                ..FlakyStore::default()
            });
            let (throttle, _clock) = throttle_with(store.clone(), consistency);

            for _ in 0..20 {
                let decision = throttle.check(Category::Auth, "10.0.0.1").await;
                assert_eq!(decision, Decision::Allowed { remaining: 1 });
            }
            assert_eq!(store.writes.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn test_write_failure_keeps_decision() {
        let store = Arc::new(FlakyStore {
            fail_writes: true,
            ..FlakyStore::default()
        });
        let (throttle, _clock) = throttle_with(store.clone(), Consistency::ReadModifyWrite);

        let decision = throttle.check(Category::Api, "10.0.0.1").await;
        assert_eq!(decision, Decision::Allowed { remaining: 49 });
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
        assert!(store.inner.is_empty());
    }

    #[tokio::test]
    async fn test_each_allowed_request_writes_once() {
        let store = Arc::new(FlakyStore::default());
        let (throttle, _clock) = throttle_with(store.clone(), Consistency::ReadModifyWrite);

        for _ in 0..12 {
            throttle.check(Category::Auth, "10.0.0.1").await;
        }

        // 10 allowed writes, 2 rejections without a write.
        assert_eq!(store.writes.load(Ordering::SeqCst), 10);
    }
}
