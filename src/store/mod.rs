//! Shared store port for throttle records and its adapters.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::{RedisStore, RedisStoreConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::throttle::{CategoryRule, Decision, StoreWrite, ThrottleRecord};

/// Storage for [`ThrottleRecord`]s shared by every gateway instance.
///
/// `fetch`/`insert`/`update` back the default read-modify-write path, where
/// the decision is made in process between two round trips. `check_atomic`
/// lets a backend apply the same rule in one step.
#[async_trait]
pub trait ThrottleStore: Send + Sync {
    /// Fetch the record for `key`, if one exists.
    async fn fetch(&self, key: &str) -> Result<Option<ThrottleRecord>>;

    /// Create a record. Overwrites any record created concurrently.
    async fn insert(&self, record: &ThrottleRecord) -> Result<()>;

    /// Replace the count and window start of an existing record.
    async fn update(&self, record: &ThrottleRecord) -> Result<()>;

    /// Decide and persist in a single step.
    async fn check_atomic(
        &self,
        key: &str,
        rule: &CategoryRule,
        now: DateTime<Utc>,
    ) -> Result<Decision>;

    /// Apply a write produced by [`crate::throttle::decide`].
    async fn apply(&self, write: &StoreWrite) -> Result<()> {
        match write {
            StoreWrite::Insert(record) => self.insert(record).await,
            StoreWrite::Update(record) => self.update(record).await,
        }
    }
}
