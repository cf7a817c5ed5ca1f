//! In-process store backed by a sharded concurrent map.
//!
//! Only shared within one gateway process. Useful for single-instance
//! deployments and tests.
//!
//! With a retention set, every `SWEEP_INTERVAL` new windows the store drops
//! records whose window ended more than the retention ago. A dropped record
//! behaves exactly like an expired one: the next request starts a new window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::ThrottleStore;
use crate::error::Result;
use crate::throttle::{decide, CategoryRule, Decision, StoreWrite, ThrottleRecord};

/// New windows opened between expiry sweeps.
const SWEEP_INTERVAL: u64 = 1024;

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, ThrottleRecord>,
    retention: Option<TimeDelta>,
    windows_opened: AtomicU64,
}

impl MemoryStore {
    /// A store that keeps every record.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that sweeps records older than `retention`.
    ///
    /// `retention` must be at least the longest category window, see
    /// `CategoryTable::max_window`.
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            retention: Some(TimeDelta::from_std(retention).unwrap_or(TimeDelta::MAX)),
            ..Self::default()
        }
    }

    /// Remove records whose window started more than the retention before
    /// `now`. Returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let Some(retention) = self.retention else {
            return 0;
        };

        let mut removed = 0;
        self.records.retain(|_, record| {
            let keep = now.signed_duration_since(record.window_start) <= retention;
            if !keep {
                removed += 1;
            }
            keep
        });

        if removed > 0 {
            debug!(removed, remaining = self.records.len(), "Swept expired throttle records");
        }
        removed
    }

    fn window_opened(&self, now: DateTime<Utc>) {
        let opened = self.windows_opened.fetch_add(1, Ordering::Relaxed) + 1;
        if opened % SWEEP_INTERVAL == 0 {
            self.purge_expired(now);
        }
    }

    /// Get the number of stored records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

}

#[async_trait]
impl ThrottleStore for MemoryStore {
    async fn fetch(&self, key: &str) -> Result<Option<ThrottleRecord>> {
        Ok(self.records.get(key).map(|entry| entry.value().clone()))
    }

    async fn insert(&self, record: &ThrottleRecord) -> Result<()> {
        self.records.insert(record.key.clone(), record.clone());
        self.window_opened(record.window_start);
        Ok(())
    }

    async fn update(&self, record: &ThrottleRecord) -> Result<()> {
        self.records.insert(record.key.clone(), record.clone());
        Ok(())
    }

    async fn check_atomic(
        &self,
        key: &str,
        rule: &CategoryRule,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let (decision, write) = {
            // The entry guard holds the shard lock across read, decide and write.
            let entry = self.records.entry(key.to_string());
            let existing = match &entry {
                Entry::Occupied(occupied) => Some(occupied.get().clone()),
                Entry::Vacant(_) => None,
            };

            let (decision, write) = decide(key, existing.as_ref(), rule, now);
            if let Some(write) = &write {
                trace!(key = %key, count = write.record().count, "Atomic throttle write");
                entry.insert(write.record().clone());
            }
            (decision, write)
        };

        // Sweep after the shard lock is released; `retain` locks every shard.
        if matches!(write, Some(StoreWrite::Insert(_))) {
            self.window_opened(now);
        }

        Ok(decision)
    }
}
