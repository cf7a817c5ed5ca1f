//! Throttle keys and the persisted per-key window record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::category::Category;

/// A key that uniquely identifies one client within one category.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThrottleKey {
    /// The category whose rule applies
    pub category: Category,
    /// Client identifier, usually the forwarded address
    pub client_id: String,
}

impl ThrottleKey {
    pub fn new(category: Category, client_id: impl Into<String>) -> Self {
        Self {
            category,
            client_id: client_id.into(),
        }
    }

    /// The composite store key, e.g. `auth:203.0.113.7`.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}", self.category, self.client_id)
    }
}

impl std::fmt::Display for ThrottleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

/// Counter state for one key in the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleRecord {
    pub key: String,
    /// Requests counted in the current window
    pub count: u64,
    /// When the current window started
    pub window_start: DateTime<Utc>,
}

impl ThrottleRecord {
    /// A record for the first request of a new window.
    pub fn fresh(key: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            count: 1,
            window_start: now,
        }
    }
}
