//! Limit categories and their fixed-window rules.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::warn;

/// A named class of routes sharing one rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Fallback limit for anything not covered by a more specific category
    Default,
    /// Authentication endpoints (`/api/auth/*`)
    Auth,
    /// General API endpoints (`/api/*`)
    Api,
}

impl Category {
    /// All known categories.
    pub const ALL: [Category; 3] = [Category::Default, Category::Auth, Category::Api];

    /// Parse a category name, returning `None` for unknown names.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "default" => Some(Category::Default),
            "auth" => Some(Category::Auth),
            "api" => Some(Category::Api),
            _ => None,
        }
    }

    /// Parse a category name, falling back to [`Category::Default`].
    ///
    /// Unknown names are not an error; they are throttled under the default rule.
    pub fn parse_or_default(name: &str) -> Self {
        Self::parse(name).unwrap_or_else(|| {
            warn!(category = %name, "Unknown throttle category, using default");
            Category::Default
        })
    }

    /// The name used in store keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Default => "default",
            Category::Auth => "auth",
            Category::Api => "api",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maximum request count per fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRule {
    /// Requests allowed per window
    pub limit: u64,
    /// Window length in seconds
    pub window_secs: u64,
}

impl CategoryRule {
    pub const fn new(limit: u64, window_secs: u64) -> Self {
        Self { limit, window_secs }
    }

    /// Get the duration of the window.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Per-category rules, defaulting to the marketplace's static table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryTable {
    #[serde(default = "default_rule")]
    pub default: CategoryRule,

    #[serde(default = "auth_rule")]
    pub auth: CategoryRule,

    #[serde(default = "api_rule")]
    pub api: CategoryRule,
}

impl Default for CategoryTable {
    fn default() -> Self {
        Self {
            default: default_rule(),
            auth: auth_rule(),
            api: api_rule(),
        }
    }
}

impl CategoryTable {
    /// Look up the rule for a category.
    pub fn rule(&self, category: Category) -> CategoryRule {
        match category {
            Category::Default => self.default,
            Category::Auth => self.auth,
            Category::Api => self.api,
        }
    }

    /// Longest window across all categories. A record older than this has
    /// expired whatever its category.
    pub fn max_window(&self) -> Duration {
        Category::ALL
            .iter()
            .map(|category| self.rule(*category).window())
            .max()
            .unwrap_or_default()
    }
}

fn default_rule() -> CategoryRule {
    CategoryRule::new(100, 60)
}

fn auth_rule() -> CategoryRule {
    CategoryRule::new(10, 60)
}

fn api_rule() -> CategoryRule {
    CategoryRule::new(50, 60)
}
