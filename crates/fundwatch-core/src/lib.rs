//! Core domain model shared by the fundwatch crates.

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "fundwatch-core";

/// Items pulled from one source per run unless configured otherwise.
pub const DEFAULT_RUN_CAP: i64 = 20;

/// Number of most recent ids kept in a persisted seen-set.
pub const DEFAULT_RETENTION: usize = 100;

/// Normalized listing record handed from adapters to the dispatch engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Item {
    /// Stable and unique within its source.
    pub id: String,
    pub title: String,
    /// Usually carries the detail-page URL so a notification is self-contained.
    pub description: String,
}

impl Item {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
        }
    }
}

/// Per-invocation limit on how many items are examined from a source.
///
/// Built from a signed value so configuration can say `0` or `-1` for "no limit".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub struct RunCap(Option<usize>);

impl RunCap {
    pub const UNBOUNDED: Self = Self(None);

    pub fn from_raw(raw: i64) -> Self {
        if raw <= 0 {
            Self(None)
        } else {
            Self(Some(usize::try_from(raw).unwrap_or(usize::MAX)))
        }
    }

    pub fn limit(self) -> Option<usize> {
        self.0
    }

    pub fn is_reached(self, examined: usize) -> bool {
        matches!(self.0, Some(limit) if examined >= limit)
    }
}

impl Default for RunCap {
    fn default() -> Self {
        Self::from_raw(DEFAULT_RUN_CAP)
    }
}

impl From<i64> for RunCap {
    fn from(raw: i64) -> Self {
        Self::from_raw(raw)
    }
}

impl From<RunCap> for i64 {
    fn from(cap: RunCap) -> Self {
        cap.0
            .map(|limit| i64::try_from(limit).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}

/// Lowercase ASCII alphanumeric form of a name, used to derive state file names.
pub fn sanitize_state_key(input: &str) -> String {
    input
        .trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Notification title for an item: `"<display name>: <item title>"`.
pub fn notification_title(display_name: &str, item: &Item) -> String {
    format!("{}: {}", display_name, item.title)
}
