//! Captured credential-like header values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The token set is bounded at this many entries; overflow drops the oldest
/// by insertion order.
pub const MAX_TOKENS: usize = 50;

/// A single captured header value.
///
/// Identity for dedup purposes is the `(name, value)` pair: a repeat sighting
/// refreshes `timestamp` in place instead of appending a duplicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id: String,
    pub name: String,
    pub value: String,
    pub url: String,
    pub timestamp: DateTime<Utc>,
}
