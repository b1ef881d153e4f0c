//! `LogEvent`: the structured record streamed to every attached sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Distinguishes the four shapes a `LogEvent` can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Request,
    Response,
    Error,
    Token,
}

/// A single append-only, fire-and-forget proxy activity record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub modified: bool,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub rules_applied: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

static EVENT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_id() -> String {
    format!(
        "{}-{}",
        Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        EVENT_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

impl LogEvent {
    pub fn request(method: impl Into<String>, url: impl Into<String>, modified: bool, rules_applied: Vec<String>) -> Self {
        Self {
            id: next_id(),
            timestamp: Utc::now(),
            kind: EventKind::Request,
            method: method.into(),
            url: url.into(),
            status_code: None,
            headers: None,
            modified,
            rules_applied,
            error: None,
        }
    }

    pub fn response(method: impl Into<String>, url: impl Into<String>, status_code: u16) -> Self {
        Self {
            id: next_id(),
            timestamp: Utc::now(),
            kind: EventKind::Response,
            method: method.into(),
            url: url.into(),
            status_code: Some(status_code),
            headers: None,
            modified: false,
            rules_applied: Vec::new(),
            error: None,
        }
    }

    pub fn error(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: next_id(),
            timestamp: Utc::now(),
            kind: EventKind::Error,
            method: String::new(),
            url: url.into(),
            status_code: None,
            headers: None,
            modified: false,
            rules_applied: Vec::new(),
            error: Some(message.into()),
        }
    }

    pub fn token(name: impl Into<String>, value: impl Into<String>, url: impl Into<String>) -> Self {
        let mut headers = HashMap::new();
        headers.insert(name.into(), value.into());
        Self {
            id: next_id(),
            timestamp: Utc::now(),
            kind: EventKind::Token,
            method: String::new(),
            url: url.into(),
            status_code: None,
            headers: Some(headers),
            modified: false,
            rules_applied: Vec::new(),
            error: None,
        }
    }

    /// Render the one-line console form: `[HH:MM:SS] <type> ...`.
    pub fn to_console_line(&self) -> String {
        let ts = self.timestamp.format("%H:%M:%S");
        match self.kind {
            EventKind::Request => {
                let modified = if self.modified { " [MODIFIED]" } else { "" };
                format!("[{}] request {} {}{}", ts, self.method, self.url, modified)
            }
            EventKind::Response => {
                format!(
                    "[{}] response {} {}",
                    ts,
                    self.status_code.unwrap_or_default(),
                    self.url
                )
            }
            EventKind::Error => {
                format!(
                    "[{}] ERROR: {} - {}",
                    ts,
                    self.url,
                    self.error.as_deref().unwrap_or_default()
                )
            }
            EventKind::Token => format!("[{}] TOKEN EXTRACTED: {}", ts, self.url),
        }
    }
}
