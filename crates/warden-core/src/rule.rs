//! Rule data model.
//!
//! The on-disk shape (`RuleKind`/`RuleTarget` as lowercase strings) matches
//! the original proxy's JSON rules file byte-for-byte; the in-memory type is
//! a closed tagged enum rather than a bare `String`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of transformation a rule performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    UrlReplace,
    HeaderModify,
    TokenExtract,
    /// Reserved: response-body rewriting is not applied in this revision.
    BodyReplace,
}

/// Which side of the exchange a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleTarget {
    Request,
    Response,
}

/// A single rewrite/extraction rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RuleKind,
    #[serde(rename = "match")]
    pub match_pattern: String,
    #[serde(default)]
    pub replace: String,
    pub target: RuleTarget,
    pub priority: i64,
    pub enabled: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    /// The built-in rules used when no rules file exists or it fails to parse.
    pub fn defaults() -> Vec<Rule> {
        let now = Utc::now();
        vec![
            Rule {
                id: "1".to_string(),
                name: "primary host rewrite".to_string(),
                kind: RuleKind::UrlReplace,
                match_pattern: "miniapp.example.internal".to_string(),
                replace: "webapi2.example.internal".to_string(),
                target: RuleTarget::Request,
                priority: 1,
                enabled: true,
                created_at: now,
                updated_at: now,
            },
            Rule {
                id: "2".to_string(),
                name: "payment path rewrite".to_string(),
                kind: RuleKind::UrlReplace,
                match_pattern: "payment-another-info".to_string(),
                replace: "payment-info".to_string(),
                target: RuleTarget::Request,
                priority: 2,
                enabled: true,
                created_at: now,
                updated_at: now,
            },
            Rule {
                id: "3".to_string(),
                name: "extract user token".to_string(),
                kind: RuleKind::TokenExtract,
                match_pattern: "X-User-Token".to_string(),
                replace: String::new(),
                target: RuleTarget::Request,
                priority: 3,
                enabled: true,
                created_at: now,
                updated_at: now,
            },
        ]
    }
}
