//! Shared error types for rule storage, rule application, and token handling.

use thiserror::Error;

/// Errors raised while persisting or loading the rule set.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read rules file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse rules file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors raised while applying a single rule.
///
/// The engine never propagates these to its caller: a bad rule is skipped
/// and counted (spec: `RuleRegexInvalid`).
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid regex in rule {id}: {source}")]
    InvalidRegex { id: String, source: regex::Error },
}
