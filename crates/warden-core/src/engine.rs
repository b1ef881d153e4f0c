//! `RuleEngine`: applies the rule set to a single request/response exchange.
//!
//! Rule application is pure and non-suspending (spec.md §5); the only shared,
//! lockable state here is the token list, guarded by its own mutex per
//! spec.md's "TokenRecord list: guarded by the engine lock" policy.

use crate::error::RuleError;
use crate::rule::{RuleKind, RuleTarget};
use crate::store::RuleStore;
use crate::token::{TokenRecord, MAX_TOKENS};
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::warn;

pub struct RuleEngine {
    store: RuleStore,
    tokens: Mutex<Vec<TokenRecord>>,
    regex_errors: AtomicU64,
}

impl RuleEngine {
    pub fn new(store: RuleStore) -> Self {
        Self {
            store,
            tokens: Mutex::new(Vec::new()),
            regex_errors: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &RuleStore {
        &self.store
    }

    /// Count of rules skipped this process lifetime due to an invalid
    /// `regex:` pattern (surfaced via `/api/status`).
    pub fn regex_error_count(&self) -> u64 {
        self.regex_errors.load(Ordering::Relaxed)
    }

    /// Apply every enabled, request-target `url_replace` rule in priority
    /// order. A literal `match` is replaced with `str::replace` (all
    /// occurrences); a `regex:<pattern>` match is compiled and substituted
    /// with `Regex::replace_all`. The rewritten URL chains into the next
    /// rule. Returns the final URL and the ids of rules that changed it.
    pub fn apply_url(&self, url: &str) -> (String, Vec<String>) {
        let mut current = url.to_string();
        let mut applied = Vec::new();

        for rule in self.store.list_enabled_sorted() {
            if rule.kind != RuleKind::UrlReplace || rule.target != RuleTarget::Request {
                continue;
            }
            match self.apply_one_url_rule(&current, &rule.match_pattern, &rule.replace, &rule.id) {
                Ok(Some(rewritten)) if rewritten != current => {
                    current = rewritten;
                    applied.push(rule.id);
                }
                Ok(_) => {}
                Err(err) => {
                    self.regex_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %err, "skipping rule with invalid regex");
                }
            }
        }

        (current, applied)
    }

    fn apply_one_url_rule(
        &self,
        url: &str,
        pattern: &str,
        replace: &str,
        rule_id: &str,
    ) -> Result<Option<String>, RuleError> {
        if let Some(expr) = pattern.strip_prefix("regex:") {
            let re = Regex::new(expr).map_err(|source| RuleError::InvalidRegex {
                id: rule_id.to_string(),
                source,
            })?;
            if re.is_match(url) {
                Ok(Some(re.replace_all(url, replace).into_owned()))
            } else {
                Ok(None)
            }
        } else if url.contains(pattern) {
            Ok(Some(url.replace(pattern, replace)))
        } else {
            Ok(None)
        }
    }

    /// Apply every enabled, request-target `header_modify` rule: if a header
    /// named exactly `match` exists, set its value to `replace`. Rules never
    /// add a header that wasn't already present.
    pub fn apply_headers(&self, headers: &HashMap<String, String>) -> (HashMap<String, String>, Vec<String>) {
        let mut headers = headers.clone();
        let mut applied = Vec::new();

        for rule in self.store.list_enabled_sorted() {
            if rule.kind != RuleKind::HeaderModify || rule.target != RuleTarget::Request {
                continue;
            }
            if let Some(slot) = headers.get_mut(&rule.match_pattern) {
                *slot = rule.replace.clone();
                applied.push(rule.id);
            }
        }

        (headers, applied)
    }

    /// For each enabled `token_extract` rule whose `match` names a
    /// non-empty header, record (and dedup-upsert) a [`TokenRecord`].
    pub fn extract_tokens(&self, url: &str, headers: &HashMap<String, String>) -> Vec<TokenRecord> {
        let mut found = Vec::new();

        for rule in self.store.list_enabled_sorted() {
            if rule.kind != RuleKind::TokenExtract {
                continue;
            }
            if let Some(value) = headers.get(&rule.match_pattern) {
                if value.is_empty() {
                    continue;
                }
                let record = TokenRecord {
                    id: uuid::Uuid::new_v4().simple().to_string()[..8].to_string(),
                    name: rule.match_pattern.clone(),
                    value: value.clone(),
                    url: url.to_string(),
                    timestamp: chrono::Utc::now(),
                };
                self.upsert_token(record.clone());
                found.push(record);
            }
        }

        found
    }

    fn upsert_token(&self, token: TokenRecord) {
        let mut tokens = self.tokens.lock().unwrap();
        if let Some(existing) = tokens
            .iter_mut()
            .find(|t| t.name == token.name && t.value == token.value)
        {
            existing.timestamp = token.timestamp;
            return;
        }

        tokens.push(token);
        if tokens.len() > MAX_TOKENS {
            let overflow = tokens.len() - MAX_TOKENS;
            tokens.drain(0..overflow);
        }
    }

    pub fn tokens(&self) -> Vec<TokenRecord> {
        self.tokens.lock().unwrap().clone()
    }

    /// Drop tokens whose timestamp is older than `max_age`. Returns how many
    /// were removed (logged by the caller's periodic sweeper).
    pub fn cleanup_old_tokens(&self, max_age: chrono::Duration) -> usize {
        let cutoff = chrono::Utc::now() - max_age;
        let mut tokens = self.tokens.lock().unwrap();
        let before = tokens.len();
        tokens.retain(|t| t.timestamp > cutoff);
        before - tokens.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{Rule, RuleKind, RuleTarget};

    fn engine_with(rules: Vec<Rule>) -> RuleEngine {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleStore::load_or_default(dir.path().join("rules.json"));
        store.replace_all(rules).unwrap();
        // keep tempdir alive for the engine's lifetime by leaking it in tests
        std::mem::forget(dir);
        RuleEngine::new(store)
    }

    fn url_rule(id: &str, priority: i64, pattern: &str, replace: &str) -> Rule {
        let now = chrono::Utc::now();
        Rule {
            id: id.to_string(),
            name: id.to_string(),
            kind: RuleKind::UrlReplace,
            match_pattern: pattern.to_string(),
            replace: replace.to_string(),
            target: RuleTarget::Request,
            priority,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn url_rewrite_single_rule() {
        let engine = engine_with(vec![url_rule(
            "1",
            1,
            "miniapp.example.internal",
            "webapi2.example.internal",
        )]);
        let (url, applied) = engine.apply_url("https://miniapp.example.internal/v1/x");
        assert_eq!(url, "https://webapi2.example.internal/v1/x");
        assert_eq!(applied, vec!["1"]);
    }

    #[test]
    fn chained_rewrite_applies_in_priority_order() {
        let engine = engine_with(vec![
            url_rule("1", 1, "miniapp.example.internal", "webapi2.example.internal"),
            url_rule("2", 2, "payment-another-info", "payment-info"),
        ]);
        let (url, applied) = engine.apply_url(
            "https://miniapp.example.internal/api/payment-another-info?x=1",
        );
        assert_eq!(url, "https://webapi2.example.internal/api/payment-info?x=1");
        assert_eq!(applied, vec!["1", "2"]);
    }

    #[test]
    fn regex_prefix_is_honored_in_apply_url() {
        let engine = engine_with(vec![url_rule("1", 1, r"regex:v\d+", "v2")]);
        let (url, applied) = engine.apply_url("https://host/v1/x");
        assert_eq!(url, "https://host/v2/x");
        assert_eq!(applied, vec!["1"]);
    }

    #[test]
    fn invalid_regex_rule_is_skipped_and_counted() {
        let engine = engine_with(vec![url_rule("1", 1, "regex:(", "x")]);
        let (url, applied) = engine.apply_url("https://host/v1");
        assert_eq!(url, "https://host/v1");
        assert!(applied.is_empty());
        assert_eq!(engine.regex_error_count(), 1);
    }

    #[test]
    fn apply_url_is_idempotent_once_no_match_remains() {
        let engine = engine_with(vec![url_rule("1", 1, "foo", "bar")]);
        let (once, _) = engine.apply_url("https://host/foo");
        let (twice, applied_second) = engine.apply_url(&once);
        assert_eq!(once, twice);
        assert!(applied_second.is_empty());
    }

    #[test]
    fn header_modify_only_changes_existing_headers() {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleStore::load_or_default(dir.path().join("rules.json"));
        let now = chrono::Utc::now();
        store
            .replace_all(vec![Rule {
                id: "1".to_string(),
                name: "x".to_string(),
                kind: RuleKind::HeaderModify,
                match_pattern: "X-Forwarded-For".to_string(),
                replace: "1.2.3.4".to_string(),
                target: RuleTarget::Request,
                priority: 1,
                enabled: true,
                created_at: now,
                updated_at: now,
            }])
            .unwrap();
        let engine = RuleEngine::new(store);

        let mut headers = HashMap::new();
        headers.insert("X-Forwarded-For".to_string(), "9.9.9.9".to_string());
        let (new_headers, applied) = engine.apply_headers(&headers);
        assert_eq!(new_headers.get("X-Forwarded-For").unwrap(), "1.2.3.4");
        assert_eq!(applied, vec!["1"]);
        assert!(!new_headers.contains_key("X-Not-Present"));
    }

    #[test]
    fn token_extract_dedups_by_name_and_value_and_caps_at_50() {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleStore::load_or_default(dir.path().join("rules.json"));
        let now = chrono::Utc::now();
        store
            .replace_all(vec![Rule {
                id: "3".to_string(),
                name: "extract".to_string(),
                kind: RuleKind::TokenExtract,
                match_pattern: "X-User-Token".to_string(),
                replace: String::new(),
                target: RuleTarget::Request,
                priority: 1,
                enabled: true,
                created_at: now,
                updated_at: now,
            }])
            .unwrap();
        let engine = RuleEngine::new(store);

        let mut headers = HashMap::new();
        headers.insert("X-User-Token".to_string(), "abc123".to_string());

        for _ in 0..5 {
            engine.extract_tokens("https://host/api", &headers);
        }
        assert_eq!(engine.tokens().len(), 1);

        for i in 0..60 {
            let mut h = HashMap::new();
            h.insert("X-User-Token".to_string(), format!("unique-{i}"));
            engine.extract_tokens("https://host/api", &h);
        }
        assert!(engine.tokens().len() <= MAX_TOKENS);
    }

    #[test]
    fn cleanup_old_tokens_removes_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleStore::load_or_default(dir.path().join("rules.json"));
        let engine = RuleEngine::new(store);
        engine.upsert_token(TokenRecord {
            id: "x".to_string(),
            name: "n".to_string(),
            value: "v".to_string(),
            url: "u".to_string(),
            timestamp: chrono::Utc::now() - chrono::Duration::hours(48),
        });
        engine.upsert_token(TokenRecord {
            id: "y".to_string(),
            name: "n2".to_string(),
            value: "v2".to_string(),
            url: "u".to_string(),
            timestamp: chrono::Utc::now(),
        });
        let removed = engine.cleanup_old_tokens(chrono::Duration::hours(24));
        assert_eq!(removed, 1);
        assert_eq!(engine.tokens().len(), 1);
    }
}
