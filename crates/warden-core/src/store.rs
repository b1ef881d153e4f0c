//! `RuleStore`: the in-memory, persisted, ordered set of rules.
//!
//! Single writer / multiple readers: mutators take the exclusive side of a
//! `parking_lot`-free `std::sync::RwLock` (no async suspension is needed —
//! the lock is only ever held across plain in-memory work), readers take the
//! shared side and clone out a snapshot before releasing it, exactly as
//! spec.md §5 requires ("readers take a shared lock and obtain a snapshot to
//! iterate outside the lock").

use crate::error::StoreError;
use crate::rule::Rule;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::warn;

pub struct RuleStore {
    path: PathBuf,
    rules: RwLock<Vec<Rule>>,
}

impl RuleStore {
    /// Load `path` if it exists and parses; otherwise fall back to
    /// [`Rule::defaults`] (spec.md §4.2: "a missing or malformed file causes
    /// fall-back to a built-in default rule set").
    pub fn load_or_default(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let rules = match Self::read_file(&path) {
            Ok(rules) => rules,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "falling back to default rules");
                Rule::defaults()
            }
        };
        Self {
            path,
            rules: RwLock::new(rules),
        }
    }

    fn read_file(path: &Path) -> Result<Vec<Rule>, StoreError> {
        let data = std::fs::read(path)?;
        let rules = serde_json::from_slice(&data)?;
        Ok(rules)
    }

    /// Atomically persist the full rule list: write to a sibling temp file,
    /// then rename over the target so readers never see a partial write.
    fn persist(&self, rules: &[Rule]) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(rules)?;
        let tmp_path = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// All rules, in storage order.
    pub fn list(&self) -> Vec<Rule> {
        self.rules.read().unwrap().clone()
    }

    /// Enabled rules, stably sorted by ascending priority (ties keep their
    /// relative storage/insertion order).
    pub fn list_enabled_sorted(&self) -> Vec<Rule> {
        let mut rules: Vec<Rule> = self
            .rules
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.enabled)
            .cloned()
            .collect();
        rules.sort_by_key(|r| r.priority);
        rules
    }

    /// Insert a new rule, assigning an id and timestamps if missing.
    pub fn add(&self, mut rule: Rule) -> Result<Rule, StoreError> {
        let mut guard = self.rules.write().unwrap();
        if rule.id.is_empty() {
            rule.id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        }
        let now = chrono::Utc::now();
        rule.created_at = now;
        rule.updated_at = now;
        guard.push(rule.clone());
        self.persist(&guard)?;
        Ok(rule)
    }

    /// Replace the rule at `id`, preserving its creation timestamp. Silent
    /// no-op if `id` is not found (spec.md §4.2).
    pub fn update(&self, id: &str, mut rule: Rule) -> Result<(), StoreError> {
        let mut guard = self.rules.write().unwrap();
        if let Some(slot) = guard.iter_mut().find(|r| r.id == id) {
            rule.id = id.to_string();
            rule.created_at = slot.created_at;
            rule.updated_at = chrono::Utc::now();
            *slot = rule;
            self.persist(&guard)?;
        }
        Ok(())
    }

    /// Remove the rule at `id`. Silent no-op if not found.
    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut guard = self.rules.write().unwrap();
        let before = guard.len();
        guard.retain(|r| r.id != id);
        if guard.len() != before {
            self.persist(&guard)?;
        }
        Ok(())
    }

    /// Overwrite the whole rule set (used by tests and by the rule-editing
    /// REST facade for bulk imports).
    pub fn replace_all(&self, rules: Vec<Rule>) -> Result<(), StoreError> {
        let mut guard = self.rules.write().unwrap();
        *guard = rules;
        self.persist(&guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{RuleKind, RuleTarget};

    fn sample(id: &str, priority: i64, enabled: bool) -> Rule {
        let now = chrono::Utc::now();
        Rule {
            id: id.to_string(),
            name: "t".to_string(),
            kind: RuleKind::UrlReplace,
            match_pattern: "a".to_string(),
            replace: "b".to_string(),
            target: RuleTarget::Request,
            priority,
            enabled,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleStore::load_or_default(dir.path().join("rules.json"));
        assert_eq!(store.list().len(), Rule::defaults().len());
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, b"not json").unwrap();
        let store = RuleStore::load_or_default(&path);
        assert_eq!(store.list().len(), Rule::defaults().len());
    }

    #[test]
    fn round_trips_through_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        let store = RuleStore::load_or_default(&path);
        store.replace_all(vec![sample("1", 1, true), sample("2", 2, false)]).unwrap();

        let reloaded = RuleStore::load_or_default(&path);
        assert_eq!(reloaded.list(), store.list());
    }

    #[test]
    fn list_enabled_sorted_is_stable_for_equal_priority() {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleStore::load_or_default(dir.path().join("rules.json"));
        store
            .replace_all(vec![
                sample("a", 1, true),
                sample("b", 1, true),
                sample("c", 0, true),
            ])
            .unwrap();

        let sorted = store.list_enabled_sorted();
        let ids: Vec<&str> = sorted.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn update_preserves_created_at_and_is_noop_for_missing_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleStore::load_or_default(dir.path().join("rules.json"));
        let added = store.add(sample("", 5, true)).unwrap();
        let original_created = added.created_at;

        store.update(&added.id, sample("ignored", 9, false)).unwrap();
        let updated = store.list().into_iter().find(|r| r.id == added.id).unwrap();
        assert_eq!(updated.created_at, original_created);
        assert_eq!(updated.priority, 9);

        // No-op for an id that doesn't exist.
        store.update("does-not-exist", sample("x", 1, true)).unwrap();
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn delete_is_silent_noop_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleStore::load_or_default(dir.path().join("rules.json"));
        store.delete("nonexistent").unwrap();
        assert_eq!(store.list().len(), Rule::defaults().len());
    }
}
