// In-memory store of rule sets, keyed by id and by the hosts they serve.
//
// Every write validates the incoming record, builds a new `ProxyRuleSet` and swaps
// it in behind an `Arc`. Readers holding an older snapshot keep resolving against
// it until their request completes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rules::{
    MisconfiguredRule, ProxyRule, ProxyRuleSet, ReorderError, RuleRecord, RuleSetRecord,
    ValidationErrors, validate_rule,
};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("unknown rule set {0}")]
    UnknownRuleSet(String),
    #[error("rule set {rule_set_id} has no rule {rule_id}")]
    UnknownRule {
        rule_set_id: String,
        rule_id: String,
    },
    #[error("rule {rule_id} appears more than once in rule set {rule_set_id}")]
    DuplicateRule {
        rule_set_id: String,
        rule_id: String,
    },
    #[error("rule set {0} already exists")]
    DuplicateRuleSet(String),
    #[error(transparent)]
    Invalid(#[from] ValidationErrors),
    #[error(transparent)]
    Misconfigured(#[from] MisconfiguredRule),
    #[error(transparent)]
    Reorder(#[from] ReorderError),
}

/// Looks up the rule set that serves a host.
#[async_trait]
pub trait RuleSetProvider: Send + Sync {
    async fn rule_set_for_host(&self, host: &str) -> Result<Option<Arc<ProxyRuleSet>>, StoreError>;
}

#[derive(Default)]
struct Inner {
    rule_sets: HashMap<String, Arc<ProxyRuleSet>>,
    hosts: HashMap<String, String>,
}

#[derive(Default)]
pub struct RuleStore {
    inner: RwLock<Inner>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads persisted rule sets. Records are validated like any other write.
    pub fn from_records(records: Vec<RuleSetRecord>) -> Result<Self, StoreError> {
        let store = RuleStore::new();
        for record in records {
            store.insert_rule_set(record)?;
        }
        Ok(store)
    }

    pub fn insert_rule_set(&self, record: RuleSetRecord) -> Result<Arc<ProxyRuleSet>, StoreError> {
        if let Some(rule_id) = record.duplicate_rule_id() {
            return Err(StoreError::DuplicateRule {
                rule_set_id: record.id.clone(),
                rule_id: rule_id.to_string(),
            });
        }
        for rule in &record.rules {
            validate_rule(rule)?;
        }

        let now = Utc::now();
        let unset = DateTime::<Utc>::default();
        let mut record = record;
        for rule in record.rules.iter_mut() {
            if rule.created_at == unset {
                rule.created_at = now;
            }
            if rule.updated_at == unset {
                rule.updated_at = rule.created_at;
            }
        }

        let rule_set = Arc::new(ProxyRuleSet::try_from(record)?);
        let mut inner = self.inner.write();
        if inner.rule_sets.contains_key(&rule_set.id) {
            return Err(StoreError::DuplicateRuleSet(rule_set.id.clone()));
        }
        inner
            .rule_sets
            .insert(rule_set.id.clone(), rule_set.clone());
        tracing::info!(
            rule_set_id = %rule_set.id,
            rules = rule_set.rules().len(),
            "Rule set loaded"
        );
        Ok(rule_set)
    }

    /// Routes requests for `host` to the given rule set.
    pub fn map_host(&self, host: &str, rule_set_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if !inner.rule_sets.contains_key(rule_set_id) {
            return Err(StoreError::UnknownRuleSet(rule_set_id.to_string()));
        }
        inner
            .hosts
            .insert(normalize_host(host), rule_set_id.to_string());
        Ok(())
    }

    pub fn snapshot(&self, rule_set_id: &str) -> Option<Arc<ProxyRuleSet>> {
        self.inner.read().rule_sets.get(rule_set_id).cloned()
    }

    /// All rule sets, sorted by id.
    pub fn rule_sets(&self) -> Vec<Arc<ProxyRuleSet>> {
        let mut rule_sets: Vec<_> = self.inner.read().rule_sets.values().cloned().collect();
        rule_sets.sort_by(|a, b| a.id.cmp(&b.id));
        rule_sets
    }

    pub fn host_snapshot(&self, host: &str) -> Option<Arc<ProxyRuleSet>> {
        let inner = self.inner.read();
        let rule_set_id = inner.hosts.get(&normalize_host(host))?;
        inner.rule_sets.get(rule_set_id).cloned()
    }

    /// Creates or replaces a rule. The record is validated before anything changes.
    pub fn upsert_rule(&self, rule_set_id: &str, record: RuleRecord) -> Result<(), StoreError> {
        validate_rule(&record)?;

        self.update(rule_set_id, |rule_set| {
            let mut record = record;
            if record.rule_set_id.is_empty() {
                record.rule_set_id = rule_set.id.clone();
            }
            let now = Utc::now();
            record.created_at = rule_set
                .rule(&record.id)
                .map(|existing| existing.created_at)
                .unwrap_or(now);
            record.updated_at = now;

            let rule = ProxyRule::try_from(record)?;
            if rule.rule_set_id != rule_set.id {
                return Err(MisconfiguredRule {
                    rule_id: rule.id,
                    reason: format!("belongs to rule set {}", rule.rule_set_id),
                }
                .into());
            }
            tracing::info!(rule_set_id = %rule_set.id, rule_id = %rule.id, "Rule saved");
            rule_set.upsert_rule(rule);
            Ok(())
        })
    }

    pub fn set_enabled(
        &self,
        rule_set_id: &str,
        rule_id: &str,
        enabled: bool,
    ) -> Result<(), StoreError> {
        self.update(rule_set_id, |rule_set| {
            if !rule_set.set_enabled(rule_id, enabled) {
                return Err(unknown_rule(rule_set, rule_id));
            }
            tracing::info!(rule_set_id = %rule_set.id, rule_id, enabled, "Rule toggled");
            Ok(())
        })
    }

    pub fn delete_rule(&self, rule_set_id: &str, rule_id: &str) -> Result<(), StoreError> {
        self.update(rule_set_id, |rule_set| match rule_set.remove_rule(rule_id) {
            Some(_) => {
                tracing::info!(rule_set_id = %rule_set.id, rule_id, "Rule deleted");
                Ok(())
            }
            None => Err(unknown_rule(rule_set, rule_id)),
        })
    }

    /// Assigns `order = index` following `rule_ids`, which must list every rule once.
    pub fn reorder(&self, rule_set_id: &str, rule_ids: &[String]) -> Result<(), StoreError> {
        self.update(rule_set_id, |rule_set| {
            rule_set.reorder(rule_ids)?;
            tracing::info!(rule_set_id = %rule_set.id, "Rules reordered");
            Ok(())
        })
    }

    // Applies `f` to a copy of the rule set and publishes the copy if `f` succeeds.
    fn update<F>(&self, rule_set_id: &str, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut ProxyRuleSet) -> Result<(), StoreError>,
    {
        let mut inner = self.inner.write();
        let current = inner
            .rule_sets
            .get(rule_set_id)
            .ok_or_else(|| StoreError::UnknownRuleSet(rule_set_id.to_string()))?;

        let mut updated = ProxyRuleSet::clone(current);
        f(&mut updated)?;
        inner
            .rule_sets
            .insert(rule_set_id.to_string(), Arc::new(updated));
        Ok(())
    }
}

#[async_trait]
impl RuleSetProvider for RuleStore {
    async fn rule_set_for_host(&self, host: &str) -> Result<Option<Arc<ProxyRuleSet>>, StoreError> {
        Ok(self.host_snapshot(host))
    }
}

fn unknown_rule(rule_set: &ProxyRuleSet, rule_id: &str) -> StoreError {
    StoreError::UnknownRule {
        rule_set_id: rule_set.id.clone(),
        rule_id: rule_id.to_string(),
    }
}

/// Lowercases the host and drops any port.
pub fn normalize_host(host: &str) -> String {
    let name = match host.rsplit_once(':') {
        Some((name, port))
            if !port.is_empty()
                && port.chars().all(|c| c.is_ascii_digit())
                && (!name.contains(':') || name.ends_with(']')) =>
        {
            name
        }
        _ => host,
    };
    name.to_ascii_lowercase()
}
