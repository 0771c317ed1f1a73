use crate::auth_transform::AuthTransform;
use crate::pattern::PathPattern;
use crate::validation::{self, ValidationError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;
use url::Url;

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Discriminator of the persisted rule shape.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProxyType {
    #[default]
    ExternalProxy,
    InternalRewrite,
    EmailFormHandler,
}

impl ProxyType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ProxyType::ExternalProxy => "external_proxy",
            ProxyType::InternalRewrite => "internal_rewrite",
            ProxyType::EmailFormHandler => "email_form_handler",
        }
    }
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A header value as stored at rest. Only the secret store can turn it into plaintext.
#[derive(Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct SealedValue(String);

impl SealedValue {
    pub fn new(sealed: impl Into<String>) -> Self {
        SealedValue(sealed.into())
    }

    pub fn as_sealed_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SealedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SealedValue(..)")
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct HeaderConfig {
    /// Inbound headers copied to the upstream request
    pub forward: Vec<String>,
    /// Headers removed after forwarding, wins over `forward`
    pub strip: Vec<String>,
    /// Headers set on every upstream request, values sealed at rest
    pub add: BTreeMap<String, SealedValue>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EmailHandlerConfig {
    pub destination_email: String,
    pub subject: Option<String>,
    pub success_redirect: Option<String>,
    pub cors_origin: Option<String>,
    pub honeypot_field: Option<String>,
    pub reply_to_field: Option<String>,
    #[serde(default)]
    pub require_auth: bool,
}

/// Flat shape of a rule as the persistence layer stores it.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleRecord {
    pub id: String,
    #[serde(default)]
    pub rule_set_id: String,
    pub path_pattern: String,
    #[serde(default)]
    pub proxy_type: ProxyType,
    #[serde(default)]
    pub target_url: String,
    /// Legacy flag predating `proxyType`, forces internal rewrite semantics
    #[serde(default)]
    pub internal_rewrite: bool,
    #[serde(default)]
    pub strip_prefix: bool,
    #[serde(default)]
    pub order: i32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub preserve_host: bool,
    #[serde(default)]
    pub forward_cookies: bool,
    #[serde(default)]
    pub header_config: HeaderConfig,
    #[serde(default)]
    pub auth_transform: Option<AuthTransform>,
    #[serde(default)]
    pub email_handler_config: Option<EmailHandlerConfig>,
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_enabled() -> bool {
    true
}

impl RuleRecord {
    pub fn new(
        id: impl Into<String>,
        path_pattern: impl Into<String>,
        proxy_type: ProxyType,
        target_url: impl Into<String>,
    ) -> Self {
        RuleRecord {
            id: id.into(),
            rule_set_id: String::new(),
            path_pattern: path_pattern.into(),
            proxy_type,
            target_url: target_url.into(),
            internal_rewrite: false,
            strip_prefix: false,
            order: 0,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            preserve_host: false,
            forward_cookies: false,
            header_config: HeaderConfig::default(),
            auth_transform: None,
            email_handler_config: None,
            is_enabled: true,
            description: None,
            created_at: DateTime::default(),
            updated_at: DateTime::default(),
        }
    }

    /// The type the rule behaves as once the legacy flag is taken into account.
    pub fn effective_proxy_type(&self) -> ProxyType {
        match self.proxy_type {
            ProxyType::ExternalProxy if self.internal_rewrite => ProxyType::InternalRewrite,
            other => other,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleSetRecord {
    pub id: String,
    pub project_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub rules: Vec<RuleRecord>,
}

impl RuleSetRecord {
    /// The first rule id that appears more than once in the set.
    pub fn duplicate_rule_id(&self) -> Option<&str> {
        let mut seen = HashSet::new();
        self.rules
            .iter()
            .map(|rule| rule.id.as_str())
            .find(|id| !seen.insert(*id))
    }
}

/// Raised when persisted data violates a rule invariant that the write boundary
/// should have rejected.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("rule {rule_id} is misconfigured: {reason}")]
pub struct MisconfiguredRule {
    pub rule_id: String,
    pub reason: String,
}

impl MisconfiguredRule {
    fn new(rule_id: &str, reason: impl ToString) -> Self {
        MisconfiguredRule {
            rule_id: rule_id.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExternalProxy {
    pub target: Url,
    pub strip_prefix: bool,
    pub timeout: Duration,
    pub preserve_host: bool,
    pub forward_cookies: bool,
    pub header_config: HeaderConfig,
    /// Set when the rule is compiled into the edge tier instead of proxied here
    pub auth_transform: Option<AuthTransform>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InternalRewrite {
    pub target_path: String,
    pub strip_prefix: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RuleAction {
    ExternalProxy(ExternalProxy),
    InternalRewrite(InternalRewrite),
    EmailForm(EmailHandlerConfig),
}

impl RuleAction {
    pub fn proxy_type(&self) -> ProxyType {
        match self {
            RuleAction::ExternalProxy(_) => ProxyType::ExternalProxy,
            RuleAction::InternalRewrite(_) => ProxyType::InternalRewrite,
            RuleAction::EmailForm(_) => ProxyType::EmailFormHandler,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProxyRule {
    pub id: String,
    pub rule_set_id: String,
    pub pattern: PathPattern,
    pub order: i32,
    pub is_enabled: bool,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub action: RuleAction,
}

impl ProxyRule {
    fn priority_cmp(&self, other: &ProxyRule) -> Ordering {
        self.order
            .cmp(&other.order)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.id.cmp(&other.id))
    }
}

// Builds the typed rule. This checks the shape invariants only; the target policy
// is enforced by `validate_rule` when the record is written.
impl TryFrom<RuleRecord> for ProxyRule {
    type Error = MisconfiguredRule;

    fn try_from(record: RuleRecord) -> Result<Self, Self::Error> {
        let misconfigured = |e: ValidationError| MisconfiguredRule::new(&record.id, e);
        validation::check_path_pattern(&record.path_pattern).map_err(misconfigured)?;

        let proxy_type = record.effective_proxy_type();
        if proxy_type != ProxyType::EmailFormHandler && record.email_handler_config.is_some() {
            return Err(misconfigured(ValidationError::UnexpectedEmailConfig));
        }
        if proxy_type != ProxyType::ExternalProxy && record.auth_transform.is_some() {
            return Err(misconfigured(ValidationError::UnexpectedAuthTransform));
        }

        let action = match proxy_type {
            ProxyType::ExternalProxy => {
                validation::check_timeout(record.timeout_ms).map_err(misconfigured)?;
                let target = Url::parse(&record.target_url)
                    .map_err(|e| MisconfiguredRule::new(&record.id, e))?;
                RuleAction::ExternalProxy(ExternalProxy {
                    target,
                    strip_prefix: record.strip_prefix,
                    timeout: Duration::from_millis(record.timeout_ms),
                    preserve_host: record.preserve_host,
                    forward_cookies: record.forward_cookies,
                    header_config: record.header_config,
                    auth_transform: record.auth_transform,
                })
            }
            ProxyType::InternalRewrite => {
                if !record.target_url.starts_with('/') || record.target_url.contains("://") {
                    return Err(MisconfiguredRule::new(
                        &record.id,
                        "internal rewrite target is not a path",
                    ));
                }
                RuleAction::InternalRewrite(InternalRewrite {
                    target_path: record.target_url,
                    strip_prefix: record.strip_prefix,
                })
            }
            ProxyType::EmailFormHandler => match record.email_handler_config {
                Some(config) => RuleAction::EmailForm(config),
                None => return Err(misconfigured(ValidationError::MissingEmailConfig)),
            },
        };

        Ok(ProxyRule {
            pattern: PathPattern::parse(&record.path_pattern),
            id: record.id,
            rule_set_id: record.rule_set_id,
            order: record.order,
            is_enabled: record.is_enabled,
            description: record.description,
            created_at: record.created_at,
            updated_at: record.updated_at,
            action,
        })
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ReorderError {
    #[error("rule {0} does not belong to the rule set")]
    UnknownRule(String),
    #[error("rule {0} is listed more than once")]
    DuplicateRule(String),
    #[error("reorder must list every rule in the set, missing: {0:?}")]
    MissingRules(Vec<String>),
}

/// An ordered collection of rules scoped to a project or alias.
///
/// Rules are kept sorted by `order`, then creation time, then id, which is the
/// order the resolver walks them in.
#[derive(Clone, Debug, PartialEq)]
pub struct ProxyRuleSet {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub description: Option<String>,
    pub environment: Option<String>,
    rules: Vec<ProxyRule>,
}

impl ProxyRuleSet {
    pub fn new(
        id: impl Into<String>,
        project_id: impl Into<String>,
        name: impl Into<String>,
        rules: Vec<ProxyRule>,
    ) -> Self {
        let mut rule_set = ProxyRuleSet {
            id: id.into(),
            project_id: project_id.into(),
            name: name.into(),
            description: None,
            environment: None,
            rules,
        };
        rule_set.sort();
        rule_set
    }

    pub fn rules(&self) -> &[ProxyRule] {
        &self.rules
    }

    pub fn rule(&self, rule_id: &str) -> Option<&ProxyRule> {
        self.rules.iter().find(|r| r.id == rule_id)
    }

    /// Inserts the rule, replacing any existing rule with the same id.
    pub fn upsert_rule(&mut self, rule: ProxyRule) {
        match self.rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => *existing = rule,
            None => self.rules.push(rule),
        }
        self.sort();
    }

    pub fn remove_rule(&mut self, rule_id: &str) -> Option<ProxyRule> {
        let idx = self.rules.iter().position(|r| r.id == rule_id)?;
        Some(self.rules.remove(idx))
    }

    /// Returns false if no rule has the given id.
    pub fn set_enabled(&mut self, rule_id: &str, enabled: bool) -> bool {
        match self.rules.iter_mut().find(|r| r.id == rule_id) {
            Some(rule) => {
                rule.is_enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Sets `order = index` for every rule according to `rule_ids`.
    ///
    /// The list must name every rule of the set exactly once. Nothing is changed
    /// if it does not.
    pub fn reorder<S: AsRef<str>>(&mut self, rule_ids: &[S]) -> Result<(), ReorderError> {
        let known: HashSet<&str> = self.rules.iter().map(|r| r.id.as_str()).collect();
        let mut seen = HashSet::new();

        for id in rule_ids {
            let id: &str = id.as_ref();
            if !known.contains(id) {
                return Err(ReorderError::UnknownRule(id.to_string()));
            }
            if !seen.insert(id) {
                return Err(ReorderError::DuplicateRule(id.to_string()));
            }
        }

        if seen.len() != known.len() {
            let mut missing: Vec<String> = known
                .difference(&seen)
                .map(|id| id.to_string())
                .collect();
            missing.sort();
            return Err(ReorderError::MissingRules(missing));
        }

        for (index, id) in rule_ids.iter().enumerate() {
            if let Some(rule) = self.rules.iter_mut().find(|r| r.id == id.as_ref()) {
                rule.order = index as i32;
            }
        }
        self.sort();
        Ok(())
    }

    fn sort(&mut self) {
        self.rules.sort_by(|a, b| a.priority_cmp(b));
    }
}

impl TryFrom<RuleSetRecord> for ProxyRuleSet {
    type Error = MisconfiguredRule;

    fn try_from(record: RuleSetRecord) -> Result<Self, Self::Error> {
        if let Some(rule_id) = record.duplicate_rule_id() {
            return Err(MisconfiguredRule::new(
                rule_id,
                format!("appears more than once in rule set {}", record.id),
            ));
        }

        let rules = record
            .rules
            .into_iter()
            .map(|mut rule| {
                if rule.rule_set_id.is_empty() {
                    rule.rule_set_id = record.id.clone();
                } else if rule.rule_set_id != record.id {
                    return Err(MisconfiguredRule::new(
                        &rule.id,
                        format!("belongs to rule set {}, not {}", rule.rule_set_id, record.id),
                    ));
                }
                ProxyRule::try_from(rule)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut rule_set = ProxyRuleSet::new(record.id, record.project_id, record.name, rules);
        rule_set.description = record.description;
        rule_set.environment = record.environment;
        Ok(rule_set)
    }
}
