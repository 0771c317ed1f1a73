use rules::{ProxyType, RuleSetRecord, ValidationErrors, validate_rule};
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;
use url::Url;

pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_EMAIL_SEND_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_ASSETS_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 5_000;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("max_body_bytes cannot be 0")]
    InvalidBodyLimit,

    #[error("Duplicate rule set id: {0}")]
    DuplicateRuleSet(String),

    #[error("Duplicate rule id {rule_id} in rule set {rule_set_id}")]
    DuplicateRule { rule_set_id: String, rule_id: String },

    #[error("Host {host} references unknown rule set {rule_set_id}")]
    UnknownRuleSet { host: String, rule_set_id: String },

    #[error(transparent)]
    InvalidRule(#[from] ValidationErrors),

    #[error("Rule {0} handles email forms but no email service is configured")]
    MissingEmailService(String),

    #[error("Rule {0} requires authentication but no session service is configured")]
    MissingSessionAuth(String),
}

/// Proxy configuration
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Main listener for site traffic
    pub listener: Listener,
    /// Admin listener for health checks and the edge contract
    pub admin_listener: Listener,
    /// Largest request body the proxy buffers
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Where requests go when no rule claims them, and where internal rewrites land
    #[serde(default)]
    pub static_assets: StaticAssetsConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    pub email: Option<EmailConfig>,
    pub session_auth: Option<SessionAuthConfig>,
    /// Persisted rule sets, in the same shape the management API stores them
    #[serde(default)]
    pub rule_sets: Vec<RuleSetRecord>,
    /// Maps a host to the rule set serving it. Aliases may point at a
    /// different rule set than the project's default domain.
    #[serde(default)]
    pub hosts: BTreeMap<String, String>,
}

impl Config {
    /// Validates the proxy configuration.
    ///
    /// Loading a config file is a write into the rule store, so every rule goes
    /// through the same validator the management API uses.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if self.max_body_bytes == 0 {
            return Err(ValidationError::InvalidBodyLimit);
        }

        let mut ids = HashSet::new();
        for rule_set in &self.rule_sets {
            if !ids.insert(rule_set.id.as_str()) {
                return Err(ValidationError::DuplicateRuleSet(rule_set.id.clone()));
            }
            if let Some(rule_id) = rule_set.duplicate_rule_id() {
                return Err(ValidationError::DuplicateRule {
                    rule_set_id: rule_set.id.clone(),
                    rule_id: rule_id.to_string(),
                });
            }

            for rule in &rule_set.rules {
                validate_rule(rule)?;

                if let (ProxyType::EmailFormHandler, Some(email)) =
                    (rule.effective_proxy_type(), &rule.email_handler_config)
                {
                    if self.email.is_none() {
                        return Err(ValidationError::MissingEmailService(rule.id.clone()));
                    }
                    if email.require_auth && self.session_auth.is_none() {
                        return Err(ValidationError::MissingSessionAuth(rule.id.clone()));
                    }
                }
            }
        }

        for (host, rule_set_id) in &self.hosts {
            if !ids.contains(rule_set_id.as_str()) {
                return Err(ValidationError::UnknownRuleSet {
                    host: host.clone(),
                    rule_set_id: rule_set_id.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StaticAssetsConfig {
    /// Forward to the deployment's asset origin
    Upstream {
        url: Url,
        #[serde(default = "default_assets_timeout_ms")]
        timeout_ms: u64,
    },
    #[default]
    NotFound,
}

/// How sealed `headerConfig.add` values are revealed.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SecretsConfig {
    /// Values are `env:VARIABLE` references
    #[default]
    Env,
    /// Values are stored as plaintext. Development only.
    Plaintext,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EmailConfig {
    pub url: Url,
    pub api_key: Option<SecretString>,
    #[serde(default = "default_email_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SessionAuthConfig {
    pub url: Url,
    #[serde(default = "default_session_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

fn default_assets_timeout_ms() -> u64 {
    DEFAULT_ASSETS_TIMEOUT_MS
}

fn default_email_send_timeout_ms() -> u64 {
    DEFAULT_EMAIL_SEND_TIMEOUT_MS
}

fn default_session_timeout_ms() -> u64 {
    DEFAULT_SESSION_TIMEOUT_MS
}

#[cfg(test)]
mod tests {
    use super::*;
    use rules::RuleRecord;
    use secrecy::ExposeSecret;

    const BASE: &str = r#"
listener:
  host: 0.0.0.0
  port: 3000
admin_listener:
  host: 127.0.0.1
  port: 3001
"#;

    fn parse(extra: &str) -> Config {
        serde_yaml::from_str(&format!("{BASE}{extra}")).unwrap()
    }

    #[test]
    fn test_minimal_config() {
        let config = parse("");
        assert_eq!(config.max_body_bytes, DEFAULT_MAX_BODY_BYTES);
        assert_eq!(config.static_assets, StaticAssetsConfig::NotFound);
        assert_eq!(config.secrets, SecretsConfig::Env);
        assert!(config.rule_sets.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_config() {
        let config = parse(
            r#"
static_assets:
  type: upstream
  url: http://assets.default.svc:8080
secrets:
  type: plaintext
email:
  url: https://mail.example.com/send
  api_key: key-123
session_auth:
  url: https://app.example.com/api/whoami
  timeout_ms: 2000
hosts:
  site.example.com: rs1
  alias.example.org: rs2
rule_sets:
  - id: rs1
    projectId: p1
    name: main
    rules:
      - id: api
        pathPattern: /api/*
        proxyType: external_proxy
        targetUrl: https://api.example.com
        stripPrefix: true
        headerConfig:
          forward: [x-trace]
          add:
            x-api-key: key
      - id: contact
        pathPattern: /contact
        proxyType: email_form_handler
        order: 1
        emailHandlerConfig:
          destinationEmail: forms@example.com
          honeypotField: website
          requireAuth: true
  - id: rs2
    projectId: p1
    name: alias
"#,
        );

        assert!(config.validate().is_ok());
        assert_eq!(
            config.static_assets,
            StaticAssetsConfig::Upstream {
                url: Url::parse("http://assets.default.svc:8080").unwrap(),
                timeout_ms: DEFAULT_ASSETS_TIMEOUT_MS,
            }
        );
        let email = config.email.as_ref().unwrap();
        assert_eq!(email.api_key.as_ref().unwrap().expose_secret(), "key-123");
        assert_eq!(email.send_timeout_ms, DEFAULT_EMAIL_SEND_TIMEOUT_MS);
        assert_eq!(config.session_auth.as_ref().unwrap().timeout_ms, 2000);

        let rules = &config.rule_sets[0].rules;
        assert_eq!(rules[0].header_config.forward, vec!["x-trace"]);
        assert_eq!(rules[1].effective_proxy_type(), ProxyType::EmailFormHandler);
        assert!(
            rules[1]
                .email_handler_config
                .as_ref()
                .is_some_and(|c| c.require_auth)
        );
    }

    #[test]
    fn test_invalid_configs() {
        let mut config = parse("hosts:\n  site.example.com: missing\n");
        assert!(matches!(
            config.validate(),
            Err(ValidationError::UnknownRuleSet { .. })
        ));

        config.hosts.clear();
        let mut rule_set = RuleSetRecord {
            id: "rs1".into(),
            project_id: "p1".into(),
            name: "main".into(),
            description: None,
            environment: None,
            rules: vec![RuleRecord::new(
                "bad",
                "/api/*",
                ProxyType::ExternalProxy,
                "http://evil.com",
            )],
        };
        config.rule_sets = vec![rule_set.clone()];
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidRule(_))
        ));

        rule_set.rules = vec![
            RuleRecord::new("r1", "/a", ProxyType::InternalRewrite, "/a.html"),
            RuleRecord::new("r1", "/b", ProxyType::InternalRewrite, "/b.html"),
        ];
        config.rule_sets = vec![rule_set.clone()];
        assert!(matches!(
            config.validate(),
            Err(ValidationError::DuplicateRule { ref rule_id, .. }) if rule_id == "r1"
        ));

        rule_set.rules.clear();
        config.rule_sets = vec![rule_set.clone(), rule_set];
        assert!(matches!(
            config.validate(),
            Err(ValidationError::DuplicateRuleSet(_))
        ));

        config.rule_sets.clear();
        config.admin_listener.port = 0;
        assert!(matches!(config.validate(), Err(ValidationError::InvalidPort)));
    }

    #[test]
    fn test_email_rules_need_services() {
        let config = parse(
            r#"
rule_sets:
  - id: rs1
    projectId: p1
    name: main
    rules:
      - id: contact
        pathPattern: /contact
        proxyType: email_form_handler
        emailHandlerConfig:
          destinationEmail: forms@example.com
"#,
        );
        assert!(matches!(
            config.validate(),
            Err(ValidationError::MissingEmailService(ref id)) if id == "contact"
        ));
    }
}
