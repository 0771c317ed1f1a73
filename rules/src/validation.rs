//! Write-boundary validation.
//!
//! Everything here runs before a rule is persisted. At request time the engine
//! trusts the stored configuration and does not re-run the target policy.

use crate::auth_transform::AuthTransform;
use crate::model::{EmailHandlerConfig, HeaderConfig, ProxyType, RuleRecord};
use http::HeaderName;
use http::uri::PathAndQuery;
use std::fmt;
use thiserror::Error;
use url::Url;

pub const MIN_TIMEOUT_MS: u64 = 1_000;
pub const MAX_TIMEOUT_MS: u64 = 60_000;

/// Hostname suffixes of in-cluster services that may be reached over plain http.
const CLUSTER_SUFFIXES: &[&str] = &[".svc", ".svc.cluster.local"];
const LOOPBACK_HOSTS: &[&str] = &["localhost", "127.0.0.1"];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TargetError {
    #[error("internal rewrite target must be a path starting with '/'")]
    NotAPath,
    #[error("internal rewrite target must not be a URL")]
    UrlNotAllowed,
    #[error("could not parse target URL: {0}")]
    Unparsable(#[from] url::ParseError),
    #[error("plain http is only allowed for in-cluster or loopback hosts, got {0:?}")]
    InsecureHttp(String),
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("rule id cannot be empty")]
    EmptyRuleId,
    #[error("path pattern must start with '/' or '*'")]
    InvalidPathPattern,
    #[error("invalid target: {0}")]
    InvalidTarget(#[from] TargetError),
    #[error("timeout must be between 1000 and 60000 ms, got {0}")]
    TimeoutOutOfRange(u64),
    #[error("emailHandlerConfig is required for email_form_handler rules")]
    MissingEmailConfig,
    #[error("emailHandlerConfig is only allowed on email_form_handler rules")]
    UnexpectedEmailConfig,
    #[error("invalid destination email: {0:?}")]
    InvalidDestinationEmail(String),
    #[error("authTransform is only allowed on external_proxy rules")]
    UnexpectedAuthTransform,
    #[error("authTransform cookie name cannot be empty")]
    EmptyCookieName,
    #[error("internal rewrite target is not a valid request path: {0:?}")]
    InvalidRewritePath(String),
    #[error("invalid header name: {0:?}")]
    InvalidHeaderName(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldError {
    pub field: &'static str,
    pub error: ValidationError,
}

/// Every violation found in a single rule.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationErrors {
    pub rule_id: String,
    pub errors: Vec<FieldError>,
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rule {:?} is invalid: ", self.rule_id)?;
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", e.field, e.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

impl ValidationErrors {
    pub fn fields(&self) -> Vec<&'static str> {
        self.errors.iter().map(|e| e.field).collect()
    }
}

/// Validates a rule's `targetUrl` against its type.
///
/// - email_form_handler: always valid, the field is unused.
/// - internal_rewrite (or the legacy flag): a same-deployment path, never a URL.
/// - external_proxy: https anywhere, http only towards in-cluster services or loopback.
pub fn validate_target(
    value: &str,
    proxy_type: ProxyType,
    legacy_internal_rewrite: bool,
) -> Result<(), TargetError> {
    if proxy_type == ProxyType::EmailFormHandler {
        return Ok(());
    }

    if proxy_type == ProxyType::InternalRewrite || legacy_internal_rewrite {
        if !value.starts_with('/') {
            return Err(TargetError::NotAPath);
        }
        if value.contains("://") {
            return Err(TargetError::UrlNotAllowed);
        }
        return Ok(());
    }

    let url = Url::parse(value)?;
    match url.scheme() {
        "https" => Ok(()),
        "http" => {
            let host = url.host_str().unwrap_or_default();
            if is_cluster_or_loopback(host) {
                Ok(())
            } else {
                Err(TargetError::InsecureHttp(host.to_string()))
            }
        }
        other => Err(TargetError::UnsupportedScheme(other.to_string())),
    }
}

fn is_cluster_or_loopback(host: &str) -> bool {
    LOOPBACK_HOSTS.contains(&host) || CLUSTER_SUFFIXES.iter().any(|s| host.ends_with(s))
}

pub(crate) fn check_path_pattern(pattern: &str) -> Result<(), ValidationError> {
    match pattern.starts_with('/') || pattern.starts_with('*') {
        true => Ok(()),
        false => Err(ValidationError::InvalidPathPattern),
    }
}

// The target becomes the request URI handed to the asset store, so it has to be
// something `http` will accept there.
fn check_rewrite_path(target: &str) -> Result<(), ValidationError> {
    match target.parse::<PathAndQuery>() {
        Ok(_) => Ok(()),
        Err(_) => Err(ValidationError::InvalidRewritePath(target.to_string())),
    }
}

pub(crate) fn check_timeout(timeout_ms: u64) -> Result<(), ValidationError> {
    match (MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&timeout_ms) {
        true => Ok(()),
        false => Err(ValidationError::TimeoutOutOfRange(timeout_ms)),
    }
}

fn check_email_config(config: &EmailHandlerConfig) -> Result<(), ValidationError> {
    let destination = config.destination_email.trim();
    match destination.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
        _ => Err(ValidationError::InvalidDestinationEmail(
            config.destination_email.clone(),
        )),
    }
}

fn check_header_names(config: &HeaderConfig, errors: &mut Vec<FieldError>) {
    let names = config
        .forward
        .iter()
        .map(|n| ("headerConfig.forward", n.as_str()))
        .chain(config.strip.iter().map(|n| ("headerConfig.strip", n.as_str())))
        .chain(config.add.keys().map(|n| ("headerConfig.add", n.as_str())));

    for (field, name) in names {
        if HeaderName::from_bytes(name.as_bytes()).is_err() {
            errors.push(FieldError {
                field,
                error: ValidationError::InvalidHeaderName(name.to_string()),
            });
        }
    }
}

/// Runs every write-time check on a rule and reports all violations at once.
pub fn validate_rule(record: &RuleRecord) -> Result<(), ValidationErrors> {
    let mut errors = Vec::new();
    let mut push = |field: &'static str, result: Result<(), ValidationError>| {
        if let Err(error) = result {
            errors.push(FieldError { field, error });
        }
    };

    if record.id.trim().is_empty() {
        push("id", Err(ValidationError::EmptyRuleId));
    }
    push("pathPattern", check_path_pattern(&record.path_pattern));
    let target = validate_target(
        &record.target_url,
        record.proxy_type,
        record.internal_rewrite,
    );
    let target_ok = target.is_ok();
    push("targetUrl", target.map_err(ValidationError::from));

    let proxy_type = record.effective_proxy_type();
    if target_ok && proxy_type == ProxyType::InternalRewrite {
        push("targetUrl", check_rewrite_path(&record.target_url));
    }
    match (proxy_type, &record.email_handler_config) {
        (ProxyType::EmailFormHandler, Some(config)) => {
            push("emailHandlerConfig.destinationEmail", check_email_config(config))
        }
        (ProxyType::EmailFormHandler, None) => {
            push("emailHandlerConfig", Err(ValidationError::MissingEmailConfig))
        }
        (_, Some(_)) => push(
            "emailHandlerConfig",
            Err(ValidationError::UnexpectedEmailConfig),
        ),
        (_, None) => {}
    }

    if proxy_type == ProxyType::ExternalProxy {
        push("timeoutMs", check_timeout(record.timeout_ms));
    }

    match (&record.auth_transform, proxy_type) {
        (None, _) => {}
        (Some(_), ProxyType::InternalRewrite | ProxyType::EmailFormHandler) => push(
            "authTransform",
            Err(ValidationError::UnexpectedAuthTransform),
        ),
        (Some(AuthTransform::CookieToBearer { cookie_name }), ProxyType::ExternalProxy) => {
            if cookie_name.trim().is_empty() {
                push("authTransform.cookieName", Err(ValidationError::EmptyCookieName));
            }
        }
    }

    check_header_names(&record.header_config, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationErrors {
            rule_id: record.id.clone(),
            errors,
        })
    }
}
