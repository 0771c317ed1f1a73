//! Cookie-to-bearer auth transform.
//!
//! Rules carrying an auth transform are compiled into the edge (nginx) tier, which
//! performs the cookie lookup itself. The application only publishes the contract
//! in [`edge_bindings`] and never proxies these rules.

use crate::model::{ProxyRuleSet, RuleAction};
use cookie::Cookie;
use http::HeaderValue;
use http::header::{COOKIE, HeaderMap};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AuthTransform {
    #[serde(rename_all = "camelCase")]
    CookieToBearer { cookie_name: String },
}

impl AuthTransform {
    /// The `Authorization` value the edge tier derives from the inbound request.
    pub fn authorization(&self, headers: &HeaderMap) -> Option<HeaderValue> {
        match self {
            AuthTransform::CookieToBearer { cookie_name } => {
                compute_auth_header(headers, cookie_name)
            }
        }
    }
}

/// Every well-formed cookie across all `Cookie` headers, in request order.
pub fn cookies(headers: &HeaderMap) -> impl Iterator<Item = Cookie<'_>> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| Cookie::split_parse(value))
        .filter_map(Result::ok)
}

pub fn cookie_value(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    cookies(headers)
        .find(|cookie| cookie.name() == cookie_name)
        .map(|cookie| cookie.value_trimmed().to_string())
}

/// Looks up `cookie_name` and turns its value into `Bearer <value>`.
pub fn compute_auth_header(headers: &HeaderMap, cookie_name: &str) -> Option<HeaderValue> {
    let token = cookie_value(headers, cookie_name).filter(|v| !v.is_empty())?;
    let mut value = HeaderValue::from_str(&format!("Bearer {token}")).ok()?;
    value.set_sensitive(true);
    Some(value)
}

/// What the nginx config generator needs to render one auth-transform location.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EdgeAuthBinding {
    pub rule_set_id: String,
    pub rule_id: String,
    pub path_pattern: String,
    pub target_url: String,
    pub strip_prefix: bool,
    pub preserve_host: bool,
    pub timeout_ms: u64,
    pub auth_transform: AuthTransform,
}

/// Lists the enabled rules of a set that the edge tier is responsible for, in
/// resolution order.
pub fn edge_bindings(rule_set: &ProxyRuleSet) -> Vec<EdgeAuthBinding> {
    rule_set
        .rules()
        .iter()
        .filter(|rule| rule.is_enabled)
        .filter_map(|rule| match &rule.action {
            RuleAction::ExternalProxy(proxy) => {
                let auth_transform = proxy.auth_transform.clone()?;
                Some(EdgeAuthBinding {
                    rule_set_id: rule_set.id.clone(),
                    rule_id: rule.id.clone(),
                    path_pattern: rule.pattern.to_string(),
                    target_url: proxy.target.to_string(),
                    strip_prefix: proxy.strip_prefix,
                    preserve_host: proxy.preserve_host,
                    timeout_ms: proxy.timeout.as_millis() as u64,
                    auth_transform,
                })
            }
            _ => None,
        })
        .collect()
}
