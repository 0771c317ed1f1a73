use crate::email::EmailError;
use crate::rule_store::StoreError;
use crate::secrets::SecretError;
use crate::session::SessionError;
use http::{Method, StatusCode};
use rules::MisconfiguredRule;
use std::io;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to read request body: {0}")]
    RequestBody(String),
    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),
    #[error("upstream {0} timed out")]
    UpstreamTimeout(String),
    #[error("upstream {0} unreachable: {1}")]
    UpstreamUnreachable(String, String),
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("invalid URI: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),
    #[error(transparent)]
    MisconfiguredRule(#[from] MisconfiguredRule),
    #[error("rule {0} is served by the edge tier")]
    EdgeOnlyRule(String),
    #[error("rule store error: {0}")]
    RuleStore(#[from] StoreError),
    #[error("secret store error: {0}")]
    Secret(#[from] SecretError),
    #[error("authentication required")]
    AuthRequired,
    #[error("session lookup failed: {0}")]
    Session(#[from] SessionError),
    #[error("email delivery failed: {0}")]
    EmailDelivery(#[from] EmailError),
    #[error("email delivery timed out")]
    EmailTimeout,
    #[error("method {0} not allowed")]
    MethodNotAllowed(Method),
    #[error("invalid form submission: {0}")]
    InvalidForm(String),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::RequestBody(_) | ProxyError::InvalidForm(_) => StatusCode::BAD_REQUEST,
            ProxyError::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::AuthRequired => StatusCode::UNAUTHORIZED,
            ProxyError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ProxyError::UpstreamTimeout(_) | ProxyError::EmailTimeout => {
                StatusCode::GATEWAY_TIMEOUT
            }
            ProxyError::UpstreamUnreachable(..)
            | ProxyError::HttpClient(_)
            | ProxyError::EdgeOnlyRule(_)
            | ProxyError::Session(_)
            | ProxyError::EmailDelivery(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Io(_)
            | ProxyError::InvalidUri(_)
            | ProxyError::MisconfiguredRule(_)
            | ProxyError::RuleStore(_)
            | ProxyError::Secret(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Emits the error at a level matching how unexpected it is.
    pub fn log(&self, path: &str) {
        match self {
            ProxyError::MisconfiguredRule(e) => tracing::error!(
                rule_id = %e.rule_id,
                path,
                error = %e,
                "Persisted rule violates its invariants, the write-time validator was bypassed"
            ),
            ProxyError::RuleStore(_)
            | ProxyError::Secret(_)
            | ProxyError::InvalidUri(_)
            | ProxyError::Io(_) => tracing::error!(path, error = %self, "Request failed"),
            ProxyError::UpstreamTimeout(_)
            | ProxyError::UpstreamUnreachable(..)
            | ProxyError::HttpClient(_)
            | ProxyError::EdgeOnlyRule(_)
            | ProxyError::Session(_)
            | ProxyError::EmailDelivery(_)
            | ProxyError::EmailTimeout => tracing::warn!(path, error = %self, "Request failed"),
            ProxyError::RequestBody(_)
            | ProxyError::BodyTooLarge(_)
            | ProxyError::AuthRequired
            | ProxyError::MethodNotAllowed(_)
            | ProxyError::InvalidForm(_) => tracing::debug!(path, error = %self, "Request rejected"),
        }
    }
}
