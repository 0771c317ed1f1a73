// Terminal handler for email form rules. Submissions are turned into an email and
// delivered before the response is sent; nothing is proxied.

use crate::email::{EmailService, OutgoingEmail};
use crate::errors::ProxyError;
use crate::metrics_defs::{EMAIL_FORM_SENT, EMAIL_FORM_SPAM_SUPPRESSED};
use crate::session::SessionAuth;
use bytes::Bytes;
use http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_MAX_AGE, ALLOW, CONTENT_TYPE, HeaderValue, LOCATION, VARY,
};
use hyper::{Method, Request, Response, StatusCode};
use indexmap::IndexMap;
use rules::EmailHandlerConfig;
use serde_json::json;
use shared::counter;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_SUBJECT: &str = "Form Submission";
const ALLOWED_METHODS: &str = "POST, OPTIONS";

pub struct EmailFormHandler {
    email: Arc<dyn EmailService>,
    sessions: Arc<dyn SessionAuth>,
    send_timeout: Duration,
}

impl EmailFormHandler {
    pub fn new(
        email: Arc<dyn EmailService>,
        sessions: Arc<dyn SessionAuth>,
        send_timeout: Duration,
    ) -> Self {
        EmailFormHandler {
            email,
            sessions,
            send_timeout,
        }
    }

    /// Handles any request routed to a form endpoint. Failures are answered with a
    /// JSON error body so browser scripts can read them.
    pub async fn handle(&self, config: &EmailHandlerConfig, request: &Request<Bytes>) -> Response<Bytes> {
        let method = request.method();
        let mut response = if method == Method::OPTIONS {
            preflight_response()
        } else if method == Method::POST {
            match self.submit(config, request).await {
                Ok(response) => response,
                Err(e) => {
                    e.log(request.uri().path());
                    error_response(&e)
                }
            }
        } else {
            let e = ProxyError::MethodNotAllowed(method.clone());
            e.log(request.uri().path());
            let mut response = error_response(&e);
            response
                .headers_mut()
                .insert(ALLOW, HeaderValue::from_static(ALLOWED_METHODS));
            response
        };

        if let Some(origin) = &config.cors_origin {
            match HeaderValue::from_str(origin) {
                Ok(origin) => {
                    let headers = response.headers_mut();
                    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
                    headers.insert(VARY, HeaderValue::from_static("Origin"));
                }
                Err(_) => tracing::warn!(origin, "Ignoring invalid CORS origin"),
            }
        }
        response
    }

    async fn submit(
        &self,
        config: &EmailHandlerConfig,
        request: &Request<Bytes>,
    ) -> Result<Response<Bytes>, ProxyError> {
        let fields = parse_form(request)?;

        if let Some(honeypot) = &config.honeypot_field {
            if fields
                .iter()
                .any(|(name, value)| name == honeypot && !value.is_empty())
            {
                tracing::info!(path = request.uri().path(), "Dropping form submission with honeypot filled");
                counter!(EMAIL_FORM_SPAM_SUPPRESSED).increment(1);
                return Ok(success_response(config));
            }
        }

        let user = match config.require_auth {
            true => Some(
                self.sessions
                    .current_user(request.headers())
                    .await?
                    .ok_or(ProxyError::AuthRequired)?,
            ),
            false => None,
        };

        let reply_to = config
            .reply_to_field
            .as_ref()
            .and_then(|field| fields.iter().find(|(name, _)| name == field))
            .map(|(_, value)| value.trim())
            .filter(|value| looks_like_email(value))
            .map(String::from);

        let mut body: String = fields
            .iter()
            .filter(|(name, _)| config.honeypot_field.as_ref() != Some(name))
            .map(|(name, value)| format!("{name}: {value}\n"))
            .collect();
        if let Some(user) = &user {
            body.push_str(&format!("\nSubmitted by: {user}\n"));
        }

        let email = OutgoingEmail {
            to: config.destination_email.clone(),
            subject: config
                .subject
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_SUBJECT.to_string()),
            body,
            reply_to,
        };

        tokio::time::timeout(self.send_timeout, self.email.send(&email))
            .await
            .map_err(|_| ProxyError::EmailTimeout)??;

        counter!(EMAIL_FORM_SENT).increment(1);
        tracing::debug!(to = %email.to, fields = fields.len(), "Form submission sent");
        Ok(success_response(config))
    }
}

/// Reads the submitted fields in the order they were sent, repeated names
/// included. JSON bodies must be an object; other values are rendered as JSON text.
fn parse_form(request: &Request<Bytes>) -> Result<Vec<(String, String)>, ProxyError> {
    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or_default().trim().to_ascii_lowercase())
        .unwrap_or_default();

    match content_type.as_str() {
        "application/json" => {
            let object: IndexMap<String, serde_json::Value> =
                serde_json::from_slice(request.body())
                    .map_err(|e| ProxyError::InvalidForm(e.to_string()))?;
            Ok(object
                .into_iter()
                .map(|(name, value)| match value {
                    serde_json::Value::String(s) => (name, s),
                    serde_json::Value::Null => (name, String::new()),
                    other => (name, other.to_string()),
                })
                .collect())
        }
        "application/x-www-form-urlencoded" | "" => Ok(url::form_urlencoded::parse(request.body())
            .into_owned()
            .collect()),
        other => Err(ProxyError::InvalidForm(format!(
            "unsupported content type {other}"
        ))),
    }
}

fn looks_like_email(value: &str) -> bool {
    match value.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !value.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

fn success_response(config: &EmailHandlerConfig) -> Response<Bytes> {
    if let Some(location) = config
        .success_redirect
        .as_deref()
        .and_then(|l| HeaderValue::from_str(l).ok())
    {
        let mut response = Response::new(Bytes::new());
        *response.status_mut() = StatusCode::SEE_OTHER;
        response.headers_mut().insert(LOCATION, location);
        return response;
    }
    json_response(StatusCode::OK, json!({ "success": true }))
}

fn error_response(error: &ProxyError) -> Response<Bytes> {
    let status = error.status_code();
    let message = match status.is_client_error() {
        true => error.to_string(),
        false => status.canonical_reason().unwrap_or("error").to_string(),
    };
    json_response(status, json!({ "success": false, "error": message }))
}

fn preflight_response() -> Response<Bytes> {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = StatusCode::NO_CONTENT;
    let headers = response.headers_mut();
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOWED_METHODS),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
    response
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
