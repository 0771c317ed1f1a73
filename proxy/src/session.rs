use async_trait::async_trait;
use http::StatusCode;
use http::header::{AUTHORIZATION, COOKIE, HeaderMap};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("session service request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("session service returned unexpected status {0}")]
    UnexpectedStatus(StatusCode),
}

/// The authenticated user behind a request.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct UserIdentity {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl fmt::Display for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.name, &self.email) {
            (Some(name), Some(email)) => write!(f, "{name} <{email}> (id {})", self.id),
            (None, Some(email)) => write!(f, "{email} (id {})", self.id),
            (Some(name), None) => write!(f, "{name} (id {})", self.id),
            (None, None) => write!(f, "id {}", self.id),
        }
    }
}

#[async_trait]
pub trait SessionAuth: Send + Sync {
    /// Returns `None` for anonymous requests.
    async fn current_user(&self, headers: &HeaderMap) -> Result<Option<UserIdentity>, SessionError>;
}

/// Treats every request as anonymous.
pub struct NoSessionAuth;

#[async_trait]
impl SessionAuth for NoSessionAuth {
    async fn current_user(&self, _headers: &HeaderMap) -> Result<Option<UserIdentity>, SessionError> {
        Ok(None)
    }
}

/// Asks the session service who the caller is, passing along their credentials.
pub struct HttpSessionAuth {
    client: reqwest::Client,
    url: Url,
}

impl HttpSessionAuth {
    pub fn new(url: Url, timeout: Duration) -> Result<Self, SessionError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpSessionAuth { client, url })
    }
}

#[async_trait]
impl SessionAuth for HttpSessionAuth {
    async fn current_user(&self, headers: &HeaderMap) -> Result<Option<UserIdentity>, SessionError> {
        if !headers.contains_key(COOKIE) && !headers.contains_key(AUTHORIZATION) {
            return Ok(None);
        }

        let mut request = self.client.get(self.url.clone());
        for name in [COOKIE, AUTHORIZATION] {
            for value in headers.get_all(&name) {
                request = request.header(&name, value);
            }
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::OK => Ok(Some(response.json::<UserIdentity>().await?)),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(None),
            other => Err(SessionError::UnexpectedStatus(other)),
        }
    }
}
