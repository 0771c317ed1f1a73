use async_trait::async_trait;
use http::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum EmailError {
    #[error("email service request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("email service rejected the message with status {0}")]
    Rejected(StatusCode),
    #[error("no email service is configured")]
    NotConfigured,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

/// Delivers form submissions. Completion is bounded by the caller, which may drop
/// the future to cancel an in-flight send.
#[async_trait]
pub trait EmailService: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), EmailError>;
}

/// Refuses every message. Used when the deployment has no email service.
pub struct NoEmailService;

#[async_trait]
impl EmailService for NoEmailService {
    async fn send(&self, _email: &OutgoingEmail) -> Result<(), EmailError> {
        Err(EmailError::NotConfigured)
    }
}

/// Posts messages as JSON to a transactional email API.
pub struct HttpEmailService {
    client: reqwest::Client,
    url: Url,
    api_key: Option<SecretString>,
}

impl HttpEmailService {
    pub fn new(url: Url, api_key: Option<SecretString>) -> Self {
        HttpEmailService {
            client: reqwest::Client::new(),
            url,
            api_key,
        }
    }
}

#[async_trait]
impl EmailService for HttpEmailService {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), EmailError> {
        let mut request = self.client.post(self.url.clone()).json(email);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response = request.send().await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            status => Err(EmailError::Rejected(status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::start_test_server;
    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use hyper::Response;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[tokio::test]
    async fn test_http_email_service() {
        let received: Arc<Mutex<Vec<(Option<String>, serde_json::Value)>>> = Arc::default();
        let received_clone = received.clone();

        let port = start_test_server(move |req| {
            let received = received_clone.clone();
            async move {
                let auth = req
                    .headers()
                    .get(http::header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .map(String::from);
                let body = req.into_body().collect().await.unwrap().to_bytes();
                let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
                let status = match json["to"] == "reject@example.com" {
                    true => StatusCode::UNPROCESSABLE_ENTITY,
                    false => StatusCode::ACCEPTED,
                };
                received.lock().await.push((auth, json));
                let mut response = Response::new(Full::new(Bytes::new()));
                *response.status_mut() = status;
                response
            }
        })
        .await;

        let url = Url::parse(&format!("http://127.0.0.1:{port}/send")).unwrap();
        let service = HttpEmailService::new(url, Some(SecretString::from("key-123".to_string())));

        let email = OutgoingEmail {
            to: "forms@example.com".into(),
            subject: "Hello".into(),
            body: "name: Ada\n".into(),
            reply_to: None,
        };
        service.send(&email).await.unwrap();

        let rejected = OutgoingEmail {
            to: "reject@example.com".into(),
            reply_to: Some("ada@example.com".into()),
            ..email
        };
        assert!(matches!(
            service.send(&rejected).await,
            Err(EmailError::Rejected(StatusCode::UNPROCESSABLE_ENTITY))
        ));

        let received = received.lock().await;
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].0.as_deref(), Some("Bearer key-123"));
        assert_eq!(received[0].1["subject"], "Hello");
        assert!(received[0].1.get("replyTo").is_none());
        assert_eq!(received[1].1["replyTo"], "ada@example.com");
    }

    #[tokio::test]
    async fn test_no_email_service() {
        let email = OutgoingEmail {
            to: "forms@example.com".into(),
            subject: "Hello".into(),
            body: String::new(),
            reply_to: None,
        };
        assert!(matches!(
            NoEmailService.send(&email).await,
            Err(EmailError::NotConfigured)
        ));
    }
}
