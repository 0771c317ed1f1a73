use crate::assets::StaticAssets;
use crate::email::{EmailError, EmailService, OutgoingEmail};
use crate::errors::ProxyError;
use crate::session::{SessionAuth, SessionError, UserIdentity};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::HeaderMap;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use rules::auth_transform::cookie_value;
use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpListener;

/// Starts a loopback server answering every request with `handler` and returns its port.
pub async fn start_test_server<F, Fut>(handler: F) -> u16
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind to address");
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let io = TokioIo::new(stream);
            let handler = handler.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let fut = handler(req);
                    async move { Ok::<_, Infallible>(fut.await) }
                });
                if let Err(err) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await
                {
                    eprintln!("Error serving connection: {:?}", err);
                }
            });
        }
    });

    port
}

/// Upstream that echoes the request back: body as body, request headers as
/// response headers, and the request path and query in `x-echo-uri`.
pub async fn start_echo_server() -> u16 {
    start_test_server(|req: Request<Incoming>| async move {
        let (parts, body) = req.into_parts();
        let body_bytes = body
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .unwrap_or_else(|_| Bytes::new());

        let mut response = Response::new(Full::new(body_bytes));
        *response.headers_mut() = parts.headers;
        let uri = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_default();
        response
            .headers_mut()
            .insert("x-echo-uri", uri.parse().unwrap());
        response
    })
    .await
}

/// Upstream that answers only after `delay`.
pub async fn start_slow_server(delay: Duration) -> u16 {
    start_test_server(move |_req| async move {
        tokio::time::sleep(delay).await;
        Response::new(Full::new(Bytes::from("late")))
    })
    .await
}

#[derive(Default)]
pub struct RecordingEmailService {
    pub sent: Mutex<Vec<OutgoingEmail>>,
    pub delay: Option<Duration>,
}

#[async_trait]
impl EmailService for RecordingEmailService {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), EmailError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.sent.lock().push(email.clone());
        Ok(())
    }
}

/// Authenticates requests carrying `Cookie: session=<user id>`.
pub struct CookieSessions;

#[async_trait]
impl SessionAuth for CookieSessions {
    async fn current_user(&self, headers: &HeaderMap) -> Result<Option<UserIdentity>, SessionError> {
        let user = cookie_value(headers, "session").map(|id| UserIdentity {
            email: Some(format!("{id}@example.com")),
            id,
            name: None,
        });
        Ok(user)
    }
}

/// Asset store that records the path and query it was asked for.
#[derive(Default)]
pub struct RecordingAssets {
    pub served: Mutex<Vec<String>>,
}

#[async_trait]
impl StaticAssets for RecordingAssets {
    async fn serve(&self, request: Request<Bytes>) -> Result<Response<Bytes>, ProxyError> {
        let uri = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_default();
        self.served.lock().push(uri.clone());
        Ok(Response::new(Bytes::from(format!("asset {uri}"))))
    }
}
