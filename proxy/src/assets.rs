// Serves same-deployment content for internal rewrites and for requests no rule
// claims.

use crate::errors::ProxyError;
use crate::upstream::{UpstreamClient, upstream_url};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::HOST;
use hyper::{Request, Response, StatusCode};
use shared::http::{filter_hop_by_hop, make_error_response};
use std::time::Duration;
use url::Url;

#[async_trait]
pub trait StaticAssets: Send + Sync {
    async fn serve(&self, request: Request<Bytes>) -> Result<Response<Bytes>, ProxyError>;
}

/// Fetches assets from the deployment's origin, forwarding the request as is.
pub struct UpstreamAssets {
    client: UpstreamClient,
    origin: Url,
    timeout: Duration,
}

impl UpstreamAssets {
    pub fn new(origin: Url, timeout: Duration) -> Result<Self, ProxyError> {
        Ok(UpstreamAssets {
            client: UpstreamClient::new()?,
            origin,
            timeout,
        })
    }
}

#[async_trait]
impl StaticAssets for UpstreamAssets {
    async fn serve(&self, request: Request<Bytes>) -> Result<Response<Bytes>, ProxyError> {
        let (mut parts, body) = request.into_parts();
        let url = upstream_url(&self.origin, parts.uri.path(), parts.uri.query());

        filter_hop_by_hop(&mut parts.headers, parts.version);
        parts.headers.remove(HOST);

        self.client
            .send(
                parts.method,
                url,
                parts.headers,
                body,
                parts.version,
                self.timeout,
            )
            .await
    }
}

/// Answers every asset request with 404.
pub struct NotFoundAssets;

#[async_trait]
impl StaticAssets for NotFoundAssets {
    async fn serve(&self, _request: Request<Bytes>) -> Result<Response<Bytes>, ProxyError> {
        Ok(make_error_response(StatusCode::NOT_FOUND))
    }
}
