use crate::errors::ProxyError;
use crate::metrics_defs::UPSTREAM_ERRORS;
use bytes::Bytes;
use http::{HeaderMap, Method, Response, Version};
use shared::counter;
use shared::http::{add_via_header, filter_hop_by_hop};
use std::time::Duration;
use tokio::time::timeout;
use url::Url;

/// Client for external proxy rules.
///
/// Redirects are handed back to the caller instead of being followed, and the
/// configured system proxy is ignored.
pub struct UpstreamClient {
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new() -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;
        Ok(UpstreamClient { client })
    }

    /// Sends a fully buffered request and buffers the response.
    ///
    /// `request_timeout` covers connecting, sending and collecting the whole
    /// response body.
    pub async fn send(
        &self,
        method: Method,
        url: Url,
        mut headers: HeaderMap,
        body: Bytes,
        version: Version,
        request_timeout: Duration,
    ) -> Result<Response<Bytes>, ProxyError> {
        let upstream = url.host_str().unwrap_or(url.as_str()).to_string();
        add_via_header(&mut headers, version);

        let request = self.client.request(method, url).headers(headers).body(body);

        let result = timeout(request_timeout, async {
            let response = request.send().await?;
            let status = response.status();
            let version = response.version();
            let headers = response.headers().clone();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, version, headers, body))
        })
        .await;

        let (status, version, headers, body) = match result {
            Err(_) => {
                counter!(UPSTREAM_ERRORS, "kind" => "timeout").increment(1);
                return Err(ProxyError::UpstreamTimeout(upstream));
            }
            Ok(Err(e)) if e.is_timeout() => {
                counter!(UPSTREAM_ERRORS, "kind" => "timeout").increment(1);
                return Err(ProxyError::UpstreamTimeout(upstream));
            }
            Ok(Err(e)) => {
                counter!(UPSTREAM_ERRORS, "kind" => "unreachable").increment(1);
                return Err(ProxyError::UpstreamUnreachable(upstream, e.to_string()));
            }
            Ok(Ok(parts)) => parts,
        };

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        filter_hop_by_hop(response.headers_mut(), version);
        add_via_header(response.headers_mut(), version);
        Ok(response)
    }
}

/// Builds the upstream URL for a request path.
///
/// The path is appended to the target's own path. The request's query wins over
/// any query on the target.
pub fn upstream_url(target: &Url, path: &str, query: Option<&str>) -> Url {
    let mut url = target.clone();
    url.set_path(&join_paths(target.path(), path));
    match query {
        Some(query) => url.set_query(Some(query)),
        None => url.set_query(target.query()),
    }
    url
}

/// `host[:port]` as it belongs in a `Host` header for `url`.
pub fn target_authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

pub fn join_paths(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    match (base.is_empty(), path.starts_with('/')) {
        (true, true) => path.to_string(),
        (true, false) => format!("/{path}"),
        (false, true) => format!("{base}{path}"),
        (false, false) => format!("{base}/{path}"),
    }
}
