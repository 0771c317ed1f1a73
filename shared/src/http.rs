// HTTP plumbing shared by the services: the accept loop, response helpers and the
// hop-by-hop / Via handling that applies in both directions through the proxy.

use bytes::Bytes;
use http::Version;
use http::header::{
    CONNECTION, HeaderMap, HeaderName, HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE,
    TRAILER, TRANSFER_ENCODING, UPGRADE, VIA,
};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder;
use std::sync::Arc;
use tokio::net::TcpListener;

const PROXY_NAME: &str = "sitegate";

static HOP_BY_HOP_NAMES: &[HeaderName] = &[
    CONNECTION,
    TRANSFER_ENCODING,
    TE,
    TRAILER,
    UPGRADE,
    PROXY_AUTHORIZATION,
    PROXY_AUTHENTICATE,
];

pub async fn run_http_service<S, E>(host: &str, port: u16, service: S) -> Result<(), E>
where
    S: Service<Request<Incoming>, Response = Response<BoxBody<Bytes, E>>, Error = E>
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
    E: From<std::io::Error> + std::error::Error + Send + Sync + 'static,
{
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    tracing::info!(host, port, "Listening");
    let service_arc = Arc::new(service);

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);
        let svc = service_arc.clone();

        // Hand the connection to hyper; auto-detect h1/h2 on this socket
        tokio::spawn(async move {
            if let Err(e) = Builder::new(TokioExecutor::new())
                .serve_connection(io, svc)
                .await
            {
                tracing::debug!(peer = %peer_addr, error = %e, "Connection closed with error");
            }
        });
    }
}

/// Wraps a fully buffered body into the boxed body type served by the services.
pub fn full_body<E>(bytes: Bytes) -> BoxBody<Bytes, E> {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

/// Plain-text response carrying the canonical reason phrase of `status_code`.
pub fn make_error_response(status_code: StatusCode) -> Response<Bytes> {
    let message = status_code
        .canonical_reason()
        .unwrap_or("an error occurred");

    let mut response = Response::new(Bytes::from(format!("{message}\n")));
    *response.status_mut() = status_code;
    response
}

pub fn make_boxed_error_response<E>(status_code: StatusCode) -> Response<BoxBody<Bytes, E>> {
    make_error_response(status_code).map(full_body)
}

fn via_protocol(version: Version) -> Option<&'static str> {
    match version {
        Version::HTTP_09 => Some("0.9"),
        Version::HTTP_10 => Some("1.0"),
        Version::HTTP_11 => Some("1.1"),
        Version::HTTP_2 => Some("2"),
        Version::HTTP_3 => Some("3"),
        _ => None,
    }
}

/// Records this hop in `Via`, after any intermediaries already listed.
pub fn add_via_header(headers: &mut HeaderMap, version: Version) {
    let Some(protocol) = via_protocol(version) else {
        tracing::warn!(?version, "Unknown HTTP version, skipping Via header");
        return;
    };

    let hop = format!("{protocol} {PROXY_NAME}");
    let value = match headers.get(VIA).map(HeaderValue::to_str) {
        Some(Ok(existing)) => format!("{existing}, {hop}"),
        // an unreadable Via is left alone
        Some(Err(_)) => return,
        None => hop,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(VIA, value);
    }
}

/// Drops connection-scoped headers from an HTTP/1.x message: the fixed
/// hop-by-hop set, anything named in `Connection`, and `Keep-Alive` before 1.1.
/// HTTP/2 and HTTP/3 messages carry none of these and are left untouched.
pub fn filter_hop_by_hop(headers: &mut HeaderMap, version: Version) {
    let legacy = match version {
        Version::HTTP_09 | Version::HTTP_10 => true,
        Version::HTTP_11 => false,
        _ => return,
    };

    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in HOP_BY_HOP_NAMES.iter().chain(&listed) {
        headers.remove(name);
    }
    if legacy {
        headers.remove(HeaderName::from_static("keep-alive"));
    }
}
