use crate::errors::ProxyError;
use crate::metrics_defs::{REQUEST_DURATION, REQUESTS_INFLIGHT};
use crate::pipeline::Pipeline;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use hyper::service::Service as HyperService;
use hyper::{Request, Response};
use shared::http::{full_body, make_error_response};
use shared::{gauge, histogram};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

pub struct ProxyService {
    pipeline: Arc<Pipeline>,
    max_body_bytes: usize,
}

impl ProxyService {
    pub fn new(pipeline: Arc<Pipeline>, max_body_bytes: usize) -> Self {
        Self {
            pipeline,
            max_body_bytes,
        }
    }
}

impl HyperService<Request<Incoming>> for ProxyService {
    type Response = Response<BoxBody<Bytes, ProxyError>>;
    type Error = ProxyError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, request: Request<Incoming>) -> Self::Future {
        let pipeline = self.pipeline.clone();
        let max_body_bytes = self.max_body_bytes;

        Box::pin(async move {
            let start = Instant::now();
            gauge!(REQUESTS_INFLIGHT).increment(1.0);

            let path = request.uri().path().to_string();
            let result = match read_request(request, max_body_bytes).await {
                Ok(request) => pipeline.handle(request).await,
                Err(e) => Err(e),
            };
            let response = result.unwrap_or_else(|e| {
                e.log(&path);
                make_error_response(e.status_code())
            });

            gauge!(REQUESTS_INFLIGHT).decrement(1.0);
            histogram!(REQUEST_DURATION, "status" => response.status().as_str().to_string())
                .record(start.elapsed().as_secs_f64());

            Ok(response.map(full_body))
        })
    }
}

/// Buffers the request body, refusing anything larger than `limit` bytes.
async fn read_request<B>(request: Request<B>, limit: usize) -> Result<Request<Bytes>, ProxyError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = request.into_parts();
    let body = Limited::new(body, limit)
        .collect()
        .await
        .map_err(|e| match e.downcast_ref::<LengthLimitError>() {
            Some(_) => ProxyError::BodyTooLarge(limit),
            None => ProxyError::RequestBody(e.to_string()),
        })?
        .to_bytes();
    Ok(Request::from_parts(parts, body))
}
