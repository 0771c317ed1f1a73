use crate::http::{full_body, make_boxed_error_response};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

/// Renders the response for an extra GET route on the admin listener.
pub type AdminRoute = Arc<dyn Fn() -> Response<Bytes> + Send + Sync>;

pub struct AdminService<F, E> {
    is_ready: F,
    routes: HashMap<&'static str, AdminRoute>,
    _error: PhantomData<E>,
}

impl<F, E> AdminService<F, E>
where
    F: Fn() -> bool,
{
    pub fn new(is_ready: F) -> Self {
        Self {
            is_ready,
            routes: HashMap::new(),
            _error: PhantomData,
        }
    }

    /// Registers an extra GET endpoint next to `/health` and `/ready`.
    pub fn with_route(mut self, path: &'static str, route: AdminRoute) -> Self {
        self.routes.insert(path, route);
        self
    }
}

impl<F, E> Service<Request<Incoming>> for AdminService<F, E>
where
    F: Fn() -> bool + Send + 'static,
    E: Send + 'static,
{
    type Response = Response<BoxBody<Bytes, E>>;
    type Error = E;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let res = route_admin_request(req.method(), req.uri().path(), &self.is_ready, &self.routes);
        Box::pin(async move { Ok(res) })
    }
}

fn route_admin_request<F, E>(
    method: &Method,
    path: &str,
    is_ready: &F,
    routes: &HashMap<&'static str, AdminRoute>,
) -> Response<BoxBody<Bytes, E>>
where
    F: Fn() -> bool,
{
    if method != Method::GET {
        return make_boxed_error_response(StatusCode::METHOD_NOT_ALLOWED);
    }

    let ok_body = || full_body(Bytes::from("ok\n"));

    match path {
        "/health" => Response::new(ok_body()),
        "/ready" => match is_ready() {
            true => Response::new(ok_body()),
            false => make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE),
        },
        other => match routes.get(other) {
            Some(route) => route().map(full_body),
            None => make_boxed_error_response(StatusCode::NOT_FOUND),
        },
    }
}
