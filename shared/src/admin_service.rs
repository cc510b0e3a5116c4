use crate::http::{json_response, make_boxed_error_response};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

/// Serves the administrative endpoints:
///
/// - `/health`: liveness, always ok
/// - `/ready`: ok once `is_ready` reports true
/// - `/status`: JSON document produced by `status`
pub struct AdminService<F, S, E> {
    is_ready: F,
    status: S,
    _error: PhantomData<fn() -> E>,
}

impl<F, S, E> AdminService<F, S, E>
where
    F: Fn() -> bool,
    S: Fn() -> serde_json::Value,
{
    pub fn new(is_ready: F, status: S) -> Self {
        Self {
            is_ready,
            status,
            _error: PhantomData,
        }
    }
}

impl<F, S, E> Service<Request<Incoming>> for AdminService<F, S, E>
where
    F: Fn() -> bool + Send + 'static,
    S: Fn() -> serde_json::Value + Send + 'static,
    E: Send + 'static,
{
    type Response = Response<BoxBody<Bytes, Infallible>>;
    type Error = E;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let res = route(req.uri().path(), &self.is_ready, &self.status);
        Box::pin(async move { Ok(res) })
    }
}

fn route(
    path: &str,
    is_ready: &impl Fn() -> bool,
    status: &impl Fn() -> serde_json::Value,
) -> Response<BoxBody<Bytes, Infallible>> {
    let ok_body = || Full::new(Bytes::from("ok\n")).boxed();

    match path {
        "/health" => Response::new(ok_body()),
        "/ready" => match is_ready() {
            true => Response::new(ok_body()),
            false => make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE),
        },
        "/status" => json_response(StatusCode::OK, &status()).map(|b| Full::new(b).boxed()),
        _ => make_boxed_error_response(StatusCode::NOT_FOUND),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn body_of(res: Response<BoxBody<Bytes, Infallible>>) -> Bytes {
        res.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn test_admin_routes() {
        let status = || json!({"nodes": 2});

        let res = route("/health", &|| false, &status);
        assert_eq!(res.status(), StatusCode::OK);

        let res = route("/ready", &|| false, &status);
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

        let res = route("/ready", &|| true, &status);
        assert_eq!(res.status(), StatusCode::OK);

        let res = route("/status", &|| true, &status);
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_of(res).await.as_ref(), br#"{"nodes":2}"#);

        let res = route("/unknown", &|| true, &status);
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
