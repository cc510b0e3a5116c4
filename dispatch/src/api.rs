//! HTTP surface of the dispatcher.
//!
//! - `POST /v1/dispatch`: failover dispatch across every capable node
//! - `POST /v1/nodes/{id}/dispatch`: call exactly one node
//!
//! A node reply is passed through with its status and body. Dispatch errors
//! are rendered as JSON.

use crate::DispatchServiceError;
use crate::dispatcher::Dispatcher;
use crate::errors::DispatchError;
use crate::types::{DispatchRequest, NodeReply, ceil_secs};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{CONTENT_TYPE, HeaderName, HeaderValue, RETRY_AFTER};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use shared::http::{json_response, make_error_response};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::Instant;

const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Id of the node that served the request
pub const DISPATCH_NODE_HEADER: HeaderName = HeaderName::from_static("x-dispatch-node");

#[derive(Debug, Deserialize)]
struct DispatchBody {
    model: String,
    /// Forwarded to the node as its JSON request body
    payload: serde_json::Value,
    /// Per-attempt timeout
    timeout_ms: Option<u64>,
    /// Budget for the whole dispatch, failover included
    deadline_ms: Option<u64>,
    preferred_node_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attempts: Vec<AttemptSummary<'a>>,
}

#[derive(Debug, Serialize)]
struct AttemptSummary<'a> {
    node_id: &'a str,
    error: &'static str,
    message: String,
}

enum Route<'a> {
    Dispatch,
    DispatchTo(&'a str),
}

fn route(path: &str) -> Option<Route<'_>> {
    if path == "/v1/dispatch" {
        return Some(Route::Dispatch);
    }
    path.strip_prefix("/v1/nodes/")
        .and_then(|rest| rest.strip_suffix("/dispatch"))
        .filter(|id| !id.is_empty() && !id.contains('/'))
        .map(Route::DispatchTo)
}

pub struct DispatchService {
    dispatcher: Dispatcher,
}

impl DispatchService {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }
}

impl Service<Request<Incoming>> for DispatchService {
    type Response = Response<BoxBody<Bytes, Infallible>>;
    type Error = DispatchServiceError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let dispatcher = self.dispatcher.clone();
        Box::pin(async move {
            let response = handle(&dispatcher, req).await;
            Ok(response.map(|body| Full::new(body).boxed()))
        })
    }
}

pub async fn handle<B>(dispatcher: &Dispatcher, req: Request<B>) -> Response<Bytes>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let path = req.uri().path().to_string();
    let Some(route) = route(&path) else {
        return make_error_response(StatusCode::NOT_FOUND);
    };
    if req.method() != Method::POST {
        return make_error_response(StatusCode::METHOD_NOT_ALLOWED);
    }

    let request = match read_request(req).await {
        Ok(request) => request,
        Err(response) => return response,
    };

    let result = match route {
        Route::Dispatch => dispatcher.dispatch(request).await,
        Route::DispatchTo(node_id) => dispatcher.dispatch_to(node_id, request).await,
    };

    match result {
        Ok(reply) => reply_response(reply),
        Err(err) => error_response(&err),
    }
}

async fn read_request<B>(req: Request<B>) -> Result<DispatchRequest, Response<Bytes>>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let bytes = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.is::<LengthLimitError>() => {
            return Err(make_error_response(StatusCode::PAYLOAD_TOO_LARGE));
        }
        Err(e) => {
            tracing::debug!(error = %e, "failed to read request body");
            return Err(make_error_response(StatusCode::BAD_REQUEST));
        }
    };

    let body: DispatchBody = serde_json::from_slice(&bytes).map_err(|e| bad_request(&e))?;
    let payload = serde_json::to_vec(&body.payload).map_err(|e| bad_request(&e))?;

    let mut request = DispatchRequest::new(body.model, payload);
    if let Some(ms) = body.timeout_ms {
        request = request.with_timeout(Duration::from_millis(ms));
    }
    if let Some(ms) = body.deadline_ms {
        request = request.with_deadline(Instant::now() + Duration::from_millis(ms));
    }
    if let Some(node_id) = body.preferred_node_id {
        request = request.with_preferred_node(node_id);
    }
    Ok(request)
}

fn bad_request(e: &serde_json::Error) -> Response<Bytes> {
    json_response(
        StatusCode::BAD_REQUEST,
        &ErrorBody {
            error: "invalid_request",
            message: e.to_string(),
            retry_after_secs: None,
            attempts: vec![],
        },
    )
}

fn reply_response(reply: NodeReply) -> Response<Bytes> {
    let mut response = Response::new(reply.body);
    *response.status_mut() = reply.status;

    let headers = response.headers_mut();
    if let Some(content_type) = reply.headers.get(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, content_type.clone());
    }
    if let Ok(node) = HeaderValue::from_str(&reply.node_id) {
        headers.insert(DISPATCH_NODE_HEADER, node);
    }
    response
}

fn error_response(err: &DispatchError) -> Response<Bytes> {
    let (status, retry_after_secs, attempts) = match err {
        DispatchError::KeyExhaustion(e) => {
            (StatusCode::TOO_MANY_REQUESTS, Some(e.retry_after_secs), vec![])
        }
        DispatchError::CircuitOpen(e) => {
            let retry_after = e
                .next_retry_at
                .map(|at| ceil_secs(at.saturating_duration_since(Instant::now())));
            (StatusCode::SERVICE_UNAVAILABLE, retry_after, vec![])
        }
        DispatchError::AllNodesFailed(e) => (
            StatusCode::BAD_GATEWAY,
            None,
            summarize(&e.attempted, &e.errors),
        ),
        DispatchError::Cancelled {
            attempted, errors, ..
        } => (
            StatusCode::GATEWAY_TIMEOUT,
            None,
            summarize(attempted, errors),
        ),
    };

    let mut response = json_response(
        status,
        &ErrorBody {
            error: err.kind(),
            message: err.to_string(),
            retry_after_secs,
            attempts,
        },
    );
    if let Some(secs) = retry_after_secs {
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}

fn summarize<'a>(
    attempted: &'a [String],
    errors: &[crate::errors::AttemptError],
) -> Vec<AttemptSummary<'a>> {
    attempted
        .iter()
        .zip(errors)
        .map(|(node_id, error)| AttemptSummary {
            node_id,
            error: error.kind(),
            message: error.to_string(),
        })
        .collect()
}
