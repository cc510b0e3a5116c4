use crate::api_keys::ApiKeyLease;
use crate::errors::AttemptError;
use crate::node::Node;
use crate::types::DispatchRequest;
use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue, RETRY_AFTER};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;

/// Performs the network call to one node. Timeouts are applied by the
/// caller, so implementations only report transport-level failures.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn send(
        &self,
        node: &Node,
        request: &DispatchRequest,
        credential: Option<&ApiKeyLease>,
    ) -> Result<Response<Bytes>, AttemptError>;
}

/// How a node's reply affects failover.
#[derive(Debug, PartialEq)]
pub enum ReplyClass {
    /// 2xx
    Success,
    /// 4xx other than 408/429: the node is healthy, the request is not.
    /// Returned to the caller as is.
    ClientError,
    /// 429
    RateLimited { retry_after: Option<Duration> },
    /// 408 and 5xx
    Transient,
}

pub fn classify(response: &Response<Bytes>) -> ReplyClass {
    let status = response.status();
    if status.is_success() {
        ReplyClass::Success
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ReplyClass::RateLimited {
            retry_after: parse_retry_after(response),
        }
    } else if status.is_client_error() && status != StatusCode::REQUEST_TIMEOUT {
        ReplyClass::ClientError
    } else {
        ReplyClass::Transient
    }
}

/// Reads a `Retry-After` given in delta-seconds. HTTP-date values are not
/// supported and fall back to the default cooldown.
fn parse_retry_after(response: &Response<Bytes>) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Posts the payload to `{node.url}{endpoint_path}` over HTTP.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client<HttpConnector, Full<Bytes>>,
    endpoint_path: String,
}

impl HttpTransport {
    pub fn new(endpoint_path: impl Into<String>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            client,
            endpoint_path: endpoint_path.into(),
        }
    }

    fn build_request(
        &self,
        node: &Node,
        request: &DispatchRequest,
        credential: Option<&ApiKeyLease>,
    ) -> Result<Request<Full<Bytes>>, AttemptError> {
        // The endpoint is appended to any path the node url carries
        let mut url = node.url().clone();
        let path = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            self.endpoint_path.trim_start_matches('/')
        );
        url.set_path(&path);

        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(url.as_str())
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(lease) = credential {
            let value = HeaderValue::from_str(&format!("Bearer {}", lease.secret()))
                .map_err(|_| AttemptError::Connect("api key is not a valid header value".into()))?;
            builder = builder.header(AUTHORIZATION, value);
        }

        builder
            .body(Full::new(request.payload.clone()))
            .map_err(|e| AttemptError::Connect(format!("failed to build request: {e}")))
    }
}

#[async_trait]
impl NodeTransport for HttpTransport {
    async fn send(
        &self,
        node: &Node,
        request: &DispatchRequest,
        credential: Option<&ApiKeyLease>,
    ) -> Result<Response<Bytes>, AttemptError> {
        let upstream_request = self.build_request(node, request, credential)?;

        let response = self
            .client
            .request(upstream_request)
            .await
            .map_err(|e| AttemptError::Connect(e.to_string()))?;

        let (parts, body) = response.into_parts();
        let body_bytes = body
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .map_err(|e| AttemptError::Body(e.to_string()))?;

        Ok(Response::from_parts(parts, body_bytes))
    }
}
