use http::{HeaderMap, StatusCode};
use hyper::body::Bytes;
use std::time::Duration;
use tokio::time::Instant;

/// A logical inference request. Immutable once submitted.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub model: String,
    /// Forwarded to the node verbatim
    pub payload: Bytes,
    /// Per-attempt timeout. The dispatcher's default applies when absent.
    pub timeout: Option<Duration>,
    /// Overall deadline for the whole dispatch. Reaching it cancels the
    /// in-flight attempt and ends the dispatch without trying more nodes.
    pub deadline: Option<Instant>,
    /// Tried first when it is a capable candidate; ignored otherwise
    pub preferred_node_id: Option<String>,
}

impl DispatchRequest {
    pub fn new(model: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            model: model.into(),
            payload: payload.into(),
            timeout: None,
            deadline: None,
            preferred_node_id: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_preferred_node(mut self, node_id: impl Into<String>) -> Self {
        self.preferred_node_id = Some(node_id.into());
        self
    }
}

/// The reply of the node that served a dispatch.
#[derive(Debug, Clone)]
pub struct NodeReply {
    pub node_id: String,
    /// Key the call was made with, if the deployment is key-pooled
    pub key_id: Option<String>,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Whole seconds covering `duration`, rounded up.
pub fn ceil_secs(duration: Duration) -> u64 {
    duration.as_nanos().div_ceil(1_000_000_000) as u64
}
