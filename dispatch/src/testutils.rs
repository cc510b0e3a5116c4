use crate::api_keys::ApiKeyLease;
use crate::cluster::Cluster;
use crate::config::{CircuitBreakerConfig, NodeConfig};
use crate::errors::AttemptError;
use crate::node::Node;
use crate::transport::NodeTransport;
use crate::types::DispatchRequest;
use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, RETRY_AFTER};
use hyper::{Response, StatusCode};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// What a scripted node does on its next call.
#[derive(Debug, Clone)]
pub enum Step {
    Reply {
        status: u16,
        body: &'static str,
        retry_after: Option<u64>,
    },
    Fail(AttemptError),
    /// Never answers
    Hang,
}

impl Step {
    pub fn ok(body: &'static str) -> Self {
        Step::Reply {
            status: 200,
            body,
            retry_after: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Step::Reply {
            status,
            body: "",
            retry_after: None,
        }
    }

    pub fn rate_limited(retry_after: Option<u64>) -> Self {
        Step::Reply {
            status: 429,
            body: "",
            retry_after,
        }
    }

    pub fn connect_error() -> Self {
        Step::Fail(AttemptError::Connect("connection refused".into()))
    }
}

/// Transport whose nodes follow a per-node script. A node without any
/// steps left answers 200 with its id as the body.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<(String, Option<String>)>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, node_id: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .entry(node_id.to_string())
            .or_default()
            .extend(steps);
    }

    /// Node ids called so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(id, _)| id.clone()).collect()
    }

    /// Key ids used by each call, in call order.
    pub fn keys_used(&self) -> Vec<Option<String>> {
        self.calls.lock().iter().map(|(_, key)| key.clone()).collect()
    }
}

#[async_trait]
impl NodeTransport for ScriptedTransport {
    async fn send(
        &self,
        node: &Node,
        _request: &DispatchRequest,
        credential: Option<&ApiKeyLease>,
    ) -> Result<Response<Bytes>, AttemptError> {
        self.calls.lock().push((
            node.id().to_string(),
            credential.map(|lease| lease.id().to_string()),
        ));

        let step = self
            .scripts
            .lock()
            .get_mut(node.id())
            .and_then(|steps| steps.pop_front());

        match step {
            None => Ok(Response::new(Bytes::from(node.id().to_string()))),
            Some(Step::Reply {
                status,
                body,
                retry_after,
            }) => {
                let mut response = Response::new(Bytes::from_static(body.as_bytes()));
                *response.status_mut() = StatusCode::from_u16(status).unwrap();
                if let Some(secs) = retry_after {
                    response
                        .headers_mut()
                        .insert(RETRY_AFTER, HeaderValue::from(secs));
                }
                Ok(response)
            }
            Some(Step::Fail(error)) => Err(error),
            Some(Step::Hang) => std::future::pending().await,
        }
    }
}

pub fn node_config(id: &str, models: &[&str], priority: u32) -> NodeConfig {
    NodeConfig {
        id: id.to_string(),
        url: Url::parse(&format!("http://{id}")).unwrap(),
        models: models.iter().map(|m| m.to_string()).collect(),
        priority,
        enabled: true,
    }
}

/// Cluster over `(id, models, priority)` nodes with a 30s default timeout.
pub fn test_cluster(
    nodes: &[(&str, &[&str], u32)],
    breaker_config: CircuitBreakerConfig,
    transport: Arc<ScriptedTransport>,
) -> Cluster {
    let configs = nodes
        .iter()
        .map(|(id, models, priority)| node_config(id, models, *priority))
        .collect();
    Cluster::new(configs, &breaker_config, transport, Duration::from_secs(30))
}
