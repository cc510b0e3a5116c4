//! Single entry point for dispatching requests.
//!
//! The facade owns no policy of its own: it attaches a key from the pool
//! (when the deployment is key-pooled), hands the request to the cluster and
//! records dispatch-level metrics.

use crate::api_keys::{ApiKeyManager, KeyRotation, KeyStatus};
use crate::cluster::Cluster;
use crate::config::{Config, ValidationError};
use crate::errors::{DispatchError, NodeNotFoundError};
use crate::metrics_defs::{DISPATCH_DURATION, DISPATCH_INFLIGHT};
use crate::node::NodeHealthReport;
use crate::outcome::OutcomeCallback;
use crate::transport::HttpTransport;
use crate::types::{DispatchRequest, NodeReply};
use serde_json::json;
use shared::{gauge, histogram};
use std::sync::Arc;
use tokio::time::Instant;

/// Keeps the in-flight gauge accurate even when a dispatch is dropped.
struct InFlight;

impl InFlight {
    fn start() -> Self {
        gauge!(DISPATCH_INFLIGHT).increment(1.0);
        InFlight
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        gauge!(DISPATCH_INFLIGHT).decrement(1.0);
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    cluster: Arc<Cluster>,
    keys: Option<Arc<ApiKeyManager>>,
}

impl Dispatcher {
    pub fn new(cluster: Arc<Cluster>, keys: Option<Arc<ApiKeyManager>>) -> Self {
        Self { cluster, keys }
    }

    /// Builds the cluster and key pool from a validated configuration,
    /// talking to nodes over HTTP.
    pub fn from_config(config: &Config) -> Result<Self, ValidationError> {
        let transport = Arc::new(HttpTransport::new(config.dispatch.endpoint_path.clone()));
        let cluster = Cluster::new(
            config.nodes.clone(),
            &config.circuit_breaker,
            transport,
            config.dispatch.default_timeout(),
        );

        let keys = match &config.api_keys {
            Some(pool) => Some(Arc::new(ApiKeyManager::from_config(pool)?)),
            None => None,
        };

        tracing::info!(
            nodes = config.nodes.len(),
            api_keys = keys.as_ref().map_or(0, |k| k.len()),
            "dispatcher initialized"
        );

        Ok(Self::new(Arc::new(cluster), keys))
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Routes `request` to the best available node, failing over in order.
    ///
    /// With a key pool, a key is acquired before any node is considered, so
    /// an exhausted pool fails fast without touching the network.
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<NodeReply, DispatchError> {
        let _in_flight = InFlight::start();
        let started = Instant::now();

        let result = match self.rotation() {
            Ok(mut keys) => self.cluster.dispatch(&request, &mut keys).await,
            Err(e) => Err(e),
        };

        self.record(&request, started, &result);
        result
    }

    /// Calls one named node with no failover.
    pub async fn dispatch_to(
        &self,
        node_id: &str,
        request: DispatchRequest,
    ) -> Result<NodeReply, DispatchError> {
        let _in_flight = InFlight::start();
        let started = Instant::now();

        let result = match self.rotation() {
            Ok(mut keys) => self.cluster.dispatch_to(node_id, &request, &mut keys).await,
            Err(e) => Err(e),
        };

        self.record(&request, started, &result);
        result
    }

    pub fn cluster_health(&self) -> Vec<NodeHealthReport> {
        self.cluster.health()
    }

    /// Pool status, empty when the deployment is not key-pooled.
    pub fn key_status(&self) -> Vec<KeyStatus> {
        self.keys.as_ref().map(|k| k.status()).unwrap_or_default()
    }

    pub fn on_outcome(&self, callback: OutcomeCallback) {
        self.cluster.on_outcome(callback);
    }

    pub fn set_node_enabled(&self, node_id: &str, enabled: bool) -> Result<(), NodeNotFoundError> {
        if self.cluster.set_enabled(node_id, enabled) {
            Ok(())
        } else {
            Err(NodeNotFoundError(node_id.to_string()))
        }
    }

    /// Ready while at least one node is enabled.
    pub fn is_ready(&self) -> bool {
        self.cluster.nodes().any(|node| node.is_enabled())
    }

    /// Document served by the admin `/status` endpoint.
    pub fn status(&self) -> serde_json::Value {
        json!({
            "nodes": self.cluster_health(),
            "api_keys": self.key_status(),
        })
    }

    fn rotation(&self) -> Result<KeyRotation<'_>, DispatchError> {
        match &self.keys {
            Some(manager) => Ok(KeyRotation::acquire(manager)?),
            None => Ok(KeyRotation::unpooled()),
        }
    }

    fn record(
        &self,
        request: &DispatchRequest,
        started: Instant,
        result: &Result<NodeReply, DispatchError>,
    ) {
        let label = match result {
            Ok(_) => "success",
            Err(e) => e.kind(),
        };
        histogram!(DISPATCH_DURATION, "result" => label).record(started.elapsed().as_secs_f64());

        match result {
            Ok(reply) => {
                tracing::debug!(model = %request.model, node_id = %reply.node_id, "dispatch served")
            }
            Err(e) => tracing::warn!(model = %request.model, error = %e, "dispatch failed"),
        }
    }
}
