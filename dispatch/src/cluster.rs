//! Node registry, candidate ranking and the sequential failover loop.
//!
//! Candidates for a dispatch are tried strictly one at a time in ranked
//! order. The first reply ends the dispatch. A candidate whose circuit is
//! open is skipped without a network call and logged as such, so the
//! aggregated failure tells "skipped" apart from "tried and failed".

use crate::api_keys::{ApiKeyLease, KeyRotation};
use crate::circuit_breaker::Admission;
use crate::config::{CircuitBreakerConfig, NodeConfig};
use crate::errors::{AttemptError, AttemptLog, DispatchError};
use crate::metrics_defs::{CIRCUIT_OPEN_SKIPS, NODE_ATTEMPTS};
use crate::node::{Node, NodeHealthReport};
use crate::outcome::{Outcome, OutcomeCallback, OutcomeEvent, OutcomeHooks};
use crate::transport::{NodeTransport, ReplyClass, classify};
use crate::types::{DispatchRequest, NodeReply};
use hyper::body::Bytes;
use hyper::Response;
use indexmap::IndexMap;
use shared::counter;
use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout_at};

/// Result of calling a single admitted node.
enum CallResult {
    Reply(NodeReply),
    RateLimited { retry_after: Option<Duration> },
    Failed(AttemptError),
    /// The dispatch deadline elapsed mid-call
    Cancelled,
}

/// Records a failure for the node if the attempt future is dropped before
/// reporting an outcome, so a cancelled caller still reaches the breaker.
///
/// Outcomes are reported against the admission the breaker granted, so a
/// call that outlives a state change cannot settle the new state.
struct AttemptGuard<'a> {
    node: &'a Node,
    admission: Admission,
    armed: bool,
}

impl<'a> AttemptGuard<'a> {
    fn new(node: &'a Node, admission: Admission) -> Self {
        Self {
            node,
            admission,
            armed: true,
        }
    }

    fn succeeded(mut self) {
        self.armed = false;
        self.node.record_attempt(self.admission, true);
    }

    fn failed(mut self) {
        self.armed = false;
        self.node.record_attempt(self.admission, false);
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(node_id = %self.node.id(), "attempt abandoned by caller");
            self.node.record_attempt(self.admission, false);
        }
    }
}

pub struct Cluster {
    nodes: IndexMap<String, Arc<Node>>,
    transport: Arc<dyn NodeTransport>,
    default_timeout: Duration,
    hooks: OutcomeHooks,
}

impl Cluster {
    pub fn new(
        node_configs: Vec<NodeConfig>,
        breaker_config: &CircuitBreakerConfig,
        transport: Arc<dyn NodeTransport>,
        default_timeout: Duration,
    ) -> Self {
        let nodes = node_configs
            .into_iter()
            .map(|config| {
                let id = config.id.clone();
                (id, Arc::new(Node::new(config, breaker_config.clone())))
            })
            .collect();

        Self {
            nodes,
            transport,
            default_timeout,
            hooks: OutcomeHooks::default(),
        }
    }

    /// Look up a node by id. Unknown ids are simply absent.
    pub fn get(&self, node_id: &str) -> Option<&Arc<Node>> {
        self.nodes.get(node_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes.values()
    }

    /// Enables or disables a node. Returns false for an unknown id.
    pub fn set_enabled(&self, node_id: &str, enabled: bool) -> bool {
        match self.nodes.get(node_id) {
            Some(node) => {
                node.set_enabled(enabled);
                tracing::info!(node_id, enabled, "node availability changed");
                true
            }
            None => false,
        }
    }

    pub fn on_outcome(&self, callback: OutcomeCallback) {
        self.hooks.register(callback);
    }

    pub fn health(&self) -> Vec<NodeHealthReport> {
        self.nodes.values().map(|node| node.report()).collect()
    }

    /// Enabled nodes serving `model`, best first.
    ///
    /// The preferred node leads when it is a candidate at all. The rest are
    /// ordered by fewest consecutive failures, most recent success, then
    /// configured priority and id, so the order is fully deterministic.
    pub fn candidates(&self, model: &str, preferred: Option<&str>) -> Vec<Arc<Node>> {
        let mut ranked: Vec<_> = self
            .nodes
            .values()
            .filter(|node| node.is_enabled() && node.supports(model))
            .map(|node| (node.health(), node.clone()))
            .collect();

        ranked.sort_by(|(a_health, a), (b_health, b)| {
            let a_key = (
                Some(a.id()) != preferred,
                a_health.consecutive_failures,
                Reverse(a_health.last_success),
                a.priority(),
                a.id(),
            );
            let b_key = (
                Some(b.id()) != preferred,
                b_health.consecutive_failures,
                Reverse(b_health.last_success),
                b.priority(),
                b.id(),
            );
            a_key.cmp(&b_key)
        });

        ranked.into_iter().map(|(_, node)| node).collect()
    }

    /// Runs the failover loop for `request`.
    ///
    /// Returns the first reply. Every call is charged to the active key's
    /// quota; a skipped node costs nothing. A rate limit on a pooled key
    /// cools that key down and continues with a fresh one; if none is left
    /// the dispatch ends with [`DispatchError::KeyExhaustion`].
    pub async fn dispatch(
        &self,
        request: &DispatchRequest,
        keys: &mut KeyRotation<'_>,
    ) -> Result<NodeReply, DispatchError> {
        let candidates = self.candidates(&request.model, request.preferred_node_id.as_deref());
        let mut log = AttemptLog::default();

        if candidates.is_empty() {
            tracing::warn!(model = %request.model, "no candidate nodes for model");
        }

        for node in candidates {
            if request.deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(log.into_cancelled(&request.model));
            }

            keys.charge_call()?;
            let admission = match node.breaker().check() {
                Ok(admission) => admission,
                Err(open) => {
                    keys.refund_call();
                    let error = AttemptError::CircuitOpen {
                        state: open.state,
                        next_retry_at: open.next_retry_at,
                    };
                    self.skip(&node, request, keys.key_id(), &error);
                    log.push(node.id(), error);
                    continue;
                }
            };

            match self.call_node(&node, admission, request, keys.lease()).await {
                CallResult::Reply(reply) => {
                    keys.record_success();
                    return Ok(reply);
                }
                CallResult::RateLimited { retry_after } => {
                    log.push(node.id(), AttemptError::RateLimited { retry_after });
                    keys.rotate_after_rate_limit(retry_after)?;
                }
                CallResult::Failed(error) => log.push(node.id(), error),
                CallResult::Cancelled => {
                    log.push(node.id(), AttemptError::Cancelled);
                    return Err(log.into_cancelled(&request.model));
                }
            }
        }

        let err = log.into_all_failed(&request.model);
        tracing::error!(model = %request.model, error = %err, "dispatch exhausted all candidates");
        Err(err)
    }

    /// Calls exactly one named node, bypassing ranking and failover.
    ///
    /// An open circuit is reported as [`DispatchError::CircuitOpen`]. An
    /// unknown, disabled or incapable node is not a candidate and yields an
    /// empty [`DispatchError::AllNodesFailed`].
    pub async fn dispatch_to(
        &self,
        node_id: &str,
        request: &DispatchRequest,
        keys: &mut KeyRotation<'_>,
    ) -> Result<NodeReply, DispatchError> {
        let mut log = AttemptLog::default();

        let Some(node) = self
            .nodes
            .get(node_id)
            .filter(|node| node.is_enabled() && node.supports(&request.model))
        else {
            tracing::warn!(node_id, model = %request.model, "requested node is not a candidate");
            return Err(log.into_all_failed(&request.model));
        };

        keys.charge_call()?;
        let admission = match node.breaker().check() {
            Ok(admission) => admission,
            Err(open) => {
                keys.refund_call();
                let error = AttemptError::CircuitOpen {
                    state: open.state,
                    next_retry_at: open.next_retry_at,
                };
                self.skip(node, request, keys.key_id(), &error);
                return Err(open.into());
            }
        };

        match self.call_node(node, admission, request, keys.lease()).await {
            CallResult::Reply(reply) => {
                keys.record_success();
                Ok(reply)
            }
            CallResult::RateLimited { retry_after } => {
                keys.report_rate_limited(retry_after);
                log.push(node.id(), AttemptError::RateLimited { retry_after });
                Err(log.into_all_failed(&request.model))
            }
            CallResult::Failed(error) => {
                log.push(node.id(), error);
                Err(log.into_all_failed(&request.model))
            }
            CallResult::Cancelled => {
                log.push(node.id(), AttemptError::Cancelled);
                Err(log.into_cancelled(&request.model))
            }
        }
    }

    fn skip(
        &self,
        node: &Node,
        request: &DispatchRequest,
        key_id: Option<&str>,
        error: &AttemptError,
    ) {
        tracing::debug!(node_id = %node.id(), "skipping node with open circuit");
        counter!(CIRCUIT_OPEN_SKIPS, "node" => node.id().to_string()).increment(1);
        self.hooks.emit(&OutcomeEvent {
            node_id: node.id().to_string(),
            model: request.model.clone(),
            key_id: key_id.map(str::to_string),
            outcome: Outcome::Skipped {
                error: error.clone(),
            },
        });
    }

    /// Calls a node whose breaker has already admitted the call and records
    /// the outcome in its breaker and health snapshot.
    async fn call_node(
        &self,
        node: &Node,
        admission: Admission,
        request: &DispatchRequest,
        lease: Option<&ApiKeyLease>,
    ) -> CallResult {
        let guard = AttemptGuard::new(node, admission);
        let started = Instant::now();
        let sent = self.send(node, request, lease).await;
        let latency = started.elapsed();

        let (result, outcome) = match sent {
            Ok(response) => match classify(&response) {
                ReplyClass::Success | ReplyClass::ClientError => {
                    guard.succeeded();
                    let status = response.status();
                    let (parts, body) = response.into_parts();
                    let reply = NodeReply {
                        node_id: node.id().to_string(),
                        key_id: lease.map(|l| l.id().to_string()),
                        status,
                        headers: parts.headers,
                        body,
                    };
                    (
                        CallResult::Reply(reply),
                        Outcome::Success { status, latency },
                    )
                }
                ReplyClass::RateLimited { retry_after } => {
                    // A pooled key takes the blame; the node itself answered.
                    if lease.is_some() {
                        guard.succeeded();
                    } else {
                        guard.failed();
                    }
                    let error = AttemptError::RateLimited { retry_after };
                    (
                        CallResult::RateLimited { retry_after },
                        Outcome::Failure { error, latency },
                    )
                }
                ReplyClass::Transient => {
                    guard.failed();
                    let error = AttemptError::Status(response.status().as_u16());
                    (
                        CallResult::Failed(error.clone()),
                        Outcome::Failure { error, latency },
                    )
                }
            },
            Err(AttemptError::Cancelled) => {
                guard.failed();
                (
                    CallResult::Cancelled,
                    Outcome::Failure {
                        error: AttemptError::Cancelled,
                        latency,
                    },
                )
            }
            Err(error) => {
                guard.failed();
                (
                    CallResult::Failed(error.clone()),
                    Outcome::Failure { error, latency },
                )
            }
        };

        match &outcome {
            Outcome::Success { status, .. } => {
                tracing::debug!(node_id = %node.id(), %status, ?latency, "node replied");
                counter!(NODE_ATTEMPTS, "node" => node.id().to_string(), "outcome" => "success")
                    .increment(1);
            }
            Outcome::Failure { error, .. } | Outcome::Skipped { error } => {
                tracing::warn!(node_id = %node.id(), %error, ?latency, "node attempt failed");
                counter!(NODE_ATTEMPTS, "node" => node.id().to_string(), "outcome" => error.kind())
                    .increment(1);
            }
        }

        self.hooks.emit(&OutcomeEvent {
            node_id: node.id().to_string(),
            model: request.model.clone(),
            key_id: lease.map(|l| l.id().to_string()),
            outcome,
        });

        result
    }

    /// Sends under the per-attempt timeout, cut short by the dispatch
    /// deadline when that comes first.
    async fn send(
        &self,
        node: &Node,
        request: &DispatchRequest,
        lease: Option<&ApiKeyLease>,
    ) -> Result<Response<Bytes>, AttemptError> {
        let attempt_timeout = request.timeout.unwrap_or(self.default_timeout);
        let attempt_deadline = Instant::now() + attempt_timeout;
        let (limit, cancels) = match request.deadline {
            Some(deadline) if deadline <= attempt_deadline => (deadline, true),
            _ => (attempt_deadline, false),
        };

        match timeout_at(limit, self.transport.send(node, request, lease)).await {
            Ok(result) => result,
            Err(_) if cancels => Err(AttemptError::Cancelled),
            Err(_) => Err(AttemptError::Timeout(attempt_timeout)),
        }
    }
}
