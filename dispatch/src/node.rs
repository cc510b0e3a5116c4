use crate::circuit_breaker::{Admission, CircuitBreaker, CircuitState};
use crate::config::{ANY_MODEL, CircuitBreakerConfig, NodeConfig};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::Instant;
use url::Url;

/// Outcome history used to rank candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NodeHealth {
    pub consecutive_failures: u32,
    pub last_success: Option<Instant>,
    pub last_failure: Option<Instant>,
}

/// A physical inference backend. Lives for the whole process; may be
/// disabled but is never removed.
#[derive(Debug)]
pub struct Node {
    id: String,
    url: Url,
    models: HashSet<String>,
    priority: u32,
    enabled: AtomicBool,
    breaker: CircuitBreaker,
    health: Mutex<NodeHealth>,
}

impl Node {
    pub fn new(config: NodeConfig, breaker_config: CircuitBreakerConfig) -> Self {
        let breaker = CircuitBreaker::new(config.id.clone(), breaker_config);
        Self {
            id: config.id,
            url: config.url,
            models: config.models.into_iter().collect(),
            priority: config.priority,
            enabled: AtomicBool::new(config.enabled),
            breaker,
            health: Mutex::new(NodeHealth::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn supports(&self, model: &str) -> bool {
        self.models.contains(model) || self.models.contains(ANY_MODEL)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn health(&self) -> NodeHealth {
        *self.health.lock()
    }

    pub fn record_success(&self) {
        self.breaker.on_success();
        self.mark_success();
    }

    pub fn record_failure(&self) {
        self.breaker.on_failure();
        self.mark_failure();
    }

    /// Records the result of a call the breaker admitted. The health
    /// snapshot always updates; the breaker ignores a stale admission.
    pub fn record_attempt(&self, admission: Admission, succeeded: bool) {
        if succeeded {
            self.breaker.on_success_for(admission);
            self.mark_success();
        } else {
            self.breaker.on_failure_for(admission);
            self.mark_failure();
        }
    }

    fn mark_success(&self) {
        let mut health = self.health.lock();
        health.consecutive_failures = 0;
        health.last_success = Some(Instant::now());
    }

    fn mark_failure(&self) {
        let mut health = self.health.lock();
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        health.last_failure = Some(Instant::now());
    }

    pub fn report(&self) -> NodeHealthReport {
        let health = self.health();
        let breaker = self.breaker.snapshot();
        let now = Instant::now();
        let mut models: Vec<String> = self.models.iter().cloned().collect();
        models.sort();

        NodeHealthReport {
            node_id: self.id.clone(),
            enabled: self.is_enabled(),
            models,
            breaker_state: breaker.state,
            consecutive_failures: health.consecutive_failures,
            next_retry_in_ms: breaker
                .next_retry_at
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
            last_success_ms_ago: health
                .last_success
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
            last_failure_ms_ago: health
                .last_failure
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
        }
    }
}

/// One entry of the cluster health listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeHealthReport {
    pub node_id: String,
    pub enabled: bool,
    pub models: Vec<String>,
    pub breaker_state: CircuitState,
    pub consecutive_failures: u32,
    pub next_retry_in_ms: Option<u64>,
    pub last_success_ms_ago: Option<u64>,
    pub last_failure_ms_ago: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_config(id: &str, models: &[&str]) -> NodeConfig {
        NodeConfig {
            id: id.to_string(),
            url: Url::parse(&format!("http://{id}")).unwrap(),
            models: models.iter().map(|m| m.to_string()).collect(),
            priority: 0,
            enabled: true,
        }
    }

    #[test]
    fn test_supports() {
        let node = Node::new(
            node_config("10.0.0.1:8000", &["llama3", "mistral"]),
            CircuitBreakerConfig::default(),
        );
        assert!(node.supports("llama3"));
        assert!(!node.supports("gpt-4"));

        let any = Node::new(
            node_config("10.0.0.2:8000", &[ANY_MODEL]),
            CircuitBreakerConfig::default(),
        );
        assert!(any.supports("gpt-4"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_tracking() {
        let node = Node::new(
            node_config("10.0.0.1:8000", &["llama3"]),
            CircuitBreakerConfig {
                failure_threshold: 2,
                ..Default::default()
            },
        );

        node.record_failure();
        assert_eq!(node.health().consecutive_failures, 1);
        assert!(node.health().last_failure.is_some());
        assert_eq!(node.breaker().state(), CircuitState::Closed);

        node.record_failure();
        let report = node.report();
        assert_eq!(report.breaker_state, CircuitState::Open);
        assert_eq!(report.consecutive_failures, 2);
        assert_eq!(report.next_retry_in_ms, Some(10_000));
        assert_eq!(report.last_success_ms_ago, None);

        node.set_enabled(false);
        assert!(!node.report().enabled);
    }
}
