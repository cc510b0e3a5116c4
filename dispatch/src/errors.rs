use crate::circuit_breaker::CircuitState;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

pub type NodeId = String;

/// Why a single candidate did not produce a reply.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AttemptError {
    /// Skipped without a network call
    #[error("circuit is {state}")]
    CircuitOpen {
        state: CircuitState,
        next_retry_at: Option<Instant>,
    },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("request failed: {0}")]
    Connect(String),

    #[error("node returned status {0}")]
    Status(u16),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("failed to read response body: {0}")]
    Body(String),

    /// The caller's deadline elapsed while this attempt was in flight
    #[error("cancelled by caller")]
    Cancelled,
}

impl AttemptError {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, AttemptError::CircuitOpen { .. })
    }

    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AttemptError::CircuitOpen { .. } => "circuit_open",
            AttemptError::Timeout(_) => "timeout",
            AttemptError::Connect(_) => "connect",
            AttemptError::Status(_) => "status",
            AttemptError::RateLimited { .. } => "rate_limited",
            AttemptError::Body(_) => "body",
            AttemptError::Cancelled => "cancelled",
        }
    }
}

/// A call to one named circuit was rejected without touching the network.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("circuit {name} is {state}")]
pub struct CircuitOpenError {
    pub name: String,
    pub state: CircuitState,
    /// When the circuit will admit a trial call. `None` while a trial call is already in flight.
    pub next_retry_at: Option<Instant>,
}

/// No key in the pool can be used right now.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("all {total_keys} api keys are exhausted, retry after {retry_after_secs}s")]
pub struct KeyExhaustionError {
    /// Earliest moment any key becomes usable again
    pub reset_at: Instant,
    pub retry_after_secs: u64,
    pub total_keys: usize,
    pub keys_in_cooldown: usize,
}

/// Every candidate was tried or skipped without success.
///
/// `attempted` and `errors` are parallel and in candidate order.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("all {} candidate nodes failed for model {model}", .attempted.len())]
pub struct AllNodesFailedError {
    pub model: String,
    pub attempted: Vec<NodeId>,
    pub errors: Vec<AttemptError>,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("node {0} is not registered")]
pub struct NodeNotFoundError(pub NodeId);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error(transparent)]
    KeyExhaustion(#[from] KeyExhaustionError),

    #[error(transparent)]
    AllNodesFailed(#[from] AllNodesFailedError),

    /// The caller's deadline elapsed. Never retried by this layer.
    #[error("dispatch for model {model} cancelled after {} attempts", .attempted.len())]
    Cancelled {
        model: String,
        attempted: Vec<NodeId>,
        errors: Vec<AttemptError>,
    },
}

impl DispatchError {
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::CircuitOpen(_) => "circuit_open",
            DispatchError::KeyExhaustion(_) => "key_exhaustion",
            DispatchError::AllNodesFailed(_) => "all_nodes_failed",
            DispatchError::Cancelled { .. } => "cancelled",
        }
    }
}

/// Ordered record of the candidates visited by one dispatch.
/// Private to a single call; never shared.
#[derive(Debug, Default)]
pub(crate) struct AttemptLog {
    attempted: Vec<NodeId>,
    errors: Vec<AttemptError>,
}

impl AttemptLog {
    pub fn push(&mut self, node_id: &str, error: AttemptError) {
        self.attempted.push(node_id.to_string());
        self.errors.push(error);
    }

    pub fn into_all_failed(self, model: &str) -> DispatchError {
        DispatchError::AllNodesFailed(AllNodesFailedError {
            model: model.to_string(),
            attempted: self.attempted,
            errors: self.errors,
        })
    }

    pub fn into_cancelled(self, model: &str) -> DispatchError {
        DispatchError::Cancelled {
            model: model.to_string(),
            attempted: self.attempted,
            errors: self.errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_log_preserves_order() {
        let mut log = AttemptLog::default();
        log.push("a:1", AttemptError::Timeout(Duration::from_secs(1)));
        log.push(
            "b:1",
            AttemptError::CircuitOpen {
                state: CircuitState::Open,
                next_retry_at: None,
            },
        );
        log.push("c:1", AttemptError::Status(503));

        let DispatchError::AllNodesFailed(err) = log.into_all_failed("llama3") else {
            panic!("expected AllNodesFailed");
        };
        assert_eq!(err.model, "llama3");
        assert_eq!(err.attempted, vec!["a:1", "b:1", "c:1"]);
        assert_eq!(err.errors.len(), 3);
        assert!(!err.errors[0].is_circuit_open());
        assert!(err.errors[1].is_circuit_open());
        assert_eq!(err.errors[2], AttemptError::Status(503));
        assert_eq!(err.to_string(), "all 3 candidate nodes failed for model llama3");
    }

    #[test]
    fn test_error_kinds() {
        let err = AttemptLog::default().into_cancelled("m");
        assert_eq!(err.kind(), "cancelled");
        assert_eq!(
            AttemptError::RateLimited { retry_after: None }.kind(),
            "rate_limited"
        );
    }
}
