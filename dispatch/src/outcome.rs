//! Observer hooks for per-attempt outcomes, so analytics or alerting can
//! follow the dispatch core without it depending on them.

use crate::errors::AttemptError;
use hyper::StatusCode;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The node replied and the reply was returned to the caller
    Success { status: StatusCode, latency: Duration },
    /// The node was called and failed
    Failure {
        error: AttemptError,
        latency: Duration,
    },
    /// The node was not called because its circuit was open
    Skipped { error: AttemptError },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeEvent {
    pub node_id: String,
    pub model: String,
    pub key_id: Option<String>,
    pub outcome: Outcome,
}

pub type OutcomeCallback = Arc<dyn Fn(&OutcomeEvent) + Send + Sync>;

#[derive(Default)]
pub struct OutcomeHooks {
    callbacks: RwLock<Vec<OutcomeCallback>>,
}

impl OutcomeHooks {
    pub fn register(&self, callback: OutcomeCallback) {
        self.callbacks.write().push(callback);
    }

    /// Invokes every callback. The registry lock is released before any
    /// callback runs, so callbacks may register further hooks.
    pub fn emit(&self, event: &OutcomeEvent) {
        let callbacks = self.callbacks.read().clone();
        for callback in callbacks {
            callback(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_reaches_every_callback() {
        let hooks = OutcomeHooks::default();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            hooks.register(Arc::new(move |event: &OutcomeEvent| {
                assert_eq!(event.node_id, "a:1");
                calls.fetch_add(1, Ordering::SeqCst);
            }));
        }

        hooks.emit(&OutcomeEvent {
            node_id: "a:1".into(),
            model: "llama3".into(),
            key_id: None,
            outcome: Outcome::Failure {
                error: AttemptError::Status(503),
                latency: Duration::from_millis(3),
            },
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
