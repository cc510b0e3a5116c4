//! Per-target circuit breaker.
//!
//! ```text
//! CLOSED    --failure_count >= threshold-->  OPEN
//! OPEN      --cooldown elapsed, allow()-->   HALF_OPEN (one trial call admitted)
//! HALF_OPEN --trial succeeds-->              CLOSED (count reset, cooldown reset)
//! HALF_OPEN --trial fails-->                 OPEN (cooldown grows, capped)
//! ```
//!
//! All transitions happen under one mutex per breaker; callers never hold it
//! across the network call they are guarding.

use crate::config::CircuitBreakerConfig;
use crate::errors::CircuitOpenError;
use crate::metrics_defs::BREAKER_TRANSITIONS;
use parking_lot::Mutex;
use serde::Serialize;
use shared::counter;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a breaker, for status reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub cooldown: Duration,
    /// Only defined while OPEN
    pub next_retry_at: Option<Instant>,
}

/// Proof that a call was admitted, tied to the breaker state that admitted
/// it. Results reported with an admission from an earlier state are stale
/// and do not move the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    generation: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    cooldown: Duration,
    trial_in_flight: bool,
    /// Bumped on every state transition
    generation: u64,
}

impl BreakerInner {
    fn next_retry_at(&self) -> Option<Instant> {
        match self.state {
            CircuitState::Open => self.opened_at.map(|at| at + self.cooldown),
            CircuitState::Closed | CircuitState::HalfOpen => None,
        }
    }

    fn admission(&self) -> Admission {
        Admission {
            generation: self.generation,
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let cooldown = config.base_cooldown();
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                cooldown,
                trial_in_flight: false,
                generation: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns whether a call may proceed now.
    ///
    /// An OPEN breaker whose cooldown has elapsed moves to HALF_OPEN and
    /// admits exactly one trial call. Every later caller is rejected until that
    /// trial call reports back.
    pub fn allow(&self) -> bool {
        self.check().is_ok()
    }

    /// Same as [`allow`](Self::allow), but a rejection carries the breaker's
    /// state and when it will next admit a trial call. The admission should be
    /// handed back through [`on_success_for`](Self::on_success_for) or
    /// [`on_failure_for`](Self::on_failure_for).
    pub fn check(&self) -> Result<Admission, CircuitOpenError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(inner.admission()),
            CircuitState::Open => {
                let retry_at = inner.next_retry_at();
                match retry_at {
                    Some(at) if Instant::now() < at => Err(self.rejection(&inner)),
                    _ => {
                        self.transition(&mut inner, CircuitState::HalfOpen);
                        inner.trial_in_flight = true;
                        Ok(inner.admission())
                    }
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(self.rejection(&inner))
                } else {
                    inner.trial_in_flight = true;
                    Ok(inner.admission())
                }
            }
        }
    }

    /// Records a success against the current state.
    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        self.succeed(&mut inner);
    }

    /// Records a failure against the current state.
    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        self.fail(&mut inner);
    }

    /// Records the success of an admitted call. Ignored when the breaker
    /// has changed state since the call was admitted.
    pub fn on_success_for(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        if inner.generation == admission.generation {
            self.succeed(&mut inner);
        } else {
            tracing::debug!(circuit = %self.name, "ignoring stale success");
        }
    }

    /// Records the failure of an admitted call. Ignored when the breaker
    /// has changed state since the call was admitted.
    pub fn on_failure_for(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        if inner.generation == admission.generation {
            self.fail(&mut inner);
        } else {
            tracing::debug!(circuit = %self.name, "ignoring stale failure");
        }
    }

    fn succeed(&self, inner: &mut BreakerInner) {
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                self.transition(inner, CircuitState::Closed);
                inner.failure_count = 0;
                inner.opened_at = None;
                inner.trial_in_flight = false;
                inner.cooldown = self.config.base_cooldown();
            }
            // A call admitted before the trip finished late. The circuit
            // only closes through a trial call.
            CircuitState::Open => {}
        }
    }

    fn fail(&self, inner: &mut BreakerInner) {
        inner.failure_count = inner.failure_count.saturating_add(1);
        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(inner, CircuitState::Open);
                    inner.opened_at = Some(Instant::now());
                    inner.cooldown = self.config.base_cooldown();
                }
            }
            CircuitState::HalfOpen => {
                self.transition(inner, CircuitState::Open);
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
                inner.cooldown = self.config.next_cooldown(inner.cooldown);
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            cooldown: inner.cooldown,
            next_retry_at: inner.next_retry_at(),
        }
    }

    fn rejection(&self, inner: &BreakerInner) -> CircuitOpenError {
        CircuitOpenError {
            name: self.name.clone(),
            state: inner.state,
            next_retry_at: inner.next_retry_at(),
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.generation = inner.generation.wrapping_add(1);

        match to {
            CircuitState::Open => tracing::warn!(circuit = %self.name, %from, "circuit opened"),
            _ => tracing::info!(circuit = %self.name, %from, %to, "circuit state changed"),
        }
        counter!(BREAKER_TRANSITIONS, "to" => to.as_str()).increment(1);
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::advance;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "node-a",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cooldown_ms,
                max_cooldown_ms: cooldown_ms * 4,
                backoff_multiplier: 2.0,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_breaker_allows() {
        let breaker = breaker(3, 10_000);
        assert!(breaker.allow());
        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().next_retry_at, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trip_trial_and_close() {
        let breaker = breaker(3, 10_000);

        for _ in 0..3 {
            assert!(breaker.allow());
            breaker.on_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.failure_count, 3);
        assert_eq!(
            snapshot.next_retry_at,
            Some(Instant::now() + Duration::from_millis(10_000))
        );

        advance(Duration::from_millis(10_001)).await;

        // Exactly one trial call
        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.allow());

        breaker.on_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 0);
        assert!(breaker.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stays_open_until_cooldown_elapses() {
        let breaker = breaker(1, 10_000);
        breaker.on_failure();

        advance(Duration::from_millis(9_999)).await;
        let err = breaker.check().unwrap_err();
        assert_eq!(err.name, "node-a");
        assert_eq!(err.state, CircuitState::Open);
        assert!(err.next_retry_at.is_some());

        advance(Duration::from_millis(1)).await;
        assert!(breaker.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens_with_longer_cooldown() {
        let breaker = breaker(1, 10_000);
        breaker.on_failure();

        let mut previous = breaker.snapshot().cooldown;
        for _ in 0..4 {
            advance(previous).await;
            assert!(breaker.allow());
            breaker.on_failure();
            assert_eq!(breaker.state(), CircuitState::Open);

            let cooldown = breaker.snapshot().cooldown;
            assert!(cooldown >= previous);
            assert!(cooldown <= Duration::from_millis(40_000));
            previous = cooldown;
        }
        assert_eq!(previous, Duration::from_millis(40_000));

        // Not admitted before the grown cooldown elapses
        advance(Duration::from_millis(20_000)).await;
        assert!(!breaker.allow());

        // A successful trial call resets the cooldown
        advance(Duration::from_millis(20_000)).await;
        assert!(breaker.allow());
        breaker.on_success();
        assert_eq!(breaker.snapshot().cooldown, Duration::from_millis(10_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_closed_is_noop() {
        let breaker = breaker(3, 10_000);
        breaker.on_success();
        assert_eq!(breaker.snapshot().failure_count, 0);
        assert_eq!(breaker.state(), CircuitState::Closed);

        // Success resets consecutive failures
        breaker.on_failure();
        breaker.on_failure();
        breaker.on_success();
        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_success_does_not_close_open_circuit() {
        let breaker = breaker(1, 10_000);
        breaker.on_failure();
        breaker.on_success();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_results_do_not_settle_the_trial() {
        let breaker = breaker(1, 10_000);
        let early = breaker.check().unwrap();
        let tripping = breaker.check().unwrap();
        breaker.on_failure_for(tripping);
        assert_eq!(breaker.state(), CircuitState::Open);

        advance(Duration::from_millis(10_000)).await;
        let trial = breaker.check().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // The call admitted while CLOSED finishes during the trial call
        breaker.on_failure_for(early);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.snapshot().cooldown, Duration::from_millis(10_000));
        breaker.on_success_for(early);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.allow());

        breaker.on_success_for(trial);
        assert_eq!(breaker.state(), CircuitState::Closed);

        // An admission from before the trip stays stale after closing
        breaker.on_failure_for(early);
        assert_eq!(breaker.snapshot().failure_count, 0);

        let fresh = breaker.check().unwrap();
        breaker.on_failure_for(fresh);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_trial_under_concurrency() {
        // Zero cooldown: the next allow() is immediately eligible for a trial call
        let breaker = Arc::new(breaker(1, 0));
        breaker.on_failure();

        let admitted = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for _ in 0..16 {
            let breaker = breaker.clone();
            let admitted = admitted.clone();
            handles.push(tokio::spawn(async move {
                if breaker.allow() {
                    admitted.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }
}
