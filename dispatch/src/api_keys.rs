//! API key pool with round-robin selection, per-key quota and cooldown.
//!
//! Cooldown and quota expiry are evaluated lazily whenever a key is
//! considered for selection; there is no background timer. Each key has its
//! own lock so unrelated dispatches never contend on a pool-wide mutex.
//!
//! Quota is charged per outbound call. Acquiring a key charges the first
//! call up front; [`KeyRotation`] charges every further call made with it
//! and hands back a charge that no call used.

use crate::config::{ApiKeyPoolConfig, ValidationError};
use crate::errors::KeyExhaustionError;
use crate::metrics_defs::{KEY_EXHAUSTED, KEY_RATE_LIMITED};
use crate::types::ceil_secs;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use shared::counter;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// A key handed out for one call. The secret is never printed.
#[derive(Clone, PartialEq)]
pub struct ApiKeyLease {
    id: String,
    secret: String,
}

impl ApiKeyLease {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for ApiKeyLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyLease")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug)]
struct KeyState {
    /// Allotment per window, `None` for unlimited keys
    quota: Option<u32>,
    quota_remaining: Option<u32>,
    /// End of the current quota window, set by the first call in the window
    reset_at: Option<Instant>,
    cooldown_until: Option<Instant>,
    last_used: Option<Instant>,
    last_success: Option<Instant>,
    rate_limited_count: u64,
}

impl KeyState {
    fn new(quota: Option<u32>) -> Self {
        Self {
            quota,
            quota_remaining: quota,
            reset_at: None,
            cooldown_until: None,
            last_used: None,
            last_success: None,
            rate_limited_count: 0,
        }
    }

    /// Applies any expiry that has happened by `now`.
    fn refresh(&mut self, now: Instant) {
        if self.cooldown_until.is_some_and(|until| until <= now) {
            self.cooldown_until = None;
        }
        if self.reset_at.is_some_and(|at| at <= now) {
            self.reset_at = None;
            self.quota_remaining = self.quota;
        }
    }

    fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    fn quota_drained(&self) -> bool {
        self.quota_remaining == Some(0)
    }

    /// When this key can next be used, or `None` if it is usable now.
    fn available_at(&self, now: Instant) -> Option<Instant> {
        let cooldown = self.cooldown_until.filter(|until| now < *until);
        let quota = if self.quota_drained() {
            self.reset_at
        } else {
            None
        };
        match (cooldown, quota) {
            (None, None) => None,
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    fn consume(&mut self, now: Instant, window: Duration) {
        if let Some(remaining) = self.quota_remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if self.reset_at.is_none() {
                self.reset_at = Some(now + window);
            }
        }
        self.last_used = Some(now);
    }

    fn refund(&mut self) {
        if let (Some(remaining), Some(quota)) = (self.quota_remaining.as_mut(), self.quota) {
            *remaining = remaining.saturating_add(1).min(quota);
        }
    }
}

struct ApiKeyEntry {
    secret: String,
    state: Mutex<KeyState>,
}

/// Per-key view for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyStatus {
    pub key_id: String,
    pub in_cooldown: bool,
    pub cooldown_remaining_ms: u64,
    pub quota_remaining: Option<u32>,
    pub rate_limited_count: u64,
}

pub struct ApiKeyManager {
    keys: IndexMap<String, ApiKeyEntry>,
    /// Round-robin position, taken modulo the number of keys
    cursor: AtomicUsize,
    default_cooldown: Duration,
    quota_window: Duration,
}

impl ApiKeyManager {
    pub fn from_config(config: &ApiKeyPoolConfig) -> Result<Self, ValidationError> {
        let mut keys = Vec::with_capacity(config.keys.len());
        for key in &config.keys {
            keys.push((key.id.clone(), key.resolve_secret()?, key.quota));
        }
        Ok(Self::new(
            keys,
            config.default_cooldown(),
            config.quota_window(),
        ))
    }

    /// Builds a pool from `(id, secret, quota)` triples. Order is the
    /// round-robin order.
    pub fn new(
        keys: Vec<(String, String, Option<u32>)>,
        default_cooldown: Duration,
        quota_window: Duration,
    ) -> Self {
        let keys = keys
            .into_iter()
            .map(|(id, secret, quota)| {
                let entry = ApiKeyEntry {
                    secret,
                    state: Mutex::new(KeyState::new(quota)),
                };
                (id, entry)
            })
            .collect();

        Self {
            keys,
            cursor: AtomicUsize::new(0),
            default_cooldown,
            quota_window,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Picks the next usable key in round-robin order, starting after the
    /// key handed out last.
    pub fn acquire(&self) -> Result<ApiKeyLease, KeyExhaustionError> {
        let now = Instant::now();
        let total = self.keys.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);

        let mut earliest: Option<Instant> = None;
        let mut keys_in_cooldown = 0;

        for offset in 0..total {
            let index = start.wrapping_add(offset) % total;
            let Some((id, entry)) = self.keys.get_index(index) else {
                continue;
            };

            let mut state = entry.state.lock();
            state.refresh(now);
            match state.available_at(now) {
                None => {
                    state.consume(now, self.quota_window);
                    drop(state);
                    if offset > 0 {
                        // Resume after the key we skipped to
                        self.cursor
                            .fetch_max(start.wrapping_add(offset + 1), Ordering::Relaxed);
                    }
                    tracing::debug!(key_id = %id, "acquired api key");
                    return Ok(ApiKeyLease {
                        id: id.clone(),
                        secret: entry.secret.clone(),
                    });
                }
                Some(at) => {
                    if state.in_cooldown(now) {
                        keys_in_cooldown += 1;
                    }
                    earliest = Some(earliest.map_or(at, |e| e.min(at)));
                }
            }
        }

        let reset_at = earliest.unwrap_or(now);
        let retry_after_secs = ceil_secs(reset_at.saturating_duration_since(now));

        tracing::warn!(
            total_keys = total,
            keys_in_cooldown,
            retry_after_secs,
            "all api keys exhausted"
        );
        counter!(KEY_EXHAUSTED).increment(1);

        Err(KeyExhaustionError {
            reset_at,
            retry_after_secs,
            total_keys: total,
            keys_in_cooldown,
        })
    }

    /// Charges one call to `key_id` if it is usable right now.
    fn try_consume(&self, key_id: &str) -> bool {
        let Some(entry) = self.keys.get(key_id) else {
            return false;
        };
        let now = Instant::now();
        let mut state = entry.state.lock();
        state.refresh(now);
        if state.available_at(now).is_some() {
            return false;
        }
        state.consume(now, self.quota_window);
        true
    }

    /// Returns a charged call that was never made.
    fn refund(&self, key_id: &str) {
        if let Some(entry) = self.keys.get(key_id) {
            let mut state = entry.state.lock();
            state.refresh(Instant::now());
            state.refund();
        }
    }

    /// Puts a key into cooldown for the provider's hint, or the default
    /// cooldown without one. Repeated reports never shorten an existing
    /// cooldown. Unknown ids are ignored.
    pub fn report_rate_limited(&self, key_id: &str, retry_after: Option<Duration>) {
        let Some(entry) = self.keys.get(key_id) else {
            tracing::debug!(key_id, "rate limit reported for unknown api key");
            return;
        };

        let now = Instant::now();
        let until = now + retry_after.unwrap_or(self.default_cooldown);

        let mut state = entry.state.lock();
        state.cooldown_until = Some(state.cooldown_until.map_or(until, |u| u.max(until)));
        state.rate_limited_count += 1;
        drop(state);

        tracing::warn!(
            key_id,
            cooldown_ms = until.saturating_duration_since(now).as_millis() as u64,
            "api key rate limited"
        );
        counter!(KEY_RATE_LIMITED).increment(1);
    }

    pub fn report_success(&self, key_id: &str) {
        let Some(entry) = self.keys.get(key_id) else {
            tracing::debug!(key_id, "success reported for unknown api key");
            return;
        };
        entry.state.lock().last_success = Some(Instant::now());
    }

    pub fn status(&self) -> Vec<KeyStatus> {
        let now = Instant::now();
        self.keys
            .iter()
            .map(|(id, entry)| {
                let mut state = entry.state.lock();
                state.refresh(now);
                let cooldown_remaining_ms = state
                    .cooldown_until
                    .map(|until| until.saturating_duration_since(now).as_millis() as u64)
                    .unwrap_or(0);
                KeyStatus {
                    key_id: id.clone(),
                    in_cooldown: state.in_cooldown(now),
                    cooldown_remaining_ms,
                    quota_remaining: state.quota_remaining,
                    rate_limited_count: state.rate_limited_count,
                }
            })
            .collect()
    }
}

/// The key attached to one dispatch. Attributes outcomes to the active key,
/// charges its quota once per call and swaps it out after a rate limit.
pub struct KeyRotation<'a> {
    manager: Option<&'a ApiKeyManager>,
    lease: Option<ApiKeyLease>,
    /// The active key holds a charge that no call has used yet
    charged: bool,
}

impl<'a> KeyRotation<'a> {
    /// Dispatch without credentials.
    pub fn unpooled() -> Self {
        Self {
            manager: None,
            lease: None,
            charged: false,
        }
    }

    pub fn acquire(manager: &'a ApiKeyManager) -> Result<Self, KeyExhaustionError> {
        let lease = manager.acquire()?;
        Ok(Self {
            manager: Some(manager),
            lease: Some(lease),
            charged: true,
        })
    }

    pub fn lease(&self) -> Option<&ApiKeyLease> {
        self.lease.as_ref()
    }

    pub fn key_id(&self) -> Option<&str> {
        self.lease.as_ref().map(ApiKeyLease::id)
    }

    pub fn is_pooled(&self) -> bool {
        self.manager.is_some()
    }

    /// Charges the next call to the active key. A key whose quota ran out
    /// mid-dispatch is replaced by the next usable one.
    pub fn charge_call(&mut self) -> Result<(), KeyExhaustionError> {
        let Some(manager) = self.manager else {
            return Ok(());
        };
        if std::mem::take(&mut self.charged) {
            return Ok(());
        }
        if self
            .lease
            .as_ref()
            .is_some_and(|lease| manager.try_consume(lease.id()))
        {
            return Ok(());
        }

        let lease = manager.acquire()?;
        tracing::debug!(
            from = ?self.key_id(),
            to = %lease.id(),
            "api key replaced mid-dispatch"
        );
        self.lease = Some(lease);
        Ok(())
    }

    /// Marks the last charge as unused, so the next call or the end of the
    /// dispatch settles it.
    pub fn refund_call(&mut self) {
        if self.manager.is_some() && self.lease.is_some() {
            self.charged = true;
        }
    }

    pub fn record_success(&self) {
        if let (Some(manager), Some(lease)) = (self.manager, &self.lease) {
            manager.report_success(lease.id());
        }
    }

    /// Cools down the active key without replacing it.
    pub fn report_rate_limited(&self, retry_after: Option<Duration>) {
        if let (Some(manager), Some(lease)) = (self.manager, &self.lease) {
            manager.report_rate_limited(lease.id(), retry_after);
        }
    }

    /// Cools down the active key and acquires a replacement.
    pub fn rotate_after_rate_limit(
        &mut self,
        retry_after: Option<Duration>,
    ) -> Result<(), KeyExhaustionError> {
        let Some(manager) = self.manager else {
            return Ok(());
        };
        if let Some(lease) = self.lease.take() {
            if std::mem::take(&mut self.charged) {
                manager.refund(lease.id());
            }
            manager.report_rate_limited(lease.id(), retry_after);
        }
        self.lease = Some(manager.acquire()?);
        self.charged = true;
        Ok(())
    }
}

impl Drop for KeyRotation<'_> {
    fn drop(&mut self) {
        if let (true, Some(manager), Some(lease)) = (self.charged, self.manager, &self.lease) {
            manager.refund(lease.id());
        }
    }
}
