//! Retry policies with jittered exponential backoff and per-endpoint circuit
//! breakers. Transient failures are retried inside the caller's deadline;
//! everything else propagates immediately.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::constants::{
    BACKOFF_MULTIPLIER, BASE_RETRY_DELAY_MS, MAX_RETRY_ATTEMPTS, MAX_RETRY_DELAY_MS,
    RETRY_JITTER_FACTOR,
};
use crate::error::{BotError, BotResult};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRY_ATTEMPTS,
            base_delay_ms: BASE_RETRY_DELAY_MS,
            max_delay_ms: MAX_RETRY_DELAY_MS,
            backoff_multiplier: BACKOFF_MULTIPLIER,
            jitter_factor: RETRY_JITTER_FACTOR,
        }
    }
}

impl RetryPolicy {
    /// Policy for websocket reconnects: many attempts, low ceiling.
    pub fn reconnect() -> Self {
        Self {
            max_retries: u32::MAX,
            base_delay_ms: 100,
            max_delay_ms: crate::constants::WS_RECONNECT_CEILING_MS,
            backoff_multiplier: 1.6,
            jitter_factor: 0.2,
        }
    }

    /// Policy for bundle submission: few fast attempts inside the block
    /// deadline.
    pub fn submission() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 50,
            max_delay_ms: 800,
            backoff_multiplier: 2.0,
            jitter_factor: 0.15,
        }
    }

    /// Delay before the given attempt (0-based), jittered.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = exp.min(self.max_delay_ms as f64);
        let jitter = capped * self.jitter_factor * (fastrand::f64() * 2.0 - 1.0);
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    /// Run `op` until it succeeds, errors permanently, or attempts/deadline
    /// are exhausted. The deadline bounds total wall clock including sleeps.
    pub async fn run<T, F, Fut>(&self, label: &str, deadline: Duration, mut op: F) -> BotResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BotResult<T>>,
    {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            let remaining = deadline
                .checked_sub(started.elapsed())
                .ok_or(BotError::Timeout(deadline))?;
            match tokio::time::timeout(remaining, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) if err.is_transient() && attempt < self.max_retries => {
                    let delay = self.delay_for_attempt(attempt);
                    debug!(
                        "{label}: transient failure (attempt {}): {err}; retrying in {:?}",
                        attempt + 1,
                        delay
                    );
                    attempt += 1;
                    if started.elapsed() + delay >= deadline {
                        return Err(BotError::Timeout(deadline));
                    }
                    tokio::time::sleep(delay).await;
                }
                Ok(Err(err)) => return Err(err),
                Err(_) => return Err(BotError::Timeout(deadline)),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct BreakerEntry {
    failure_count: u32,
    failure_threshold: u32,
    reset_timeout: Duration,
    last_failure: Option<Instant>,
    state: CircuitState,
}

impl BreakerEntry {
    fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_count: 0,
            failure_threshold,
            reset_timeout,
            last_failure: None,
            state: CircuitState::Closed,
        }
    }
}

/// Per-endpoint circuit breakers keyed by an arbitrary label (an RPC URL, a
/// relay name). Distinct from the Risk Governor: this protects transports,
/// not capital.
#[derive(Clone)]
pub struct CircuitBreakers {
    entries: Arc<Mutex<HashMap<String, BreakerEntry>>>,
    default_threshold: u32,
    default_reset: Duration,
}

impl CircuitBreakers {
    pub fn new(default_threshold: u32, default_reset: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            default_threshold,
            default_reset,
        }
    }

    /// Whether the endpoint may be used right now. Open breakers flip to
    /// half-open after their reset timeout.
    pub async fn allows(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| BreakerEntry::new(self.default_threshold, self.default_reset));
        match entry.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = entry
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= entry.reset_timeout {
                    debug!("circuit breaker {key}: open -> half-open");
                    entry.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn record_success(&self, key: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(key) {
            if entry.state != CircuitState::Closed {
                debug!("circuit breaker {key}: recovered, closing");
            }
            entry.failure_count = 0;
            entry.state = CircuitState::Closed;
        }
    }

    pub async fn record_failure(&self, key: &str) {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| BreakerEntry::new(self.default_threshold, self.default_reset));
        entry.failure_count += 1;
        entry.last_failure = Some(Instant::now());
        if entry.failure_count >= entry.failure_threshold {
            if entry.state != CircuitState::Open {
                warn!(
                    "⚡ circuit breaker {key}: opening after {} failures",
                    entry.failure_count
                );
            }
            entry.state = CircuitState::Open;
        }
    }

    pub async fn state_of(&self, key: &str) -> Option<CircuitState> {
        self.entries.lock().await.get(key).map(|e| e.state)
    }
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            jitter_factor: 0.0,
            ..Default::default()
        };
        let d0 = policy.delay_for_attempt(0);
        let d1 = policy.delay_for_attempt(1);
        let d20 = policy.delay_for_attempt(20);
        assert!(d0 < d1);
        assert_eq!(d20, Duration::from_millis(policy.max_delay_ms));
    }

    #[tokio::test]
    async fn test_run_retries_transient_then_succeeds() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            base_delay_ms: 1,
            ..Default::default()
        };
        let result = policy
            .run("test_op", Duration::from_secs(5), || async {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(BotError::TransientNetwork("flaky".into()))
                } else {
                    Ok(42u32)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_propagates_permanent_errors() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let result: BotResult<()> = policy
            .run("test_op", Duration::from_secs(1), || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(BotError::Protocol("bad rpc".into()))
            })
            .await;
        assert!(matches!(result, Err(BotError::Protocol(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_breaker_opens_and_half_opens() {
        let breakers = CircuitBreakers::new(3, Duration::from_millis(10));
        for _ in 0..3 {
            breakers.record_failure("rpc").await;
        }
        assert!(!breakers.allows("rpc").await);
        tokio::time::sleep(Duration::from_millis(15)).await;
        // After the reset timeout one probe is allowed.
        assert!(breakers.allows("rpc").await);
        assert_eq!(breakers.state_of("rpc").await, Some(CircuitState::HalfOpen));
        breakers.record_success("rpc").await;
        assert_eq!(breakers.state_of("rpc").await, Some(CircuitState::Closed));
    }
}
