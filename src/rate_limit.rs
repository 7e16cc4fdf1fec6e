use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

const TOKEN_EPSILON: f64 = 1e-9;
const MAX_BACKOFF_DOUBLINGS: u32 = 16;

#[derive(Debug, Clone)]
pub struct RatePolicy {
    pub interval: Duration,
    pub burst: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub backoff_reset: Duration,
}

impl RatePolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        let backoff_base = Duration::from_millis(config.backoff_base_ms.max(1));
        Self {
            interval: Duration::from_millis(config.rate_interval_ms.max(1)),
            burst: config.rate_burst.max(1),
            backoff_base,
            backoff_max: Duration::from_millis(config.backoff_max_ms).max(backoff_base),
            backoff_reset: Duration::from_secs(config.backoff_reset_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateBudgetSnapshot {
    pub available_tokens: f64,
    pub backoff_remaining_ms: u64,
    pub consecutive_throttles: u32,
    pub issued: u64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    backoff_until: Option<Instant>,
    consecutive_throttles: u32,
    last_throttle: Option<Instant>,
}

impl BucketState {
    fn refill(&mut self, now: Instant, policy: &RatePolicy) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let earned = elapsed.as_secs_f64() / policy.interval.as_secs_f64();
        self.tokens = (self.tokens + earned).min(policy.burst as f64);
        self.last_refill = now;
    }

    /// Takes one token, or reports the earliest instant one could be ready.
    fn try_take(&mut self, now: Instant, policy: &RatePolicy) -> Result<(), Instant> {
        if let Some(until) = self.backoff_until {
            if now < until {
                return Err(until);
            }
            self.backoff_until = None;
            self.last_refill = until;
            self.tokens = self.tokens.max(1.0);
        }
        self.refill(now, policy);
        if self.tokens + TOKEN_EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            return Ok(());
        }
        let missing = 1.0 - self.tokens;
        Err(now + policy.interval.mul_f64(missing))
    }
}

/// Process-wide token bucket shared by every provider operation.
pub struct RateLimiter {
    policy: RatePolicy,
    state: Mutex<BucketState>,
    issued: AtomicU64,
}

impl RateLimiter {
    pub fn new(policy: RatePolicy) -> Self {
        let state = BucketState {
            tokens: policy.burst as f64,
            last_refill: Instant::now(),
            backoff_until: None,
            consecutive_throttles: 0,
            last_throttle: None,
        };
        Self {
            policy,
            state: Mutex::new(state),
            issued: AtomicU64::new(0),
        }
    }

    /// Waits for a token for at most `patience`.
    ///
    /// The bucket is only mutated while the lock is held and never across an
    /// await point, so dropping this future leaves the budget untouched.
    pub async fn acquire(&self, patience: Duration) -> AppResult<()> {
        let deadline = Instant::now() + patience;
        loop {
            let ready_at = {
                let mut state = self.state.lock();
                match state.try_take(Instant::now(), &self.policy) {
                    Ok(()) => {
                        self.issued.fetch_add(1, Ordering::SeqCst);
                        return Ok(());
                    }
                    Err(ready_at) => ready_at,
                }
            };
            if ready_at > deadline {
                debug!(
                    target: "rate_limiter",
                    patience_ms = patience.as_millis() as u64,
                    "token not available before deadline"
                );
                return Err(AppError::RateLimitTimeout(patience));
            }
            sleep_until(ready_at).await;
        }
    }

    /// Records an upstream throttling signal and suspends issuance.
    pub fn on_throttled(&self, retry_after: Option<Duration>) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.consecutive_throttles = state.consecutive_throttles.saturating_add(1);
        let doublings = (state.consecutive_throttles - 1).min(MAX_BACKOFF_DOUBLINGS);
        let mut delay = self
            .policy
            .backoff_base
            .saturating_mul(1_u32 << doublings)
            .min(self.policy.backoff_max);
        if let Some(hint) = retry_after {
            delay = delay.max(hint.min(self.policy.backoff_max));
        }
        let until = now + delay;
        state.backoff_until = Some(match state.backoff_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
        state.tokens = 0.0;
        state.last_refill = now;
        state.last_throttle = Some(now);
        warn!(
            target: "rate_limiter",
            consecutive = state.consecutive_throttles,
            delay_ms = delay.as_millis() as u64,
            "provider throttled; suspending token issuance"
        );
    }

    /// Records a successful provider call; clears the backoff ladder once the
    /// last throttle is older than the reset window.
    pub fn on_success(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.consecutive_throttles == 0 {
            return;
        }
        let quiet_for = state
            .last_throttle
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or(Duration::MAX);
        if quiet_for >= self.policy.backoff_reset {
            info!(
                target: "rate_limiter",
                previous = state.consecutive_throttles,
                "sustained success; backoff reset to base interval"
            );
            state.consecutive_throttles = 0;
        }
    }

    pub fn snapshot(&self) -> RateBudgetSnapshot {
        let now = Instant::now();
        let mut state = self.state.lock();
        let backoff_remaining = state
            .backoff_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default();
        if backoff_remaining.is_zero() {
            state.refill(now, &self.policy);
        }
        RateBudgetSnapshot {
            available_tokens: state.tokens,
            backoff_remaining_ms: backoff_remaining.as_millis() as u64,
            consecutive_throttles: state.consecutive_throttles,
            issued: self.issued.load(Ordering::SeqCst),
        }
    }
}
