//! Circuit breakers and retry policies for external dependencies
//!
//! Every fallible external call goes through a `CircuitBreaker` plus a
//! `RetryPolicy`. Breakers are explicit per-dependency objects shared by
//! `Arc`, never globals, so tests can drive their state directly. State is
//! held in atomics; a restart resets every breaker to closed.

use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ResilienceConfig;

/// Breaker state machine position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    fn from_u8(v: u8) -> CircuitState {
        match v {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Point-in-time view of one breaker, for health reporting
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub times_opened: u64,
}

/// Per-dependency circuit breaker.
///
/// Closed counts consecutive failures and opens at the threshold. Open
/// rejects calls until the recovery timeout elapses, then admits exactly
/// one half-open probe; the probe's outcome closes or reopens the circuit.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery: Duration,

    state: AtomicU8,
    consecutive_failures: AtomicU32,
    /// Unix millis of the last failure, 0 when none recorded
    last_failure_ms: AtomicI64,
    /// Unix millis of the most recent transition to open
    opened_at_ms: AtomicI64,
    times_opened: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            recovery,
            state: AtomicU8::new(CircuitState::Closed.as_u8()),
            consecutive_failures: AtomicU32::new(0),
            last_failure_ms: AtomicI64::new(0),
            opened_at_ms: AtomicI64::new(0),
            times_opened: AtomicU64::new(0),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &ResilienceConfig) -> Self {
        Self::new(
            name,
            config.failure_threshold,
            Duration::from_secs(config.recovery_timeout_secs),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Ask permission to call the dependency. Returns false while open or
    /// while another caller holds the half-open probe. The caller that
    /// receives true after the recovery timeout is the probe and must
    /// report its outcome with exactly one record call.
    pub fn try_acquire(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let opened = self.opened_at_ms.load(Ordering::SeqCst);
                let elapsed_ms = Utc::now().timestamp_millis().saturating_sub(opened);
                if elapsed_ms < self.recovery.as_millis() as i64 {
                    return false;
                }

                // one caller wins the probe slot
                let won = self
                    .state
                    .compare_exchange(
                        CircuitState::Open.as_u8(),
                        CircuitState::HalfOpen.as_u8(),
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok();
                if won {
                    debug!(breaker = %self.name, "half-open, probing dependency");
                }
                won
            }
        }
    }

    /// Report a successful call. Closes the circuit from any state.
    pub fn record_success(&self) {
        let prev = CircuitState::from_u8(
            self.state
                .swap(CircuitState::Closed.as_u8(), Ordering::SeqCst),
        );
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if prev != CircuitState::Closed {
            info!(breaker = %self.name, "circuit closed after successful probe");
        }
    }

    /// Report a failed call. A half-open probe failure reopens
    /// immediately; otherwise the circuit opens once the consecutive
    /// failure count reaches the threshold.
    pub fn record_failure(&self) {
        self.last_failure_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;

        match self.state() {
            CircuitState::HalfOpen => {
                self.open("probe failed");
            }
            CircuitState::Closed if failures >= self.failure_threshold => {
                self.open("failure threshold reached");
            }
            _ => {
                debug!(
                    breaker = %self.name,
                    failures,
                    threshold = self.failure_threshold,
                    "dependency failure recorded"
                );
            }
        }
    }

    fn open(&self, reason: &str) {
        let prev = self
            .state
            .swap(CircuitState::Open.as_u8(), Ordering::SeqCst);
        self.opened_at_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
        if prev != CircuitState::Open.as_u8() {
            self.times_opened.fetch_add(1, Ordering::SeqCst);
            warn!(
                breaker = %self.name,
                reason,
                recovery_secs = self.recovery.as_secs(),
                "circuit opened, skipping calls"
            );
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let last_ms = self.last_failure_ms.load(Ordering::SeqCst);
        BreakerSnapshot {
            name: self.name.clone(),
            state: self.state(),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            last_failure: (last_ms > 0)
                .then(|| Utc.timestamp_millis_opt(last_ms).single())
                .flatten(),
            times_opened: self.times_opened.load(Ordering::SeqCst),
        }
    }

    /// Run an operation through this breaker with retries. A skipped call
    /// never invokes the operation. A half-open probe gets exactly one
    /// attempt regardless of the policy.
    pub async fn call<T, E, F, Fut>(&self, policy: &RetryPolicy, mut op: F) -> CallOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        if !self.try_acquire() {
            debug!(breaker = %self.name, "call skipped, circuit not accepting");
            return CallOutcome::Skipped;
        }

        let probing = self.state() == CircuitState::HalfOpen;
        let attempts = if probing { 1 } else { policy.max_attempts.max(1) };

        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => {
                    self.record_success();
                    return CallOutcome::Success(value);
                }
                Err(e) => {
                    self.record_failure();
                    attempt += 1;
                    if attempt >= attempts || self.state() == CircuitState::Open {
                        return CallOutcome::Failed(e);
                    }
                    let delay = policy.delay_for(attempt - 1);
                    debug!(
                        breaker = %self.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Result of a breaker-guarded call
#[derive(Debug)]
pub enum CallOutcome<T, E> {
    Success(T),
    /// Circuit open, the dependency was not contacted
    Skipped,
    /// All attempts failed; the last error
    Failed(E),
}

impl<T, E> CallOutcome<T, E> {
    pub fn success(self) -> Option<T> {
        match self {
            CallOutcome::Success(v) => Some(v),
            _ => None,
        }
    }

    pub fn was_skipped(&self) -> bool {
        matches!(self, CallOutcome::Skipped)
    }
}

/// Reusable retry schedule: exponential backoff with a cap and jitter.
/// One policy value is shared by every external call site, parameterized
/// per dependency from `ResilienceConfig`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay randomized away, in [0, 1]
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before retry number `retry` (0-based). Doubles per retry,
    /// capped, then jittered by up to +/- jitter/2.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exp_ms = base_ms.saturating_mul(1 << retry.min(5));
        let capped_ms = exp_ms.min(self.max_delay.as_millis() as u64);

        if self.jitter <= 0.0 {
            return Duration::from_millis(capped_ms);
        }

        let spread = rand::thread_rng().gen::<f64>() - 0.5;
        let jittered = capped_ms as f64 * (1.0 + spread * self.jitter);
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from_config(&ResilienceConfig::default())
    }
}
