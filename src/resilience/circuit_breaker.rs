//! Circuit breaker pattern (§4.11) — protects the server↔agent dispatch path
//! and other unreliable operations from cascading failures.
//!
//! # State machine
//!
//! ```text
//! Closed ──(failure_threshold failures)──► Open
//!   ▲                                        │
//!   └──(success_threshold successes)──── HalfOpen ◄─(timeout elapsed)──┘
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Consecutive successes (from HalfOpen) before the circuit closes.
    pub success_threshold: u32,
    /// How long the circuit stays Open before a probe is allowed.
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
        }
    }
}

/// Thread-safe circuit breaker. Cheaply cloneable — all clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<RwLock<BreakerInner>>,
    config: Arc<CircuitBreakerConfig>,
    name: Arc<str>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(BreakerInner::new())),
            config: Arc::new(config),
            name: Arc::from(name.into().as_str()),
        }
    }

    /// Returns `true` if a call should be attempted.
    pub async fn is_allowed(&self) -> bool {
        {
            let inner = self.inner.read().await;
            if inner.state == CircuitState::Closed || inner.state == CircuitState::HalfOpen {
                return true;
            }
            if let Some(last_failure) = inner.last_failure {
                if last_failure.elapsed() < self.config.timeout {
                    return false;
                }
            }
        }

        let mut inner = self.inner.write().await;
        if inner.state == CircuitState::Open {
            if let Some(last_failure) = inner.last_failure {
                if last_failure.elapsed() >= self.config.timeout {
                    info!(breaker = %self.name, "circuit breaker -> HalfOpen (probe)");
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    return true;
                }
            }
        }
        inner.state != CircuitState::Open
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    info!(breaker = %self.name, "circuit breaker -> Closed (recovered)");
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.last_failure = None;
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.write().await;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(breaker = %self.name, failures = inner.failure_count, "circuit breaker -> Open");
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "circuit breaker -> Open (probe failed)");
                inner.state = CircuitState::Open;
                inner.success_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state.clone()
    }

    pub async fn failure_count(&self) -> u32 {
        self.inner.read().await.failure_count
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker").field("name", &self.name).finish()
    }
}
