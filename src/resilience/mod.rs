//! Resilience Service (C11, §4.11) — retry/circuit-breaker/timeout wrapper
//! around unreliable operations (agent dispatch, submission, etc.).

pub mod backoff;
pub mod circuit_breaker;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::warn;

use crate::config::ResilienceConfig;
use crate::error::{OrbitMeshError, Result};
use backoff::{backoff_sleep, BackoffConfig};
use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

/// Per-key circuit breakers plus the shared retry/timeout configuration.
///
/// Cheaply cloneable (`Arc`-backed breaker map).
#[derive(Clone)]
pub struct ResilienceService {
    breakers: Arc<RwLock<HashMap<String, CircuitBreaker>>>,
    backoff: BackoffConfig,
    max_retry_attempts: u32,
    timeout: Duration,
    breaker_config: CircuitBreakerConfig,
}

impl ResilienceService {
    pub fn new(config: &ResilienceConfig) -> Self {
        Self {
            breakers: Arc::new(RwLock::new(HashMap::new())),
            backoff: BackoffConfig {
                base_ms: config.base_delay.as_millis() as u64,
                ..BackoffConfig::default()
            },
            max_retry_attempts: config.max_retry_attempts,
            timeout: config.timeout,
            breaker_config: CircuitBreakerConfig {
                failure_threshold: config.failure_threshold,
                success_threshold: 2,
                timeout: config.break_duration,
            },
        }
    }

    async fn breaker_for(&self, key: &str) -> CircuitBreaker {
        if let Some(b) = self.breakers.read().await.get(key) {
            return b.clone();
        }
        let mut guard = self.breakers.write().await;
        guard
            .entry(key.to_string())
            .or_insert_with(|| CircuitBreaker::new(key, self.breaker_config.clone()))
            .clone()
    }

    /// Retry `f` with exponential backoff + jitter, up to `max_retry_attempts`.
    pub async fn execute_with_retry<F, Fut, T>(&self, op_name: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut last_err = None;
        for attempt in 0..self.max_retry_attempts {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if attempt + 1 < self.max_retry_attempts {
                        warn!(op = op_name, attempt, err = %e, "attempt failed — retrying");
                        backoff_sleep(attempt, &self.backoff).await;
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.expect("loop runs at least once since max_retry_attempts >= 1"))
    }

    /// Bound `f`'s execution time; maps elapsed-deadline to `Timeout`.
    pub async fn execute_with_timeout<F, T>(&self, job_or_op_id: &str, f: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.timeout, f).await {
            Ok(inner) => inner,
            Err(_) => Err(OrbitMeshError::Timeout(job_or_op_id.to_string())),
        }
    }

    /// Gate `f` behind the named circuit breaker.
    pub async fn execute_with_circuit_breaker<F, Fut, T>(&self, key: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let breaker = self.breaker_for(key).await;
        if !breaker.is_allowed().await {
            return Err(OrbitMeshError::CircuitOpen(key.to_string()));
        }
        match f().await {
            Ok(v) => {
                breaker.record_success().await;
                Ok(v)
            }
            Err(e) => {
                breaker.record_failure().await;
                Err(e)
            }
        }
    }

    /// Combine all three: retry(timeout(circuit_breaker(f))).
    pub async fn execute_with_resilience<F, Fut, T>(&self, key: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.execute_with_retry(key, || {
            let key = key.to_string();
            let fut = f();
            async move {
                let breaker = self.breaker_for(&key).await;
                if !breaker.is_allowed().await {
                    return Err(OrbitMeshError::CircuitOpen(key.clone()));
                }
                match tokio::time::timeout(self.timeout, fut).await {
                    Ok(Ok(v)) => {
                        breaker.record_success().await;
                        Ok(v)
                    }
                    Ok(Err(e)) => {
                        breaker.record_failure().await;
                        Err(e)
                    }
                    Err(_) => {
                        breaker.record_failure().await;
                        Err(OrbitMeshError::Timeout(key.clone()))
                    }
                }
            }
        })
        .await
    }

    pub async fn is_circuit_open(&self, key: &str) -> bool {
        self.breaker_for(key).await.state().await == CircuitState::Open
    }
}
