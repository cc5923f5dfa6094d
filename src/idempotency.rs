//! Idempotency Service (C8, §4.8) — deduplicates job submissions that share
//! an `idempotency_key`, caching the first submission's result for replay.
//!
//! Grounded on the `RwLock<HashMap<...>>` record-store shape used throughout
//! the registry/store, with an advisory lock-holder field standing in for
//! the distributed lock a multi-node deployment would need (§9 Open
//! Question: single-process here, so an in-memory advisory lock suffices).

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::domain::{IdempotencyEntry, SubmissionResult};
use crate::error::{OrbitMeshError, Result};

pub struct IdempotencyService {
    entries: RwLock<HashMap<String, IdempotencyEntry>>,
    ttl: Duration,
}

impl IdempotencyService {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Attempt to claim `key` for `holder` (e.g. a request id). Returns
    /// `Ok(None)` when the caller has the lock and should proceed with a
    /// fresh submission; `Ok(Some(result))` when a prior submission already
    /// completed and its cached result should be replayed; `Err(DuplicateInFlight)`
    /// when another caller holds the lock and hasn't resolved yet (§7).
    pub async fn try_acquire_lock(&self, key: &str, holder: &str) -> Result<Option<SubmissionResult>> {
        let mut entries = self.entries.write().await;
        self.evict_expired_locked(&mut entries);

        match entries.get(key) {
            Some(entry) => {
                if let Some(result) = &entry.submission_result {
                    return Ok(Some(result.clone()));
                }
                Err(OrbitMeshError::DuplicateInFlight(key.to_string()))
            }
            None => {
                entries.insert(
                    key.to_string(),
                    IdempotencyEntry {
                        key: key.to_string(),
                        lock_holder: Some(holder.to_string()),
                        submission_result: None,
                        expires_at: Utc::now() + chrono::Duration::from_std(self.ttl).unwrap_or_default(),
                    },
                );
                Ok(None)
            }
        }
    }

    /// Release a lock without caching a result — used when submission itself
    /// failed validation before a job was ever created.
    pub async fn release_lock(&self, key: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(key) {
            if entry.submission_result.is_none() {
                entries.remove(key);
            }
        }
    }

    /// Cache the resolved submission result, releasing the lock.
    pub async fn set_result(&self, key: &str, result: SubmissionResult) {
        let mut entries = self.entries.write().await;
        let expires_at = Utc::now() + chrono::Duration::from_std(self.ttl).unwrap_or_default();
        entries.insert(
            key.to_string(),
            IdempotencyEntry {
                key: key.to_string(),
                lock_holder: None,
                submission_result: Some(result),
                expires_at,
            },
        );
    }

    pub async fn get_result(&self, key: &str) -> Option<SubmissionResult> {
        self.entries
            .read()
            .await
            .get(key)
            .and_then(|e| e.submission_result.clone())
    }

    fn evict_expired_locked(&self, entries: &mut HashMap<String, IdempotencyEntry>) {
        let now = Utc::now();
        entries.retain(|_, e| e.expires_at > now);
    }

    /// Sweep expired entries — intended for a periodic background call
    /// alongside the Agent Registry's `evict_expired` (§9).
    pub async fn evict_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        self.evict_expired_locked(&mut entries);
        before - entries.len()
    }
}

pub type SharedIdempotencyService = Arc<IdempotencyService>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobStatus;

    fn result(job_id: &str) -> SubmissionResult {
        SubmissionResult {
            job_id: job_id.to_string(),
            success: true,
            status: Some(JobStatus::Pending),
            error: None,
        }
    }

    #[tokio::test]
    async fn second_submission_sees_duplicate_in_flight() {
        let svc = IdempotencyService::new(Duration::from_secs(60));
        assert!(svc.try_acquire_lock("key-1", "req-1").await.unwrap().is_none());
        let second = svc.try_acquire_lock("key-1", "req-2").await;
        assert!(matches!(second, Err(OrbitMeshError::DuplicateInFlight(_))));
    }

    #[tokio::test]
    async fn cached_result_is_replayed() {
        let svc = IdempotencyService::new(Duration::from_secs(60));
        svc.try_acquire_lock("key-1", "req-1").await.unwrap();
        svc.set_result("key-1", result("job-1")).await;

        let replay = svc.try_acquire_lock("key-1", "req-2").await.unwrap();
        assert_eq!(replay.unwrap().job_id, "job-1");
    }

    #[tokio::test]
    async fn expired_entries_are_evicted() {
        let svc = IdempotencyService::new(Duration::from_millis(10));
        svc.try_acquire_lock("key-1", "req-1").await.unwrap();
        svc.set_result("key-1", result("job-1")).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(svc.evict_expired().await, 1);
        assert!(svc.get_result("key-1").await.is_none());
    }

    #[tokio::test]
    async fn release_without_result_clears_lock() {
        let svc = IdempotencyService::new(Duration::from_secs(60));
        svc.try_acquire_lock("key-1", "req-1").await.unwrap();
        svc.release_lock("key-1").await;
        assert!(svc.try_acquire_lock("key-1", "req-2").await.unwrap().is_none());
    }
}
