//! Dead-Letter Queue (C9, §4.9) — terminal home for jobs that exhaust their
//! retry budget, with an operator-triggered retry/purge surface.

use chrono::Utc;
use indexmap::IndexMap;
use std::sync::Arc;
use uuid::Uuid;

use tokio::sync::RwLock;

use crate::domain::{DeadLetterEntry, Job};

pub struct DeadLetterQueue {
    entries: RwLock<IndexMap<String, DeadLetterEntry>>,
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(IndexMap::new()),
        }
    }

    pub async fn enqueue(&self, job: Job, reason: String) -> DeadLetterEntry {
        let entry = DeadLetterEntry {
            id: Uuid::new_v4().to_string(),
            job,
            reason,
            enqueued_at: Utc::now(),
            retry_requested: false,
        };
        self.entries.write().await.insert(entry.id.clone(), entry.clone());
        entry
    }

    pub async fn get(&self, entry_id: &str) -> Option<DeadLetterEntry> {
        self.entries.read().await.get(entry_id).cloned()
    }

    pub async fn get_by_job_id(&self, job_id: &str) -> Option<DeadLetterEntry> {
        self.entries
            .read()
            .await
            .values()
            .find(|e| e.job.id() == job_id)
            .cloned()
    }

    pub async fn list(&self) -> Vec<DeadLetterEntry> {
        self.entries.read().await.values().cloned().collect()
    }

    /// Operator requests a retry — the caller (Orchestrator) is responsible
    /// for re-enqueueing the underlying job and then `remove`-ing this entry.
    pub async fn mark_for_retry(&self, entry_id: &str) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get_mut(entry_id) {
            Some(e) => {
                e.retry_requested = true;
                true
            }
            None => false,
        }
    }

    pub async fn get_pending_retry(&self) -> Vec<DeadLetterEntry> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.retry_requested)
            .cloned()
            .collect()
    }

    pub async fn remove(&self, entry_id: &str) -> Option<DeadLetterEntry> {
        self.entries.write().await.shift_remove(entry_id)
    }

    pub async fn purge_all(&self) -> usize {
        let mut entries = self.entries.write().await;
        let count = entries.len();
        entries.clear();
        count
    }

    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }
}

pub type SharedDeadLetterQueue = Arc<DeadLetterQueue>;
