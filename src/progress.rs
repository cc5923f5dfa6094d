//! Progress Service (C10, §4.10) — latest-value store for per-job progress,
//! subscribable.
//!
//! Grounded on `tokio::sync::watch`'s latest-value semantics: a `watch`
//! channel already drops every update but the most recent one for a slow
//! receiver, which is exactly "back-pressure: drop oldest for slow
//! subscribers, preserving latest value" (§4.10) — no custom ring buffer
//! needed.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

use crate::domain::JobProgress;

/// One `watch` channel per job id. The sender is kept alongside the receiver
/// so `report` can push updates after the first subscriber has gone away.
struct Slot {
    tx: watch::Sender<JobProgress>,
}

#[derive(Default)]
pub struct ProgressService {
    slots: RwLock<HashMap<String, Slot>>,
}

impl ProgressService {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Store `progress` as the latest value for its job and publish it to
    /// subscribers. Creates the channel lazily on first report.
    pub async fn report(&self, progress: JobProgress) {
        let progress = progress.clamped();
        let job_id = progress.job_id.clone();

        if let Some(slot) = self.slots.read().await.get(&job_id) {
            // `send` never blocks and always keeps only the latest value —
            // a lagging subscriber simply reads the newest progress on its
            // next poll instead of draining a queue.
            let _ = slot.tx.send(progress);
            return;
        }

        let mut slots = self.slots.write().await;
        match slots.get(&job_id) {
            Some(slot) => {
                let _ = slot.tx.send(progress);
            }
            None => {
                let (tx, _rx) = watch::channel(progress);
                slots.insert(job_id, Slot { tx });
            }
        }
    }

    /// Latest progress reported for `job_id`, if any.
    pub async fn get(&self, job_id: &str) -> Option<JobProgress> {
        self.slots
            .read()
            .await
            .get(job_id)
            .map(|slot| slot.tx.borrow().clone())
    }

    /// Subscribe to live updates for `job_id`. `None` if nothing has been
    /// reported yet — callers should `report` (or wait for one) before
    /// subscribing, or treat `None` as "no progress yet".
    pub async fn subscribe(&self, job_id: &str) -> Option<watch::Receiver<JobProgress>> {
        self.slots.read().await.get(job_id).map(|slot| slot.tx.subscribe())
    }

    /// Drop the stored progress for a job — called once a job reaches a
    /// terminal state (§4.5 `handleResult` "Completed -> complete; clear
    /// progress").
    pub async fn clear(&self, job_id: &str) {
        self.slots.write().await.remove(job_id);
    }
}

pub type SharedProgressService = Arc<ProgressService>;
