//! Router (C3, §4.3) — selects a candidate agent for a job by capability,
//! tag, and pattern filtering, then load-balances among the survivors.
//!
//! Grounded on `agents::routing::route_agent` / `agents::capabilities`'s
//! "filter by what's required, then select_provider by load" two-stage shape.

use crate::domain::{Agent, AgentStatus, JobRequest};
use crate::registry::SharedAgentRegistry;
use crate::store::SharedJobStore;

/// Stateless — holds only shared handles to the registry and store it reads.
#[derive(Clone)]
pub struct Router {
    registry: SharedAgentRegistry,
    jobs: SharedJobStore,
}

impl Router {
    pub fn new(registry: SharedAgentRegistry, jobs: SharedJobStore) -> Self {
        Self { registry, jobs }
    }

    /// Select the best `Ready` agent for `request`, or `None` if nothing
    /// currently qualifies (§4.3: caller leaves the job `Pending` and retries
    /// on the next poll).
    pub async fn select(&self, request: &JobRequest) -> Option<Agent> {
        let candidates = self.eligible(request).await;
        self.least_loaded(candidates).await
    }

    async fn eligible(&self, request: &JobRequest) -> Vec<Agent> {
        let pool = match &request.pattern {
            Some(pattern) if pattern.starts_with("group:") => {
                self.registry.list_by_group(&pattern["group:".len()..]).await
            }
            Some(pattern) => {
                let mut all = self.registry.list().await;
                all.retain(|a| glob_match(pattern, &a.id));
                all
            }
            None => self.registry.list().await,
        };

        pool.into_iter()
            .filter(|a| a.status == AgentStatus::Ready)
            .filter(|a| a.satisfies_capabilities(&request.required_capabilities))
            .filter(|a| a.satisfies_tags(&request.required_tags))
            .collect()
    }

    /// Tie-break by fewest currently-assigned non-terminal jobs, then by
    /// earliest `registered_at` (§4.3).
    async fn least_loaded(&self, mut candidates: Vec<Agent>) -> Option<Agent> {
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));

        let mut best: Option<(Agent, usize)> = None;
        for agent in candidates {
            let load = self.jobs.count_active_for_agent(&agent.id).await;
            match &best {
                Some((_, best_load)) if *best_load <= load => {}
                _ => best = Some((agent, load)),
            }
        }
        best.map(|(agent, _)| agent)
    }
}

/// Minimal `*`/`?` glob matcher for agent-id patterns (§4.3). No `**`, no
/// character classes — the selector space is a single path segment (an id).
fn glob_match(pattern: &str, text: &str) -> bool {
    glob_match_bytes(pattern.as_bytes(), text.as_bytes())
}

fn glob_match_bytes(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_match_bytes(&pattern[1..], text)
                || (!text.is_empty() && glob_match_bytes(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match_bytes(&pattern[1..], &text[1..]),
        (Some(p), Some(t)) if p == t => glob_match_bytes(&pattern[1..], &text[1..]),
        _ => false,
    }
}
