use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use minecloud_primitives::{Clock, Heartbeat, RetryPolicy};
use minecloud_store::{heartbeat_key, jittered_delay, CasOutcome, ObjectStore};

use crate::heartbeat::read_heartbeats;
use crate::registry::RegistryStore;
use crate::{FleetError, FleetErrorKind};

/// Deterministic leader test: sort the live worker ids and proceed only
/// as the first. Needs no lock; the occasional race just means two
/// reclaimers run and the registry CAS lets one commit.
pub fn elect_leader(peer_ids: &[String], self_id: &str) -> bool {
    let mut sorted: Vec<&String> = peer_ids.iter().collect();
    sorted.sort();
    match sorted.first() {
        Some(first) => first.as_str() == self_id,
        None => false,
    }
}

#[derive(Clone, Debug, Default)]
pub struct ReclaimOutcome {
    pub reclaimed: Vec<String>,
}

/// Periodic garbage collection of assignments whose workers stopped
/// heartbeating. Runs on the elected leader only.
pub struct Reclaimer<S> {
    registry: RegistryStore<S>,
    clock: Arc<dyn Clock>,
    /// Loose staleness threshold; steady-state churn stays low because
    /// the boot-path allocator handles the urgent cases.
    pub stale_threshold: chrono::Duration,
    pub policy: RetryPolicy,
}

impl<S: ObjectStore> Reclaimer<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry: RegistryStore::new(store),
            clock,
            stale_threshold: chrono::Duration::minutes(30),
            policy: RetryPolicy::reclaimer(),
        }
    }

    /// One reclaim pass: drop every assignment whose heartbeat (or,
    /// absent one, whose assignment time) is past the threshold, then
    /// delete the reclaimed workers' heartbeat files. `nextAvailable`
    /// is never modified.
    pub async fn run_once(&self) -> Result<ReclaimOutcome, FleetError> {
        let beats = read_heartbeats(self.registry.store())?;

        for attempt in 0..self.policy.max_attempts {
            let Some((mut registry, etag)) = self.registry.load()? else {
                return Ok(ReclaimOutcome::default());
            };

            let now = self.clock.now();
            let stale = self.stale_workers(&registry.assignments, &beats, now);
            if stale.is_empty() {
                return Ok(ReclaimOutcome::default());
            }
            for worker_id in &stale {
                registry.assignments.remove(worker_id);
            }

            match self.registry.commit(&registry, Some(&etag))? {
                CasOutcome::Committed(_) => {
                    for worker_id in &stale {
                        self.registry
                            .store()
                            .delete(&heartbeat_key(worker_id))
                            .map_err(FleetError::store)?;
                    }
                    return Ok(ReclaimOutcome { reclaimed: stale });
                }
                CasOutcome::PreconditionFailed => {
                    tokio::time::sleep(jittered_delay(self.policy.base, self.policy.cap, attempt))
                        .await;
                }
            }
        }
        Err(FleetError::new(
            FleetErrorKind::Contention,
            "reclaim pass lost every conditional write",
        ))
    }

    fn stale_workers(
        &self,
        assignments: &BTreeMap<String, minecloud_primitives::Assignment>,
        beats: &BTreeMap<String, Heartbeat>,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        assignments
            .iter()
            .filter(|(worker_id, assignment)| {
                let last_seen = match beats.get(*worker_id) {
                    Some(beat) => beat.last_heartbeat,
                    None => assignment.assigned_at,
                };
                now - last_seen > self.stale_threshold
            })
            .map(|(worker_id, _)| worker_id.clone())
            .collect()
    }
}
