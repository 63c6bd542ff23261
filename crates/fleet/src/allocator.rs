use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use minecloud_primitives::{Assignment, Clock, Registry, RetryPolicy};
use minecloud_store::{heartbeat_key, jittered_delay, CasOutcome, ObjectStore};
use serde::{Deserialize, Serialize};

use crate::registry::RegistryStore;
use crate::{FleetError, FleetErrorKind};

/// Local cache of a completed reservation (`addresses.json` in the
/// worker data dir). Restarts resolve from this file alone.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservedAddresses {
    pub worker_id: String,
    pub addresses: Vec<String>,
    pub reserved_at: DateTime<Utc>,
}

/// Worker-side address reservation against the shared registry.
pub struct Allocator<S> {
    registry: RegistryStore<S>,
    clock: Arc<dyn Clock>,
    cache_path: PathBuf,
    /// Tight staleness threshold for opportunistic reclaim on the boot
    /// path, where the caller is blocked waiting for a slot.
    pub stale_threshold: chrono::Duration,
    pub policy: RetryPolicy,
    /// How long to wait for the controller to finish seeding.
    pub seed_wait_attempts: usize,
    pub seed_wait_delay: Duration,
}

impl<S: ObjectStore> Allocator<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, cache_path: impl Into<PathBuf>) -> Self {
        Self {
            registry: RegistryStore::new(store),
            clock,
            cache_path: cache_path.into(),
            stale_threshold: chrono::Duration::seconds(90),
            policy: RetryPolicy::allocator(),
            seed_wait_attempts: 10,
            seed_wait_delay: Duration::from_secs(5),
        }
    }

    /// Reserve this worker's address slice.
    ///
    /// Cache-first: a cache file written by a previous boot short-circuits
    /// the registry entirely. Otherwise enter the registry CAS loop;
    /// re-reservation by a worker that already holds an assignment is
    /// idempotent.
    pub async fn reserve(
        &self,
        worker_id: &str,
        public_endpoint: &str,
    ) -> Result<Vec<String>, FleetError> {
        if let Some(cached) = self.load_cache(worker_id) {
            return Ok(cached.addresses);
        }

        let mut attempt = 0usize;
        loop {
            let (mut registry, etag) = match self.registry.load()? {
                Some(loaded) => loaded,
                None => {
                    self.wait_for_seed().await?;
                    continue;
                }
            };

            if let Some(assignment) = registry.assignments.get(worker_id) {
                let addresses = assignment.addresses.clone();
                self.persist_cache(worker_id, &addresses)?;
                return Ok(addresses);
            }

            let now = self.clock.now();
            self.drop_stale_assignments(&mut registry, now);

            let width = registry.addresses_per_instance;
            if registry
                .next_available
                .checked_add(width)
                .map(|end| end > registry.addresses.len())
                .unwrap_or(true)
            {
                return Err(FleetError::new(
                    FleetErrorKind::Exhausted,
                    format!(
                        "registry exhausted: cursor {} + slice {width} exceeds {} addresses",
                        registry.next_available,
                        registry.addresses.len()
                    ),
                ));
            }

            let start = registry.next_available;
            let end = start + width - 1;
            let addresses = registry.addresses[start..=end].to_vec();
            registry.assignments.insert(
                worker_id.to_string(),
                Assignment {
                    worker_id: worker_id.to_string(),
                    public_endpoint: public_endpoint.to_string(),
                    start_address: start,
                    end_address: end,
                    addresses: addresses.clone(),
                    assigned_at: now,
                    last_heartbeat: Some(now),
                },
            );
            registry.next_available = end + 1;

            match self.registry.commit(&registry, Some(&etag))? {
                CasOutcome::Committed(_) => {
                    self.persist_cache(worker_id, &addresses)?;
                    return Ok(addresses);
                }
                CasOutcome::PreconditionFailed => {
                    attempt += 1;
                    if attempt >= self.policy.max_attempts {
                        return Err(FleetError::new(
                            FleetErrorKind::Contention,
                            format!("reservation lost {attempt} conditional writes"),
                        ));
                    }
                    tokio::time::sleep(jittered_delay(
                        self.policy.base,
                        self.policy.cap,
                        attempt - 1,
                    ))
                    .await;
                }
            }
        }
    }

    /// Voluntarily release this worker's assignment and heartbeat on
    /// graceful shutdown. The freed range is skipped, not reused.
    pub async fn release(&self, worker_id: &str) -> Result<(), FleetError> {
        for attempt in 0..self.policy.max_attempts {
            let Some((mut registry, etag)) = self.registry.load()? else {
                break;
            };
            if registry.assignments.remove(worker_id).is_none() {
                break;
            }
            match self.registry.commit(&registry, Some(&etag))? {
                CasOutcome::Committed(_) => break,
                CasOutcome::PreconditionFailed => {
                    tokio::time::sleep(jittered_delay(self.policy.base, self.policy.cap, attempt))
                        .await;
                }
            }
        }
        self.registry
            .store()
            .delete(&heartbeat_key(worker_id))
            .map_err(FleetError::store)?;
        let _ = fs::remove_file(&self.cache_path);
        Ok(())
    }

    /// Assignments whose owner has shown no life within the tight
    /// threshold are dropped in-place. The cursor stays put; freed
    /// ranges become holes.
    fn drop_stale_assignments(&self, registry: &mut Registry, now: DateTime<Utc>) {
        let threshold = self.stale_threshold;
        registry
            .assignments
            .retain(|_, assignment| now - assignment.last_activity() <= threshold);
    }

    async fn wait_for_seed(&self) -> Result<(), FleetError> {
        for _ in 0..self.seed_wait_attempts {
            tokio::time::sleep(self.seed_wait_delay).await;
            if self.registry.load()?.is_some() {
                return Ok(());
            }
        }
        Err(FleetError::new(
            FleetErrorKind::NotSeeded,
            "registry.json never appeared; is the controller seeding this region?",
        ))
    }

    fn load_cache(&self, worker_id: &str) -> Option<ReservedAddresses> {
        let bytes = match fs::read(&self.cache_path) {
            Ok(bytes) => bytes,
            Err(_) => return None,
        };
        let cached: ReservedAddresses = serde_json::from_slice(&bytes).ok()?;
        if cached.worker_id != worker_id {
            return None;
        }
        Some(cached)
    }

    fn persist_cache(&self, worker_id: &str, addresses: &[String]) -> Result<(), FleetError> {
        let cached = ReservedAddresses {
            worker_id: worker_id.to_string(),
            addresses: addresses.to_vec(),
            reserved_at: self.clock.now(),
        };
        let bytes = serde_json::to_vec_pretty(&cached)
            .map_err(|err| FleetError::new(FleetErrorKind::Store, err.to_string()))?;
        write_file_atomic(&self.cache_path, &bytes)
            .map_err(|err| FleetError::new(FleetErrorKind::Store, err))
    }
}

fn write_file_atomic(path: &Path, bytes: &[u8]) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| err.to_string())?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(|err| err.to_string())?;
    if fs::rename(&tmp, path).is_err() {
        let _ = fs::remove_file(path);
        fs::rename(&tmp, path).map_err(|err| err.to_string())?;
    }
    Ok(())
}
