use minecloud_primitives::{Registry, RetryPolicy};
use minecloud_store::{
    get_json, jittered_delay, put_json_conditional, replace_observed, CasOutcome, ETag,
    ObjectStore, REGISTRY_KEY,
};

use crate::{FleetError, FleetErrorKind};

/// Access to `registry.json`. Every mutation is a read-modify-write
/// loop guarded by the revision observed on read; the registry is never
/// blind-written.
pub struct RegistryStore<S> {
    store: S,
}

impl<S: ObjectStore> RegistryStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn load(&self) -> Result<Option<(Registry, ETag)>, FleetError> {
        get_json(&self.store, REGISTRY_KEY).map_err(FleetError::store)
    }

    pub fn commit(
        &self,
        registry: &Registry,
        observed: Option<&ETag>,
    ) -> Result<CasOutcome, FleetError> {
        put_json_conditional(
            &self.store,
            REGISTRY_KEY,
            registry,
            replace_observed(observed),
        )
        .map_err(FleetError::store)
    }

    /// Create or refresh the registry with the full address list and the
    /// slice width. Existing assignments survive a re-seed; the merged
    /// document must still satisfy the registry invariants, and a
    /// violation is a fatal configuration error.
    pub async fn seed(
        &self,
        addresses: Vec<String>,
        addresses_per_instance: usize,
        policy: RetryPolicy,
    ) -> Result<Registry, FleetError> {
        if addresses.is_empty() {
            return Err(FleetError::new(
                FleetErrorKind::Config,
                "cannot seed an empty address list",
            ));
        }
        if addresses_per_instance == 0 {
            return Err(FleetError::new(
                FleetErrorKind::Config,
                "addresses per instance must be positive",
            ));
        }

        for attempt in 0..policy.max_attempts {
            let existing = self.load()?;
            let (mut registry, observed) = match existing {
                Some((registry, etag)) => (registry, Some(etag)),
                None => (Registry::default(), None),
            };
            registry.addresses = addresses.clone();
            registry.addresses_per_instance = addresses_per_instance;
            registry.validate().map_err(|err| {
                FleetError::new(
                    FleetErrorKind::Config,
                    format!("seed would violate registry invariants: {err}"),
                )
            })?;

            match self.commit(&registry, observed.as_ref())? {
                CasOutcome::Committed(_) => return Ok(registry),
                CasOutcome::PreconditionFailed => {
                    tokio::time::sleep(jittered_delay(policy.base, policy.cap, attempt)).await;
                }
            }
        }
        Err(FleetError::new(
            FleetErrorKind::Contention,
            "registry seed lost every conditional write",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use minecloud_primitives::Assignment;
    use minecloud_store::memory::MemoryObjectStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(2), 5)
    }

    fn addresses(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("a{i}")).collect()
    }

    #[tokio::test]
    async fn seed_creates_registry() {
        let registry_store = RegistryStore::new(Arc::new(MemoryObjectStore::new()));
        let registry = registry_store
            .seed(addresses(20), 5, fast_policy())
            .await
            .expect("seed");
        assert_eq!(registry.addresses.len(), 20);
        assert_eq!(registry.next_available, 0);
        assert!(registry.assignments.is_empty());

        let (loaded, _) = registry_store.load().expect("load").expect("present");
        assert_eq!(loaded.addresses_per_instance, 5);
    }

    #[tokio::test]
    async fn reseed_preserves_assignments() {
        let registry_store = RegistryStore::new(Arc::new(MemoryObjectStore::new()));
        registry_store
            .seed(addresses(20), 5, fast_policy())
            .await
            .expect("seed");

        let (mut registry, etag) = registry_store.load().unwrap().unwrap();
        let assigned_at = chrono::Utc.with_ymd_and_hms(2025, 10, 19, 0, 0, 0).unwrap();
        registry.assignments.insert(
            "w1".to_string(),
            Assignment {
                worker_id: "w1".to_string(),
                public_endpoint: "http://w1:8080".to_string(),
                start_address: 0,
                end_address: 4,
                addresses: registry.addresses[0..=4].to_vec(),
                assigned_at,
                last_heartbeat: None,
            },
        );
        registry.next_available = 5;
        match registry_store.commit(&registry, Some(&etag)).unwrap() {
            CasOutcome::Committed(_) => {}
            CasOutcome::PreconditionFailed => panic!("commit lost without contention"),
        }

        let reseeded = registry_store
            .seed(addresses(40), 5, fast_policy())
            .await
            .expect("reseed");
        assert_eq!(reseeded.addresses.len(), 40);
        assert!(reseeded.assignments.contains_key("w1"));
        assert_eq!(reseeded.next_available, 5);
    }

    #[tokio::test]
    async fn reseed_shrinking_under_assignments_is_fatal() {
        let registry_store = RegistryStore::new(Arc::new(MemoryObjectStore::new()));
        registry_store
            .seed(addresses(20), 5, fast_policy())
            .await
            .expect("seed");

        let (mut registry, etag) = registry_store.load().unwrap().unwrap();
        let assigned_at = chrono::Utc.with_ymd_and_hms(2025, 10, 19, 0, 0, 0).unwrap();
        registry.assignments.insert(
            "w1".to_string(),
            Assignment {
                worker_id: "w1".to_string(),
                public_endpoint: String::new(),
                start_address: 0,
                end_address: 4,
                addresses: registry.addresses[0..=4].to_vec(),
                assigned_at,
                last_heartbeat: None,
            },
        );
        registry.next_available = 5;
        registry_store.commit(&registry, Some(&etag)).unwrap();

        let err = registry_store
            .seed(addresses(3), 5, fast_policy())
            .await
            .expect_err("shrink must fail");
        assert_eq!(err.kind, FleetErrorKind::Config);
    }

    #[tokio::test]
    async fn seed_rejects_bad_config() {
        let registry_store = RegistryStore::new(Arc::new(MemoryObjectStore::new()));
        assert_eq!(
            registry_store
                .seed(Vec::new(), 5, fast_policy())
                .await
                .unwrap_err()
                .kind,
            FleetErrorKind::Config
        );
        assert_eq!(
            registry_store
                .seed(addresses(5), 0, fast_policy())
                .await
                .unwrap_err()
                .kind,
            FleetErrorKind::Config
        );
    }
}
