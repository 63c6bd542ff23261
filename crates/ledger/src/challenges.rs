use chrono::{DateTime, Utc};
use minecloud_primitives::{ChallengeCache, QueuedChallenge, RetryPolicy};
use minecloud_store::{
    get_json, jittered_delay, put_json_conditional, replace_observed, CasOutcome, ObjectStore,
    CHALLENGES_KEY,
};

use crate::{LedgerError, LedgerErrorKind};

/// The shared queue of known active challenges (`challenges.json`),
/// updated under optimistic lock by whichever worker polls the Mine API
/// first.
pub struct ChallengeLedger<S> {
    store: S,
    region: String,
    pub policy: RetryPolicy,
}

impl<S: ObjectStore> ChallengeLedger<S> {
    pub fn new(store: S, region: impl Into<String>) -> Self {
        Self {
            store,
            region: region.into(),
            policy: RetryPolicy::allocator(),
        }
    }

    pub fn load(&self) -> Result<ChallengeCache, LedgerError> {
        Ok(get_json::<ChallengeCache>(&self.store, CHALLENGES_KEY)
            .map_err(LedgerError::store)?
            .map(|(cache, _)| cache)
            .unwrap_or_default())
    }

    /// Insert or refresh one challenge. Returns true when the entry was
    /// new to the shared cache.
    pub async fn upsert(
        &self,
        challenge: QueuedChallenge,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        self.mutate(now, move |cache| cache.upsert(challenge.clone()))
            .await
    }

    /// Drop challenges whose submission window has closed. Returns how
    /// many were removed.
    pub async fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize, LedgerError> {
        self.mutate(now, move |cache| cache.prune_expired(now)).await
    }

    async fn mutate<R>(
        &self,
        now: DateTime<Utc>,
        mut apply: impl FnMut(&mut ChallengeCache) -> R,
    ) -> Result<R, LedgerError> {
        for attempt in 0..self.policy.max_attempts {
            let loaded = get_json::<ChallengeCache>(&self.store, CHALLENGES_KEY)
                .map_err(LedgerError::store)?;
            let (mut cache, observed) = match loaded {
                Some((cache, etag)) => (cache, Some(etag)),
                None => (ChallengeCache::default(), None),
            };
            let result = apply(&mut cache);
            cache.last_updated = Some(now);
            cache.region = self.region.clone();

            match put_json_conditional(
                &self.store,
                CHALLENGES_KEY,
                &cache,
                replace_observed(observed.as_ref()),
            )
            .map_err(LedgerError::store)?
            {
                CasOutcome::Committed(_) => return Ok(result),
                CasOutcome::PreconditionFailed => {
                    tokio::time::sleep(jittered_delay(self.policy.base, self.policy.cap, attempt))
                        .await;
                }
            }
        }
        Err(LedgerError::new(
            LedgerErrorKind::Contention,
            "challenge cache update lost every conditional write",
        ))
    }
}
