use chrono::{DateTime, Utc};
use minecloud_primitives::{RecentError, RecentSolution, RetryPolicy, SolutionsStats};
use minecloud_store::{
    get_json, jittered_delay, put_json_conditional, replace_observed, CasOutcome, ObjectStore,
    STATS_KEY,
};

use crate::{LedgerError, LedgerErrorKind};

/// Fleet-wide telemetry (`solutions-stats.json`), bumped under
/// optimistic lock on every submission and submission error.
///
/// Stats are advisory: callers are expected to log and swallow a
/// `Contention` failure rather than fail the submission that produced
/// it.
pub struct StatsLedger<S> {
    store: S,
    pub policy: RetryPolicy,
}

impl<S: ObjectStore> StatsLedger<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            policy: RetryPolicy::stats(),
        }
    }

    pub fn load(&self) -> Result<SolutionsStats, LedgerError> {
        Ok(get_json::<SolutionsStats>(&self.store, STATS_KEY)
            .map_err(LedgerError::store)?
            .map(|(stats, _)| stats)
            .unwrap_or_default())
    }

    pub async fn record_solution(
        &self,
        entry: RecentSolution,
        donation: bool,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        self.mutate(move |stats| stats.note_solution(entry.clone(), donation, now))
            .await
    }

    pub async fn record_error(
        &self,
        entry: RecentError,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        self.mutate(move |stats| stats.note_error(entry.clone(), now))
            .await
    }

    async fn mutate(
        &self,
        mut apply: impl FnMut(&mut SolutionsStats),
    ) -> Result<(), LedgerError> {
        for attempt in 0..self.policy.max_attempts {
            let loaded =
                get_json::<SolutionsStats>(&self.store, STATS_KEY).map_err(LedgerError::store)?;
            let (mut stats, observed) = match loaded {
                Some((stats, etag)) => (stats, Some(etag)),
                None => (SolutionsStats::default(), None),
            };
            apply(&mut stats);

            match put_json_conditional(
                &self.store,
                STATS_KEY,
                &stats,
                replace_observed(observed.as_ref()),
            )
            .map_err(LedgerError::store)?
            {
                CasOutcome::Committed(_) => return Ok(()),
                CasOutcome::PreconditionFailed => {
                    tokio::time::sleep(jittered_delay(self.policy.base, self.policy.cap, attempt))
                        .await;
                }
            }
        }
        Err(LedgerError::new(
            LedgerErrorKind::Contention,
            "stats update lost every conditional write",
        ))
    }
}
