use std::collections::HashSet;

use chrono::{DateTime, Utc};
use minecloud_primitives::{AddressSolutions, SolutionRecord};
use minecloud_store::{get_json, put_json, solutions_key, ObjectStore};

use crate::LedgerError;

/// Per-address submission history under `solutions/`.
///
/// Each address belongs to exactly one live worker, so the file has a
/// single logical writer and a read-merge-blind-write is safe. The Mine
/// API's duplicate rejection remains the source of truth; this ledger
/// exists to stop a worker re-mining pairs it already solved.
pub struct SolutionsLedger<S> {
    store: S,
}

impl<S: ObjectStore> SolutionsLedger<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn load(&self, address: &str) -> Result<Option<AddressSolutions>, LedgerError> {
        Ok(get_json::<AddressSolutions>(&self.store, &solutions_key(address))
            .map_err(LedgerError::store)?
            .map(|(ledger, _)| ledger))
    }

    pub fn has_solution(&self, address: &str, challenge_id: &str) -> Result<bool, LedgerError> {
        Ok(self
            .load(address)?
            .map(|ledger| ledger.has_solution(challenge_id))
            .unwrap_or(false))
    }

    /// Challenge ids already solved for `address`, for queue dedup.
    pub fn solved_set(&self, address: &str) -> Result<HashSet<String>, LedgerError> {
        Ok(self
            .load(address)?
            .map(|ledger| {
                ledger
                    .solutions
                    .into_iter()
                    .map(|record| record.challenge_id)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Record an accepted submission. Idempotent per
    /// `(address, challengeId)`: repeated calls leave one record.
    /// Returns true when the record was new.
    pub fn record(
        &self,
        address: &str,
        record: SolutionRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let mut ledger = self
            .load(address)?
            .unwrap_or_else(|| AddressSolutions::new(address, now));
        if !ledger.merge(record, now) {
            return Ok(false);
        }
        put_json(&self.store, &solutions_key(address), &ledger).map_err(LedgerError::store)?;
        Ok(true)
    }
}
