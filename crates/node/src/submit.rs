use std::sync::Arc;

use minecloud_ledger::{SolutionsLedger, StatsLedger};
use minecloud_mineapi::{MineApi, SubmitOutcome};
use minecloud_primitives::{Clock, RecentError, RecentSolution, SolutionRecord};
use minecloud_store::ObjectStore;

use crate::queue::WorkItem;

/// What became of a mined nonce.
#[derive(Clone, Debug)]
pub enum SubmitDisposition {
    /// Accepted by the Mine API and recorded.
    Recorded,
    /// The API already had it; recorded locally to stop future retries.
    Duplicate,
    /// The challenge window closed before the POST; nothing was sent.
    Expired,
    Failed(String),
}

/// Posts mined nonces and maintains the solutions and stats ledgers.
pub struct Submitter<S, M> {
    api: M,
    solutions: SolutionsLedger<S>,
    stats: StatsLedger<S>,
    clock: Arc<dyn Clock>,
    worker_id: String,
}

impl<S: ObjectStore + Clone, M: MineApi> Submitter<S, M> {
    pub fn new(store: S, api: M, clock: Arc<dyn Clock>, worker_id: impl Into<String>) -> Self {
        Self {
            api,
            solutions: SolutionsLedger::new(store.clone()),
            stats: StatsLedger::new(store),
            clock,
            worker_id: worker_id.into(),
        }
    }

    pub fn stats(&self) -> &StatsLedger<S> {
        &self.stats
    }

    pub async fn submit(&self, item: &WorkItem, nonce: &str) -> SubmitDisposition {
        let now = self.clock.now();
        if item.challenge.latest_submission <= now {
            return SubmitDisposition::Expired;
        }

        let outcome = self
            .api
            .submit_solution(&item.address, &item.challenge.challenge_id, nonce)
            .await;

        match outcome {
            SubmitOutcome::Accepted(_) => {
                self.record_success(item, nonce).await;
                SubmitDisposition::Recorded
            }
            SubmitOutcome::Duplicate => {
                self.record_success(item, nonce).await;
                SubmitDisposition::Duplicate
            }
            SubmitOutcome::TransientError(message) => {
                self.record_failure(item, &message).await;
                SubmitDisposition::Failed(message)
            }
            SubmitOutcome::Fatal(message) => {
                self.record_failure(item, &message).await;
                SubmitDisposition::Failed(message)
            }
        }
    }

    async fn record_success(&self, item: &WorkItem, nonce: &str) {
        let now = self.clock.now();
        // Donations never touch the per-address files; each of those has
        // a single owning worker and donation addresses have none.
        if !item.donation {
            let record = SolutionRecord {
                challenge_id: item.challenge.challenge_id.clone(),
                nonce: nonce.to_string(),
                submitted_at: now,
                worker_id: Some(self.worker_id.clone()),
            };
            if let Err(err) = self.solutions.record(&item.address, record, now) {
                eprintln!(
                    "failed to record solution for {}: {err}",
                    item.address
                );
            }
        }

        let entry = RecentSolution {
            address: item.address.clone(),
            challenge_id: item.challenge.challenge_id.clone(),
            nonce: nonce.to_string(),
            submitted_at: now,
            worker_id: Some(self.worker_id.clone()),
        };
        if let Err(err) = self.stats.record_solution(entry, item.donation, now).await {
            eprintln!("stats update dropped: {err}");
        }
    }

    /// Surface a non-submission failure (e.g. a miner crash) in the
    /// fleet stats.
    pub async fn note_error(&self, item: &WorkItem, message: &str) {
        self.record_failure(item, message).await;
    }

    async fn record_failure(&self, item: &WorkItem, message: &str) {
        let now = self.clock.now();
        let entry = RecentError {
            address: item.address.clone(),
            challenge_id: item.challenge.challenge_id.clone(),
            message: message.to_string(),
            occurred_at: now,
            worker_id: Some(self.worker_id.clone()),
        };
        if let Err(err) = self.stats.record_error(entry, now).await {
            eprintln!("stats update dropped: {err}");
        }
    }
}
