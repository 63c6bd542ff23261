use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::miner::{MinerResult, MinerRunner};
use crate::queue::WorkItem;

struct InFlight {
    challenge_id: String,
    expires_at: DateTime<Utc>,
    abort: watch::Sender<bool>,
}

/// Bounded dispatch of work items to miner subprocesses.
///
/// The in-progress set keyed `{address}-{challengeId}` stops two slots
/// from mining the same pair; the tracking map remembers which running
/// search belongs to which challenge so the expiry scanner can abort it.
/// Owned exclusively by the orchestrator task.
pub struct WorkerPool<R> {
    runner: Arc<R>,
    width: usize,
    in_progress: HashSet<String>,
    tracking: HashMap<String, InFlight>,
    tasks: JoinSet<(WorkItem, MinerResult)>,
}

impl<R: MinerRunner + 'static> WorkerPool<R> {
    pub fn new(runner: Arc<R>, width: usize) -> Self {
        Self {
            runner,
            width: width.max(1),
            in_progress: HashSet::new(),
            tracking: HashMap::new(),
            tasks: JoinSet::new(),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn busy(&self) -> usize {
        self.tasks.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.busy() < self.width
    }

    pub fn is_in_progress(&self, key: &str) -> bool {
        self.in_progress.contains(key)
    }

    /// Spawn a miner for the item. Returns false when the pool is full
    /// or the item is already being mined.
    pub fn dispatch(&mut self, item: WorkItem) -> bool {
        let key = item.key();
        if !self.has_capacity() || self.in_progress.contains(&key) {
            return false;
        }
        let (abort_tx, abort_rx) = watch::channel(false);
        self.in_progress.insert(key.clone());
        self.tracking.insert(
            key,
            InFlight {
                challenge_id: item.challenge.challenge_id.clone(),
                expires_at: item.challenge.latest_submission,
                abort: abort_tx,
            },
        );
        let future = self.runner.mine(item.clone(), abort_rx);
        self.tasks.spawn(async move { (item, future.await) });
        true
    }

    /// Wait for the next finished search and release its slot.
    pub async fn next_result(&mut self) -> Option<(WorkItem, MinerResult)> {
        loop {
            match self.tasks.join_next().await? {
                Ok((item, result)) => {
                    self.release(&item.key());
                    return Some((item, result));
                }
                Err(err) => {
                    eprintln!("miner task failed: {err}");
                }
            }
        }
    }

    /// Release any already-finished searches without waiting.
    pub fn try_next_result(&mut self) -> Option<(WorkItem, MinerResult)> {
        loop {
            match self.tasks.try_join_next()? {
                Ok((item, result)) => {
                    self.release(&item.key());
                    return Some((item, result));
                }
                Err(err) => {
                    eprintln!("miner task failed: {err}");
                }
            }
        }
    }

    /// Signal every in-flight search whose challenge window has closed.
    /// Returns the affected item keys; the slots free up when the
    /// aborted tasks report back.
    pub fn abort_expired(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut aborted = Vec::new();
        for (key, in_flight) in &self.tracking {
            if in_flight.expires_at <= now {
                let _ = in_flight.abort.send(true);
                aborted.push(key.clone());
            }
        }
        aborted
    }

    /// Abort a specific challenge's searches (shutdown of one window).
    pub fn abort_challenge(&mut self, challenge_id: &str) -> usize {
        let mut count = 0;
        for in_flight in self.tracking.values() {
            if in_flight.challenge_id == challenge_id {
                let _ = in_flight.abort.send(true);
                count += 1;
            }
        }
        count
    }

    /// Abort everything (worker shutdown).
    pub fn abort_all(&mut self) {
        for in_flight in self.tracking.values() {
            let _ = in_flight.abort.send(true);
        }
    }

    fn release(&mut self, key: &str) {
        self.in_progress.remove(key);
        self.tracking.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::miner::MineFuture;
    use chrono::TimeZone;
    use minecloud_primitives::{Difficulty, QueuedChallenge};

    fn deadline() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 19, 9, 0, 0).unwrap()
    }

    fn item(address: &str, challenge_id: &str) -> WorkItem {
        WorkItem {
            address: address.to_string(),
            challenge: QueuedChallenge {
                challenge_id: challenge_id.to_string(),
                challenge_number: 1,
                day: 1,
                difficulty: Difficulty::new("000FFFFF"),
                no_pre_mine: "00".repeat(32),
                no_pre_mine_hour: "509681483".to_string(),
                latest_submission: deadline(),
                available_at: deadline() - chrono::Duration::hours(1),
            },
            donation: false,
        }
    }

    /// Resolves instantly with a fixed nonce.
    struct InstantMiner;

    impl MinerRunner for InstantMiner {
        fn mine(&self, _item: WorkItem, _abort: watch::Receiver<bool>) -> MineFuture {
            Box::pin(async {
                MinerResult::Solved {
                    nonce: "0019c96b6a30ee38".to_string(),
                    hash: "00".to_string(),
                }
            })
        }
    }

    /// Runs until aborted.
    struct BlockingMiner;

    impl MinerRunner for BlockingMiner {
        fn mine(&self, _item: WorkItem, mut abort: watch::Receiver<bool>) -> MineFuture {
            Box::pin(async move {
                loop {
                    if abort.changed().await.is_err() {
                        return MinerResult::Crashed("abort channel closed".to_string());
                    }
                    if *abort.borrow() {
                        return MinerResult::Aborted;
                    }
                }
            })
        }
    }

    #[tokio::test]
    async fn duplicate_dispatch_is_rejected() {
        let mut pool = WorkerPool::new(Arc::new(BlockingMiner), 4);
        assert!(pool.dispatch(item("a", "C1")));
        assert!(!pool.dispatch(item("a", "C1")));
        assert!(pool.dispatch(item("a", "C2")));
        assert_eq!(pool.busy(), 2);
        pool.abort_all();
    }

    #[tokio::test]
    async fn capacity_is_bounded() {
        let mut pool = WorkerPool::new(Arc::new(BlockingMiner), 2);
        assert!(pool.dispatch(item("a1", "C1")));
        assert!(pool.dispatch(item("a2", "C1")));
        assert!(!pool.has_capacity());
        assert!(!pool.dispatch(item("a3", "C1")));
        pool.abort_all();
    }

    #[tokio::test]
    async fn finished_search_frees_its_slot() {
        let mut pool = WorkerPool::new(Arc::new(InstantMiner), 1);
        assert!(pool.dispatch(item("a", "C1")));
        let (done, result) = pool.next_result().await.expect("result");
        assert_eq!(done.address, "a");
        assert!(matches!(result, MinerResult::Solved { .. }));
        assert!(pool.has_capacity());
        assert!(!pool.is_in_progress("a-C1"));
        // The pair can be dispatched again (e.g. after a clean miss).
        assert!(pool.dispatch(item("a", "C1")));
    }

    #[tokio::test]
    async fn expired_search_is_aborted_and_released() {
        let mut pool = WorkerPool::new(Arc::new(BlockingMiner), 2);
        assert!(pool.dispatch(item("a", "C1")));

        // Before the window closes nothing is touched.
        let before = deadline() - chrono::Duration::seconds(1);
        assert!(pool.abort_expired(before).is_empty());

        let after = deadline() + chrono::Duration::seconds(1);
        let aborted = pool.abort_expired(after);
        assert_eq!(aborted, vec!["a-C1".to_string()]);

        let (done, result) = pool.next_result().await.expect("result");
        assert_eq!(done.key(), "a-C1");
        assert!(matches!(result, MinerResult::Aborted));
        assert!(!pool.is_in_progress("a-C1"));
    }

    #[tokio::test]
    async fn abort_all_drains_the_pool() {
        let mut pool = WorkerPool::new(Arc::new(BlockingMiner), 4);
        pool.dispatch(item("a1", "C1"));
        pool.dispatch(item("a2", "C1"));
        pool.abort_all();
        let mut aborted = 0;
        while let Some((_, result)) = pool.next_result().await {
            assert!(matches!(result, MinerResult::Aborted));
            aborted += 1;
        }
        assert_eq!(aborted, 2);
        assert_eq!(pool.busy(), 0);
    }
}
