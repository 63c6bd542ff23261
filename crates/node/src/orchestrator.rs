use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use minecloud_fleet::{elect_leader, write_heartbeat, Reclaimer};
use minecloud_ledger::ChallengeLedger;
use minecloud_mineapi::{ApiErrorKind, ChallengeStatus, ComputeProvider, DonationSource, MineApi};
use minecloud_primitives::Clock;
use minecloud_store::ObjectStore;
use tokio::sync::watch;

use crate::miner::{MinerResult, MinerRunner};
use crate::pool::WorkerPool;
use crate::queue::{build_work_queue, WorkItem};
use crate::status::{RewardRate, SessionCounters};
use crate::submit::{SubmitDisposition, Submitter};

#[derive(Clone, Copy, Debug)]
pub struct OrchestratorConfig {
    pub work_check_interval: Duration,
    pub challenge_fetch_interval: chrono::Duration,
    pub expiry_scan_interval: Duration,
    pub heartbeat_interval: Duration,
    pub reclaim_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            work_check_interval: Duration::from_secs(5),
            challenge_fetch_interval: chrono::Duration::minutes(5),
            expiry_scan_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(60),
            reclaim_interval: Duration::from_secs(20 * 60),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// The mining loop that runs forever on each worker after allocation:
/// poll challenges into the shared ledger, rebuild the deduplicated
/// work queue, keep the subprocess pool full, abort expired searches,
/// submit what the miners find, heartbeat, and take the reclaimer turn
/// when elected.
pub struct Orchestrator<S, M, R, D, C> {
    store: S,
    api: M,
    pool: WorkerPool<R>,
    submitter: Submitter<S, M>,
    challenges: ChallengeLedger<S>,
    donation: Option<D>,
    compute: C,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
    worker_id: String,
    public_endpoint: String,
    addresses: Vec<String>,
    /// Session cache of (address → solved challenge ids); primed from
    /// the solutions ledger, extended as submissions land.
    solved: HashMap<String, HashSet<String>>,
    last_fetch: Option<DateTime<Utc>>,
    counters: Arc<SessionCounters>,
    reward_rate: RewardRate,
    reclaim_stale: chrono::Duration,
}

#[allow(clippy::too_many_arguments)]
impl<S, M, R, D, C> Orchestrator<S, M, R, D, C>
where
    S: ObjectStore + Clone,
    M: MineApi + Clone,
    R: MinerRunner + 'static,
    D: DonationSource,
    C: ComputeProvider,
{
    pub fn new(
        store: S,
        api: M,
        runner: Arc<R>,
        donation: Option<D>,
        compute: C,
        clock: Arc<dyn Clock>,
        worker_id: impl Into<String>,
        public_endpoint: impl Into<String>,
        region: impl Into<String>,
        addresses: Vec<String>,
        pool_width: usize,
        config: OrchestratorConfig,
        counters: Arc<SessionCounters>,
    ) -> Self {
        let worker_id = worker_id.into();
        Self {
            submitter: Submitter::new(
                store.clone(),
                api.clone(),
                Arc::clone(&clock),
                worker_id.as_str(),
            ),
            challenges: ChallengeLedger::new(store.clone(), region.into()),
            pool: WorkerPool::new(runner, pool_width),
            store,
            api,
            donation,
            compute,
            clock,
            config,
            worker_id,
            public_endpoint: public_endpoint.into(),
            addresses,
            solved: HashMap::new(),
            last_fetch: None,
            counters,
            reward_rate: Arc::new(std::sync::Mutex::new(None)),
            reclaim_stale: chrono::Duration::minutes(30),
        }
    }

    pub fn reward_rate_handle(&self) -> RewardRate {
        Arc::clone(&self.reward_rate)
    }

    /// Loose staleness threshold used on the periodic reclaim path.
    pub fn set_reclaim_stale(&mut self, threshold: chrono::Duration) {
        self.reclaim_stale = threshold;
    }

    /// Load each local address's solved set once, so queue rebuilds do
    /// not re-read the ledger every tick.
    pub fn prime_solved_cache(&mut self) {
        let solutions = minecloud_ledger::SolutionsLedger::new(self.store.clone());
        for address in &self.addresses {
            match solutions.solved_set(address) {
                Ok(set) => {
                    self.solved.insert(address.clone(), set);
                }
                Err(err) => {
                    eprintln!("failed to load solutions for {address}: {err}");
                }
            }
        }
    }

    /// One scheduler pass: refresh and prune the challenge ledger,
    /// rebuild the work queue, and top up the pool.
    pub async fn tick(&mut self) {
        self.drain_finished().await;

        let now = self.clock.now();
        if self.fetch_due(now) {
            self.refresh_challenges(now).await;
        }

        match self.challenges.prune_expired(now).await {
            Ok(0) => {}
            Ok(removed) => println!("dropped {removed} expired challenge(s)"),
            Err(err) => eprintln!("challenge prune failed: {err}"),
        }

        let cache = match self.challenges.load() {
            Ok(cache) => cache,
            Err(err) => {
                eprintln!("challenge ledger unavailable: {err}");
                return;
            }
        };
        let active = cache.sorted_easiest_first();

        let donation_address = match &self.donation {
            Some(source) => match source.donation_address().await {
                Ok(address) => Some(address),
                Err(err) => {
                    if err.kind != ApiErrorKind::Unsupported {
                        eprintln!("donation endpoint unavailable: {err}");
                    }
                    None
                }
            },
            None => None,
        };

        let solved = &self.solved;
        let queue = build_work_queue(
            &self.addresses,
            &active,
            |address, challenge_id| {
                solved
                    .get(address)
                    .map(|set| set.contains(challenge_id))
                    .unwrap_or(false)
            },
            donation_address.as_deref(),
        );
        SessionCounters::set(&self.counters.queue_depth, queue.len() as u64);

        for item in queue {
            if !self.pool.has_capacity() {
                break;
            }
            if self.pool.is_in_progress(&item.key()) || item.challenge.expired(now) {
                continue;
            }
            self.pool.dispatch(item);
        }
        SessionCounters::set(&self.counters.busy_workers, self.pool.busy() as u64);
    }

    /// Abort in-flight searches whose window has closed.
    pub fn scan_expired(&mut self) {
        let now = self.clock.now();
        for key in self.pool.abort_expired(now) {
            println!("aborting expired search {key}");
        }
    }

    pub async fn next_result(&mut self) -> Option<(WorkItem, MinerResult)> {
        self.pool.next_result().await
    }

    pub async fn handle_result(&mut self, item: WorkItem, result: MinerResult) {
        match result {
            MinerResult::Solved { nonce, .. } => {
                match self.submitter.submit(&item, &nonce).await {
                    SubmitDisposition::Recorded => {
                        println!(
                            "solution accepted for {} on {}",
                            item.address, item.challenge.challenge_id
                        );
                        SessionCounters::bump(&self.counters.solutions);
                        self.mark_solved(&item);
                    }
                    SubmitDisposition::Duplicate => {
                        SessionCounters::bump(&self.counters.duplicates);
                        self.mark_solved(&item);
                    }
                    SubmitDisposition::Expired => {
                        SessionCounters::bump(&self.counters.expired);
                    }
                    SubmitDisposition::Failed(message) => {
                        eprintln!(
                            "submission failed for {} on {}: {message}",
                            item.address, item.challenge.challenge_id
                        );
                        SessionCounters::bump(&self.counters.errors);
                    }
                }
            }
            MinerResult::NoSolution => {
                SessionCounters::bump(&self.counters.misses);
            }
            MinerResult::Aborted => {
                SessionCounters::bump(&self.counters.expired);
            }
            MinerResult::Crashed(message) => {
                eprintln!("miner crashed on {}: {message}", item.key());
                SessionCounters::bump(&self.counters.crashes);
                self.submitter.note_error(&item, &message).await;
            }
        }
    }

    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        self.prime_solved_cache();

        let mut work = tokio::time::interval(self.config.work_check_interval);
        let mut expiry = tokio::time::interval(self.config.expiry_scan_interval);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        let mut reclaim = tokio::time::interval(self.config.reclaim_interval);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = work.tick() => {
                    self.tick().await;
                }
                _ = expiry.tick() => {
                    self.scan_expired();
                    self.drain_finished().await;
                }
                _ = heartbeat.tick() => {
                    self.write_heartbeat();
                }
                _ = reclaim.tick() => {
                    self.reclaim_turn().await;
                }
            }
        }

        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        println!("shutting down: stopping {} miner(s)", self.pool.busy());
        self.pool.abort_all();
        let grace = self.config.shutdown_grace;
        let _ = tokio::time::timeout(grace, async {
            while let Some((item, result)) = self.pool.next_result().await {
                self.handle_result(item, result).await;
            }
        })
        .await;
    }

    async fn drain_finished(&mut self) {
        while let Some((item, result)) = self.pool.try_next_result() {
            self.handle_result(item, result).await;
        }
        SessionCounters::set(&self.counters.busy_workers, self.pool.busy() as u64);
    }

    fn fetch_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_fetch {
            Some(last) => now - last >= self.config.challenge_fetch_interval,
            None => true,
        }
    }

    async fn refresh_challenges(&mut self, now: DateTime<Utc>) {
        self.last_fetch = Some(now);
        match self.api.fetch_challenge().await {
            Ok(ChallengeStatus::Active { challenge, .. }) => {
                let queued = challenge.into_queued(now);
                let id = queued.challenge_id.clone();
                match self.challenges.upsert(queued, now).await {
                    Ok(true) => println!("new challenge {id}"),
                    Ok(false) => {}
                    Err(err) => eprintln!("challenge ledger update failed: {err}"),
                }
            }
            Ok(ChallengeStatus::Before { starts_at, .. }) => {
                match starts_at {
                    Some(starts_at) => println!("mining period not started (starts {starts_at})"),
                    None => println!("mining period not started"),
                }
            }
            Ok(ChallengeStatus::After { .. }) => {
                println!("mining period over");
            }
            Err(err) => {
                eprintln!("challenge fetch failed: {err}");
            }
        }

        match self.api.work_to_star_rate().await {
            Ok(rates) => {
                if let (Some(last), Ok(mut guard)) = (rates.last(), self.reward_rate.lock()) {
                    *guard = Some(*last);
                }
            }
            Err(err) if err.kind == ApiErrorKind::Unsupported => {}
            Err(err) => eprintln!("reward rate fetch failed: {err}"),
        }
    }

    fn write_heartbeat(&self) {
        let endpoint = if self.public_endpoint.is_empty() {
            None
        } else {
            Some(self.public_endpoint.as_str())
        };
        if let Err(err) =
            write_heartbeat(&self.store, self.clock.as_ref(), &self.worker_id, endpoint)
        {
            eprintln!("heartbeat write failed: {err}");
        }
    }

    async fn reclaim_turn(&self) {
        let peers = match self.compute.list_worker_ids().await {
            Ok(peers) => peers,
            Err(err) => {
                eprintln!("peer discovery failed: {err}");
                return;
            }
        };
        if !elect_leader(&peers, &self.worker_id) {
            return;
        }
        let mut reclaimer = Reclaimer::new(self.store.clone(), Arc::clone(&self.clock));
        reclaimer.stale_threshold = self.reclaim_stale;
        match reclaimer.run_once().await {
            Ok(outcome) if outcome.reclaimed.is_empty() => {}
            Ok(outcome) => println!("reclaimed {} dead assignment(s)", outcome.reclaimed.len()),
            Err(err) => eprintln!("reclaim pass failed: {err}"),
        }
    }

    fn mark_solved(&mut self, item: &WorkItem) {
        if item.donation {
            return;
        }
        self.solved
            .entry(item.address.clone())
            .or_default()
            .insert(item.challenge.challenge_id.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::miner::MineFuture;
    use chrono::TimeZone;
    use minecloud_ledger::{SolutionsLedger, StatsLedger};
    use minecloud_mineapi::types::{ApiChallenge, SolutionReceipt};
    use minecloud_mineapi::{ApiError, StaticComputeProvider, SubmitOutcome};
    use minecloud_primitives::ManualClock;
    use minecloud_store::memory::MemoryObjectStore;
    use std::sync::Mutex;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 19, 8, 0, 0).unwrap()
    }

    struct FakeMineApi {
        challenge: Mutex<Option<ApiChallenge>>,
        submissions: Mutex<Vec<(String, String, String)>>,
    }

    impl FakeMineApi {
        fn with_challenge(challenge_id: &str, deadline: DateTime<Utc>) -> Arc<Self> {
            Arc::new(Self {
                challenge: Mutex::new(Some(ApiChallenge {
                    challenge_id: challenge_id.to_string(),
                    challenge_number: Some(1),
                    day: Some(1),
                    issued_at: Some(start()),
                    difficulty: "000FFFFF".to_string(),
                    no_pre_mine: "00".repeat(32),
                    latest_submission: deadline,
                    no_pre_mine_hour: "509681483".to_string(),
                })),
                submissions: Mutex::new(Vec::new()),
            })
        }
    }

    impl MineApi for FakeMineApi {
        async fn fetch_challenge(&self) -> Result<ChallengeStatus, ApiError> {
            match self.challenge.lock().unwrap().clone() {
                Some(challenge) => Ok(ChallengeStatus::Active {
                    challenge,
                    mining_period_ends: None,
                    max_day: None,
                    total_challenges: None,
                    current_day: None,
                    next_challenge_starts_at: None,
                }),
                None => Ok(ChallengeStatus::After {
                    mining_period_ends: None,
                }),
            }
        }

        async fn submit_solution(
            &self,
            address: &str,
            challenge_id: &str,
            nonce: &str,
        ) -> SubmitOutcome {
            self.submissions.lock().unwrap().push((
                address.to_string(),
                challenge_id.to_string(),
                nonce.to_string(),
            ));
            SubmitOutcome::Accepted(SolutionReceipt::default())
        }
    }

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

    struct NoDonation;

    impl DonationSource for NoDonation {
        async fn donation_address(&self) -> Result<String, ApiError> {
            Err(ApiError::new(ApiErrorKind::Unsupported, "disabled"))
        }
    }

    fn orchestrator(
        store: Arc<MemoryObjectStore>,
        api: Arc<FakeMineApi>,
        clock: Arc<ManualClock>,
        addresses: Vec<String>,
    ) -> Orchestrator<
        Arc<MemoryObjectStore>,
        Arc<FakeMineApi>,
        InstantMiner,
        NoDonation,
        StaticComputeProvider,
    > {
        Orchestrator::new(
            store,
            api,
            Arc::new(InstantMiner),
            None,
            StaticComputeProvider::default(),
            clock,
            "w1",
            "http://w1:8080",
            "eu-west-1",
            addresses,
            2,
            OrchestratorConfig::default(),
            Arc::new(SessionCounters::default()),
        )
    }

    #[tokio::test]
    async fn full_pass_fetches_mines_and_records() {
        let store = Arc::new(MemoryObjectStore::new());
        let deadline = start() + chrono::Duration::hours(1);
        let api = FakeMineApi::with_challenge("C1", deadline);
        let clock = Arc::new(ManualClock::new(start()));
        let mut orchestrator = orchestrator(
            Arc::clone(&store),
            Arc::clone(&api),
            clock,
            vec!["a1".to_string()],
        );

        orchestrator.prime_solved_cache();
        orchestrator.tick().await;

        let (item, result) = orchestrator.next_result().await.expect("mined");
        orchestrator.handle_result(item, result).await;

        assert_eq!(api.submissions.lock().unwrap().len(), 1);
        let solutions = SolutionsLedger::new(Arc::clone(&store));
        assert!(solutions.has_solution("a1", "C1").unwrap());
        let stats = StatsLedger::new(Arc::clone(&store)).load().unwrap();
        assert_eq!(stats.total_solutions, 1);

        // A second pass finds nothing to do: the pair is solved.
        orchestrator.tick().await;
        assert_eq!(orchestrator.pool.busy(), 0);
    }

    #[tokio::test]
    async fn solved_pairs_survive_restart_via_ledger() {
        let store = Arc::new(MemoryObjectStore::new());
        let deadline = start() + chrono::Duration::hours(1);
        let api = FakeMineApi::with_challenge("C1", deadline);
        let clock = Arc::new(ManualClock::new(start()));

        let mut first = orchestrator(
            Arc::clone(&store),
            Arc::clone(&api),
            Arc::clone(&clock),
            vec!["a1".to_string()],
        );
        first.prime_solved_cache();
        first.tick().await;
        let (item, result) = first.next_result().await.expect("mined");
        first.handle_result(item, result).await;

        // A fresh orchestrator (same worker restarted) primes from the
        // ledger and never re-dispatches the solved pair.
        let mut second = orchestrator(
            Arc::clone(&store),
            Arc::clone(&api),
            clock,
            vec!["a1".to_string()],
        );
        second.prime_solved_cache();
        second.tick().await;
        assert_eq!(second.pool.busy(), 0);
        assert_eq!(api.submissions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn expired_challenge_is_never_dispatched() {
        let store = Arc::new(MemoryObjectStore::new());
        let deadline = start() + chrono::Duration::minutes(1);
        let api = FakeMineApi::with_challenge("C1", deadline);
        let clock = Arc::new(ManualClock::new(start()));
        let mut orchestrator = orchestrator(
            Arc::clone(&store),
            api,
            Arc::clone(&clock),
            vec!["a1".to_string()],
        );

        clock.set(deadline + chrono::Duration::seconds(1));
        orchestrator.tick().await;
        assert_eq!(orchestrator.pool.busy(), 0);
    }
}
