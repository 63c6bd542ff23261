use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use minecloud_ledger::StatsLedger;
use minecloud_store::ObjectStore;

/// Counters for this worker's session, shared between the orchestrator
/// and the status logger.
#[derive(Default)]
pub struct SessionCounters {
    pub solutions: AtomicU64,
    pub duplicates: AtomicU64,
    pub errors: AtomicU64,
    pub expired: AtomicU64,
    pub crashes: AtomicU64,
    pub misses: AtomicU64,
    pub queue_depth: AtomicU64,
    pub busy_workers: AtomicU64,
}

impl SessionCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set(counter: &AtomicU64, value: u64) {
        counter.store(value, Ordering::Relaxed);
    }
}

/// Latest `work_to_star_rate` tail element, refreshed with the
/// challenge poll.
pub type RewardRate = Arc<Mutex<Option<f64>>>;

/// Periodic one-line status, in the vein of a sync daemon's progress
/// log. Runs until the process exits.
pub fn status_loop<S: ObjectStore>(
    stats: StatsLedger<S>,
    counters: Arc<SessionCounters>,
    reward_rate: RewardRate,
    interval_secs: u64,
    started: Instant,
) {
    if interval_secs == 0 {
        return;
    }
    loop {
        std::thread::sleep(Duration::from_secs(interval_secs));
        let line = render_status(&stats, &counters, &reward_rate, started);
        println!("{line}");
    }
}

fn render_status<S: ObjectStore>(
    stats: &StatsLedger<S>,
    counters: &SessionCounters,
    reward_rate: &RewardRate,
    started: Instant,
) -> String {
    let uptime = started.elapsed().as_secs();
    let solutions = counters.solutions.load(Ordering::Relaxed);
    let duplicates = counters.duplicates.load(Ordering::Relaxed);
    let errors = counters.errors.load(Ordering::Relaxed);
    let expired = counters.expired.load(Ordering::Relaxed);
    let queue = counters.queue_depth.load(Ordering::Relaxed);
    let busy = counters.busy_workers.load(Ordering::Relaxed);

    let per_hour = if uptime > 0 {
        solutions as f64 * 3600.0 / uptime as f64
    } else {
        0.0
    };
    let mut line = format!(
        "status: queue {queue} busy {busy} session solved {solutions} dup {duplicates} \
         err {errors} expired {expired} ({per_hour:.1}/h)"
    );

    match stats.load() {
        Ok(fleet) => {
            line.push_str(&format!(
                " fleet total {} donation {} err {}",
                fleet.total_solutions, fleet.donation_solutions, fleet.total_errors
            ));
        }
        Err(err) => {
            line.push_str(&format!(" fleet stats unavailable ({err})"));
        }
    }

    if let Ok(guard) = reward_rate.lock() {
        if let Some(rate) = *guard {
            line.push_str(&format!(" rate {:.4} star/solution", rate));
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use minecloud_store::memory::MemoryObjectStore;

    #[test]
    fn status_line_carries_session_and_fleet_numbers() {
        let stats = StatsLedger::new(MemoryObjectStore::new());
        let counters = SessionCounters::default();
        counters.solutions.store(7, Ordering::Relaxed);
        counters.queue_depth.store(42, Ordering::Relaxed);
        let rate: RewardRate = Arc::new(Mutex::new(Some(0.25)));

        let line = render_status(&stats, &counters, &rate, Instant::now());
        assert!(line.contains("solved 7"));
        assert!(line.contains("queue 42"));
        assert!(line.contains("fleet total 0"));
        assert!(line.contains("0.2500 star/solution"));
    }
}
