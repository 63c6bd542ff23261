use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Strict cap on the `recent*` lists in the stats document.
pub const RECENT_CAP: usize = 20;

/// One accepted submission for an address.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SolutionRecord {
    pub challenge_id: String,
    pub nonce: String,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

/// Per-address submission history (`solutions/{address}.json`).
///
/// Append-only; at most one record per challenge id.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressSolutions {
    pub address: String,
    pub solutions: Vec<SolutionRecord>,
    pub last_updated: DateTime<Utc>,
}

impl AddressSolutions {
    pub fn new(address: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            address: address.into(),
            solutions: Vec::new(),
            last_updated: now,
        }
    }

    pub fn has_solution(&self, challenge_id: &str) -> bool {
        self.solutions
            .iter()
            .any(|record| record.challenge_id == challenge_id)
    }

    /// Merge a record, keeping the first record per challenge id.
    /// Returns true when the record was new.
    pub fn merge(&mut self, record: SolutionRecord, now: DateTime<Utc>) -> bool {
        if self.has_solution(&record.challenge_id) {
            return false;
        }
        self.solutions.push(record);
        self.last_updated = now;
        true
    }
}

/// Entry in `recentSolutions`.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentSolution {
    pub address: String,
    pub challenge_id: String,
    pub nonce: String,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

/// Entry in `recentErrors`.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentError {
    pub address: String,
    pub challenge_id: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

/// Fleet-wide telemetry document (`solutions-stats.json`), updated under
/// optimistic lock by every worker. Advisory, not a source of truth.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SolutionsStats {
    pub total_solutions: u64,
    pub donation_solutions: u64,
    pub total_errors: u64,
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recent_solutions: Vec<RecentSolution>,
    #[serde(default)]
    pub recent_errors: Vec<RecentError>,
}

impl SolutionsStats {
    pub fn note_solution(&mut self, entry: RecentSolution, donation: bool, now: DateTime<Utc>) {
        self.total_solutions = self.total_solutions.saturating_add(1);
        if donation {
            self.donation_solutions = self.donation_solutions.saturating_add(1);
        }
        self.recent_solutions.insert(0, entry);
        self.recent_solutions.truncate(RECENT_CAP);
        self.last_updated = Some(now);
    }

    pub fn note_error(&mut self, entry: RecentError, now: DateTime<Utc>) {
        self.total_errors = self.total_errors.saturating_add(1);
        self.recent_errors.insert(0, entry);
        self.recent_errors.truncate(RECENT_CAP);
        self.last_updated = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 19, 0, 0, secs).unwrap()
    }

    fn record(challenge_id: &str) -> SolutionRecord {
        SolutionRecord {
            challenge_id: challenge_id.to_string(),
            nonce: "0019c96b6a30ee38".to_string(),
            submitted_at: at(0),
            worker_id: Some("w1".to_string()),
        }
    }

    #[test]
    fn merge_is_idempotent_per_challenge() {
        let mut ledger = AddressSolutions::new("a", at(0));
        assert!(!ledger.has_solution("C1"));
        assert!(ledger.merge(record("C1"), at(1)));
        assert!(ledger.has_solution("C1"));
        assert!(!ledger.merge(record("C1"), at(2)));
        assert!(ledger.merge(record("C2"), at(3)));
        assert_eq!(ledger.solutions.len(), 2);
    }

    #[test]
    fn recent_lists_cap_at_twenty() {
        let mut stats = SolutionsStats::default();
        for i in 0..25u32 {
            stats.note_solution(
                RecentSolution {
                    address: format!("a{i}"),
                    challenge_id: "C1".to_string(),
                    nonce: format!("{i:016x}"),
                    submitted_at: at(i),
                    worker_id: None,
                },
                false,
                at(i),
            );
        }
        assert_eq!(stats.total_solutions, 25);
        assert_eq!(stats.recent_solutions.len(), RECENT_CAP);
        // Newest first; the oldest five were dropped.
        assert_eq!(stats.recent_solutions[0].address, "a24");
        assert_eq!(stats.recent_solutions[RECENT_CAP - 1].address, "a5");
    }

    #[test]
    fn counters_track_solutions_and_errors() {
        let mut stats = SolutionsStats::default();
        for i in 0..3u32 {
            stats.note_solution(
                RecentSolution {
                    address: "a".to_string(),
                    challenge_id: format!("C{i}"),
                    nonce: "00".to_string(),
                    submitted_at: at(i),
                    worker_id: None,
                },
                i == 0,
                at(i),
            );
        }
        stats.note_error(
            RecentError {
                address: "a".to_string(),
                challenge_id: "C9".to_string(),
                message: "HTTP 500".to_string(),
                occurred_at: at(9),
                worker_id: None,
            },
            at(9),
        );
        assert_eq!(stats.total_solutions, 3);
        assert_eq!(stats.donation_solutions, 1);
        assert_eq!(stats.total_errors, 1);
        assert_eq!(stats.recent_errors.len(), 1);
    }
}
