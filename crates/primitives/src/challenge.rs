use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Challenge difficulty mask, kept in its wire form (a hex string).
///
/// A candidate hash H satisfies the mask D iff `H OR D == D` over the
/// mask-length prefix, i.e. every bit set in H is also set in D. The
/// number of set bits is therefore the sole scalar measure of how easy
/// a challenge is: one more set bit roughly doubles the valid-hash
/// density.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Difficulty(String);

impl Difficulty {
    pub fn new(hex_mask: impl Into<String>) -> Self {
        Self(hex_mask.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn mask_bytes(&self) -> Option<Vec<u8>> {
        hex::decode(&self.0).ok()
    }

    /// Count of set bits in the mask. An undecodable mask counts as 0
    /// (no valid hashes, hardest), which sorts it last in the queue.
    pub fn popcount(&self) -> u32 {
        self.mask_bytes()
            .map(|bytes| bytes.iter().map(|b| b.count_ones()).sum())
            .unwrap_or(0)
    }

    /// Subset-mask check over the mask-length prefix of `hash`.
    pub fn allows(&self, hash: &[u8]) -> bool {
        let Some(mask) = self.mask_bytes() else {
            return false;
        };
        if hash.len() < mask.len() {
            return false;
        }
        mask.iter().zip(hash).all(|(diff, byte)| byte & !diff == 0)
    }

    /// `true` if `self` is strictly easier than `other` (denser mask).
    pub fn easier_than(&self, other: &Difficulty) -> bool {
        self.popcount() > other.popcount()
    }
}

impl std::fmt::Display for Difficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One known-active challenge as cached in the shared challenge ledger.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedChallenge {
    pub challenge_id: String,
    pub challenge_number: u32,
    pub day: u32,
    pub difficulty: Difficulty,
    pub no_pre_mine: String,
    pub no_pre_mine_hour: String,
    pub latest_submission: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
}

impl QueuedChallenge {
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.latest_submission <= now
    }
}

/// The shared `challenges.json` document.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeCache {
    pub challenges: Vec<QueuedChallenge>,
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub region: String,
}

impl ChallengeCache {
    /// Insert or replace by `challenge_id`. Returns true when the entry
    /// was new.
    pub fn upsert(&mut self, challenge: QueuedChallenge) -> bool {
        match self
            .challenges
            .iter_mut()
            .find(|entry| entry.challenge_id == challenge.challenge_id)
        {
            Some(existing) => {
                *existing = challenge;
                false
            }
            None => {
                self.challenges.push(challenge);
                true
            }
        }
    }

    /// Drop challenges whose submission window has closed. Returns how
    /// many were removed.
    pub fn prune_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.challenges.len();
        self.challenges.retain(|entry| !entry.expired(now));
        before - self.challenges.len()
    }

    /// Active challenges, easiest first (descending set-bit count, then
    /// challenge id for a deterministic order).
    pub fn sorted_easiest_first(&self) -> Vec<QueuedChallenge> {
        let mut out = self.challenges.clone();
        out.sort_by(|a, b| {
            b.difficulty
                .popcount()
                .cmp(&a.difficulty.popcount())
                .then_with(|| a.challenge_id.cmp(&b.challenge_id))
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn challenge(id: &str, difficulty: &str, deadline: DateTime<Utc>) -> QueuedChallenge {
        QueuedChallenge {
            challenge_id: id.to_string(),
            challenge_number: 1,
            day: 1,
            difficulty: Difficulty::new(difficulty),
            no_pre_mine: "00".repeat(32),
            no_pre_mine_hour: "509681483".to_string(),
            latest_submission: deadline,
            available_at: Utc.with_ymd_and_hms(2025, 10, 19, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn popcount_counts_set_bits() {
        assert_eq!(Difficulty::new("000007FF").popcount(), 11);
        assert_eq!(Difficulty::new("0000000F").popcount(), 4);
        assert_eq!(Difficulty::new("FFFFFFFF").popcount(), 32);
        assert_eq!(Difficulty::new("not-hex").popcount(), 0);
    }

    #[test]
    fn allows_is_subset_mask_check() {
        let diff = Difficulty::new("000FFFFF");
        assert!(diff.allows(&hex::decode("000694200fb04137").unwrap()));
        assert!(!diff.allows(&hex::decode("FFFFFFFF").unwrap()));
        assert!(Difficulty::new("FFFFFFFF").allows(&hex::decode("00000000").unwrap()));
        assert!(Difficulty::new("000FFFFF").allows(&hex::decode("000FFFFF").unwrap()));
    }

    #[test]
    fn denser_mask_is_easier() {
        let easy = Difficulty::new("000007FF");
        let hard = Difficulty::new("0000000F");
        assert!(easy.easier_than(&hard));
        assert!(!hard.easier_than(&easy));
    }

    #[test]
    fn upsert_replaces_by_id() {
        let deadline = Utc.with_ymd_and_hms(2025, 10, 19, 8, 59, 59).unwrap();
        let mut cache = ChallengeCache::default();
        assert!(cache.upsert(challenge("C1", "0F", deadline)));
        assert!(!cache.upsert(challenge("C1", "FF", deadline)));
        assert_eq!(cache.challenges.len(), 1);
        assert_eq!(cache.challenges[0].difficulty.as_str(), "FF");
    }

    #[test]
    fn prune_drops_closed_windows() {
        let deadline = Utc.with_ymd_and_hms(2025, 10, 19, 8, 59, 59).unwrap();
        let mut cache = ChallengeCache::default();
        cache.upsert(challenge("C1", "0F", deadline));
        cache.upsert(challenge("C2", "0F", deadline + chrono::Duration::hours(2)));

        assert_eq!(cache.prune_expired(deadline + chrono::Duration::seconds(1)), 1);
        assert_eq!(cache.challenges.len(), 1);
        assert_eq!(cache.challenges[0].challenge_id, "C2");
    }

    #[test]
    fn sorted_easiest_first_uses_popcount() {
        let deadline = Utc.with_ymd_and_hms(2025, 10, 19, 8, 59, 59).unwrap();
        let mut cache = ChallengeCache::default();
        cache.upsert(challenge("C2", "0000000F", deadline));
        cache.upsert(challenge("C1", "000007FF", deadline));

        let sorted = cache.sorted_easiest_first();
        assert_eq!(sorted[0].challenge_id, "C1");
        assert_eq!(sorted[1].challenge_id, "C2");
    }

    #[test]
    fn camel_case_round_trip() {
        let deadline = Utc.with_ymd_and_hms(2025, 10, 19, 8, 59, 59).unwrap();
        let json = serde_json::to_value(challenge("C1", "0F", deadline)).unwrap();
        assert!(json.get("challengeId").is_some());
        assert!(json.get("latestSubmission").is_some());
        let back: QueuedChallenge = serde_json::from_value(json).unwrap();
        assert_eq!(back.challenge_id, "C1");
    }
}
