use minecloud_primitives::QueuedChallenge;

/// One regular work item is replaced by a donation item roughly this
/// often.
pub const DONATION_INTERVAL: usize = 20;

/// Unit of mining dispatch: one (address, challenge) pair.
#[derive(Clone, Debug)]
pub struct WorkItem {
    pub address: String,
    pub challenge: QueuedChallenge,
    pub donation: bool,
}

impl WorkItem {
    pub fn key(&self) -> String {
        format!("{}-{}", self.address, self.challenge.challenge_id)
    }
}

/// Join local addresses against the active challenges, minus the pairs
/// the solutions ledger already holds. Challenges arrive easiest-first
/// and the queue preserves that: all items for the easiest challenge
/// precede any item for a harder one.
///
/// `solved` answers "has this address already solved this challenge";
/// `donation_address` (when available) is woven in as every
/// `DONATION_INTERVAL`-th item, always against the easiest challenge.
pub fn build_work_queue(
    addresses: &[String],
    challenges_easiest_first: &[QueuedChallenge],
    mut solved: impl FnMut(&str, &str) -> bool,
    donation_address: Option<&str>,
) -> Vec<WorkItem> {
    let mut queue = Vec::new();
    let mut since_donation = 0usize;
    let easiest = challenges_easiest_first.first();

    for challenge in challenges_easiest_first {
        for address in addresses {
            if solved(address, &challenge.challenge_id) {
                continue;
            }
            if let (Some(donation), Some(easiest)) = (donation_address, easiest) {
                if since_donation + 1 >= DONATION_INTERVAL {
                    queue.push(WorkItem {
                        address: donation.to_string(),
                        challenge: easiest.clone(),
                        donation: true,
                    });
                    since_donation = 0;
                }
            }
            queue.push(WorkItem {
                address: address.clone(),
                challenge: challenge.clone(),
                donation: false,
            });
            since_donation += 1;
        }
    }
    queue
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use minecloud_primitives::{ChallengeCache, Difficulty};

    fn challenge(id: &str, difficulty: &str) -> QueuedChallenge {
        let deadline = chrono::Utc.with_ymd_and_hms(2025, 10, 19, 9, 0, 0).unwrap();
        QueuedChallenge {
            challenge_id: id.to_string(),
            challenge_number: 1,
            day: 1,
            difficulty: Difficulty::new(difficulty),
            no_pre_mine: "00".repeat(32),
            no_pre_mine_hour: "509681483".to_string(),
            latest_submission: deadline,
            available_at: deadline - chrono::Duration::hours(1),
        }
    }

    fn easiest_first(challenges: Vec<QueuedChallenge>) -> Vec<QueuedChallenge> {
        let mut cache = ChallengeCache::default();
        for entry in challenges {
            cache.upsert(entry);
        }
        cache.sorted_easiest_first()
    }

    #[test]
    fn denser_difficulty_comes_first() {
        let challenges = easiest_first(vec![
            challenge("C2", "0000000F"),
            challenge("C1", "000007FF"),
        ]);
        let queue = build_work_queue(&["a".to_string()], &challenges, |_, _| false, None);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].challenge.challenge_id, "C1");
        assert_eq!(queue[1].challenge.challenge_id, "C2");
    }

    #[test]
    fn solved_pairs_are_skipped() {
        let challenges = easiest_first(vec![
            challenge("C1", "000007FF"),
            challenge("C2", "0000000F"),
        ]);
        let queue = build_work_queue(
            &["a".to_string()],
            &challenges,
            |address, challenge_id| address == "a" && challenge_id == "C1",
            None,
        );
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].address, "a");
        assert_eq!(queue[0].challenge.challenge_id, "C2");
    }

    #[test]
    fn donation_items_interleave_on_the_easiest_challenge() {
        let addresses: Vec<String> = (0..45).map(|i| format!("a{i}")).collect();
        let challenges = easiest_first(vec![
            challenge("C-hard", "0000000F"),
            challenge("C-easy", "000007FF"),
        ]);
        let queue = build_work_queue(&addresses, &challenges, |_, _| false, Some("addr-donate"));

        let donations: Vec<&WorkItem> = queue.iter().filter(|item| item.donation).collect();
        assert!(!donations.is_empty());
        for item in &donations {
            assert_eq!(item.address, "addr-donate");
            assert_eq!(item.challenge.challenge_id, "C-easy");
        }
        let regular = queue.len() - donations.len();
        assert_eq!(regular, 90);
        assert_eq!(donations.len(), regular / DONATION_INTERVAL);
    }

    #[test]
    fn no_donation_source_means_no_donation_items() {
        let addresses: Vec<String> = (0..45).map(|i| format!("a{i}")).collect();
        let challenges = easiest_first(vec![challenge("C1", "000007FF")]);
        let queue = build_work_queue(&addresses, &challenges, |_, _| false, None);
        assert_eq!(queue.len(), 45);
        assert!(queue.iter().all(|item| !item.donation));
    }
}
