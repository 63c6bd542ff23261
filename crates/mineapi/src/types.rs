use chrono::{DateTime, Utc};
use minecloud_primitives::{Difficulty, QueuedChallenge};
use serde::{Deserialize, Serialize};

/// Challenge payload as served by `GET /challenge`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ApiChallenge {
    pub challenge_id: String,
    #[serde(default)]
    pub challenge_number: Option<u32>,
    #[serde(default)]
    pub day: Option<u32>,
    #[serde(default)]
    pub issued_at: Option<DateTime<Utc>>,
    pub difficulty: String,
    pub no_pre_mine: String,
    pub latest_submission: DateTime<Utc>,
    pub no_pre_mine_hour: String,
}

impl ApiChallenge {
    /// Shape the wire challenge for the shared ledger.
    pub fn into_queued(self, now: DateTime<Utc>) -> QueuedChallenge {
        QueuedChallenge {
            challenge_id: self.challenge_id,
            challenge_number: self.challenge_number.unwrap_or(0),
            day: self.day.unwrap_or(0),
            difficulty: Difficulty::new(self.difficulty),
            no_pre_mine: self.no_pre_mine,
            no_pre_mine_hour: self.no_pre_mine_hour,
            latest_submission: self.latest_submission,
            available_at: self.issued_at.unwrap_or(now),
        }
    }
}

/// `GET /challenge` response, discriminated by `code`.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "code", rename_all = "lowercase")]
pub enum ChallengeStatus {
    Active {
        challenge: ApiChallenge,
        #[serde(default)]
        mining_period_ends: Option<DateTime<Utc>>,
        #[serde(default)]
        max_day: Option<u32>,
        #[serde(default)]
        total_challenges: Option<u32>,
        #[serde(default)]
        current_day: Option<u32>,
        #[serde(default)]
        next_challenge_starts_at: Option<DateTime<Utc>>,
    },
    Before {
        #[serde(default)]
        starts_at: Option<DateTime<Utc>>,
        #[serde(default)]
        next_challenge_starts_at: Option<DateTime<Utc>>,
    },
    After {
        #[serde(default)]
        mining_period_ends: Option<DateTime<Utc>>,
    },
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CryptoReceipt {
    pub preimage: String,
    pub timestamp: String,
    pub signature: String,
}

/// Receipt for an accepted solution. Every field is optional; the API
/// treats the 2xx status itself as the acknowledgement.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SolutionReceipt {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub challenge_id: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub crypto_receipt: Option<CryptoReceipt>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// `GET /TandC/{version}`. The `message` must be signed verbatim for
/// registration.
#[derive(Clone, Debug, Deserialize)]
pub struct TermsAndConditions {
    pub version: String,
    #[serde(default)]
    pub content: Option<String>,
    pub message: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RegistrationReceipt {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct DonationReceipt {
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub original: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn active_challenge_parses() {
        let json = r#"{
            "code": "active",
            "challenge": {
                "challenge_id": "**D07C10",
                "challenge_number": 7,
                "day": 2,
                "issued_at": "2025-10-19T08:00:00Z",
                "difficulty": "000FFFFF",
                "no_pre_mine": "fd651ac2725e3b9d804cc8b161c0709af14d6264f93e8d4afef0fd1142a3f011",
                "latest_submission": "2025-10-19T08:59:59Z",
                "no_pre_mine_hour": "509681483"
            },
            "mining_period_ends": "2025-11-08T00:00:00Z",
            "total_challenges": 480,
            "current_day": 2
        }"#;
        let status: ChallengeStatus = serde_json::from_str(json).expect("parse");
        match status {
            ChallengeStatus::Active {
                challenge,
                total_challenges,
                ..
            } => {
                assert_eq!(challenge.challenge_id, "**D07C10");
                assert_eq!(challenge.no_pre_mine_hour, "509681483");
                assert_eq!(total_challenges, Some(480));
            }
            other => panic!("expected active, got {other:?}"),
        }
    }

    #[test]
    fn before_and_after_parse_with_sparse_fields() {
        let before: ChallengeStatus =
            serde_json::from_str(r#"{"code":"before","starts_at":"2025-10-20T00:00:00Z"}"#)
                .expect("parse");
        assert!(matches!(before, ChallengeStatus::Before { .. }));

        let after: ChallengeStatus = serde_json::from_str(r#"{"code":"after"}"#).expect("parse");
        assert!(matches!(after, ChallengeStatus::After { .. }));
    }

    #[test]
    fn queued_conversion_fills_defaults() {
        let now = Utc.with_ymd_and_hms(2025, 10, 19, 8, 30, 0).unwrap();
        let challenge = ApiChallenge {
            challenge_id: "C1".to_string(),
            challenge_number: None,
            day: None,
            issued_at: None,
            difficulty: "0F".to_string(),
            no_pre_mine: "00".repeat(32),
            latest_submission: now + chrono::Duration::hours(1),
            no_pre_mine_hour: "1".to_string(),
        };
        let queued = challenge.into_queued(now);
        assert_eq!(queued.available_at, now);
        assert_eq!(queued.challenge_number, 0);
        assert_eq!(queued.difficulty.popcount(), 4);
    }

    #[test]
    fn receipt_tolerates_empty_body() {
        let receipt: SolutionReceipt = serde_json::from_str("{}").expect("parse");
        assert!(receipt.crypto_receipt.is_none());
    }
}
