//! Object-store contract shared by every fleet subsystem.
//!
//! The production bucket is any S3-compatible store; the coordinator
//! only relies on the capabilities pinned here: GET with an ETag,
//! conditional PUT (`If-Match` / `If-None-Match`) with a visible
//! precondition-failure outcome, HEAD, LIST and DELETE.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub mod dir;
pub mod memory;

/// Well-known keys in the per-region bucket namespace.
pub const REGISTRY_KEY: &str = "registry.json";
pub const CHALLENGES_KEY: &str = "challenges.json";
pub const STATS_KEY: &str = "solutions-stats.json";
pub const MINER_CODE_KEY: &str = "miner-code.tar.gz";
pub const SOLUTIONS_PREFIX: &str = "solutions/";
pub const HEARTBEATS_PREFIX: &str = "heartbeats/";

pub fn solutions_key(address: &str) -> String {
    format!("{SOLUTIONS_PREFIX}{address}.json")
}

pub fn heartbeat_key(worker_id: &str) -> String {
    format!("{HEARTBEATS_PREFIX}{worker_id}.json")
}

/// Account-qualified bucket name, one bucket per region.
pub fn bucket_name(prefix: &str, account: &str, region: &str) -> String {
    format!("{prefix}-{account}-{region}")
}

#[derive(Debug)]
pub enum StoreError {
    Backend(String),
    Codec(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(message) => write!(f, "{message}"),
            StoreError::Codec(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ETag(pub String);

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug)]
pub struct Object {
    pub bytes: Vec<u8>,
    pub etag: ETag,
}

#[derive(Clone, Debug)]
pub struct ObjectMeta {
    pub etag: ETag,
    pub size: u64,
}

/// Write guard for a conditional PUT.
#[derive(Clone, Debug)]
pub enum Precondition {
    /// Replace only the exact revision previously read.
    IfMatch(ETag),
    /// Create only; fails when the key already exists.
    IfNoneMatch,
}

/// Outcome of a conditional PUT. A lost race is an expected branch of
/// every optimistic update, not an error.
#[derive(Clone, Debug)]
pub enum CasOutcome {
    Committed(ETag),
    PreconditionFailed,
}

pub trait ObjectStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Object>, StoreError>;
    fn put(&self, key: &str, bytes: &[u8]) -> Result<ETag, StoreError>;
    fn put_conditional(
        &self,
        key: &str,
        bytes: &[u8],
        precondition: Precondition,
    ) -> Result<CasOutcome, StoreError>;
    fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError>;
    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
}

impl<T: ObjectStore + ?Sized> ObjectStore for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<Object>, StoreError> {
        self.as_ref().get(key)
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<ETag, StoreError> {
        self.as_ref().put(key, bytes)
    }

    fn put_conditional(
        &self,
        key: &str,
        bytes: &[u8],
        precondition: Precondition,
    ) -> Result<CasOutcome, StoreError> {
        self.as_ref().put_conditional(key, bytes, precondition)
    }

    fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError> {
        self.as_ref().head(key)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.as_ref().list(prefix)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.as_ref().delete(key)
    }
}

/// GET + JSON decode. A missing key is `None`, not an error.
pub fn get_json<T: DeserializeOwned>(
    store: &impl ObjectStore,
    key: &str,
) -> Result<Option<(T, ETag)>, StoreError> {
    let Some(object) = store.get(key)? else {
        return Ok(None);
    };
    let value = serde_json::from_slice(&object.bytes)
        .map_err(|err| StoreError::Codec(format!("{key}: {err}")))?;
    Ok(Some((value, object.etag)))
}

/// Serialize + blind PUT, for single-writer keys.
pub fn put_json<T: Serialize>(
    store: &impl ObjectStore,
    key: &str,
    value: &T,
) -> Result<ETag, StoreError> {
    let bytes =
        serde_json::to_vec(value).map_err(|err| StoreError::Codec(format!("{key}: {err}")))?;
    store.put(key, &bytes)
}

/// Serialize + conditional PUT, for optimistically locked keys.
pub fn put_json_conditional<T: Serialize>(
    store: &impl ObjectStore,
    key: &str,
    value: &T,
    precondition: Precondition,
) -> Result<CasOutcome, StoreError> {
    let bytes =
        serde_json::to_vec(value).map_err(|err| StoreError::Codec(format!("{key}: {err}")))?;
    store.put_conditional(key, &bytes, precondition)
}

/// Precondition matching the revision observed by `get_json`: replace
/// that revision when one was read, create otherwise.
pub fn replace_observed(etag: Option<&ETag>) -> Precondition {
    match etag {
        Some(etag) => Precondition::IfMatch(etag.clone()),
        None => Precondition::IfNoneMatch,
    }
}

/// Backoff delay for retry number `attempt` with up to 25% added jitter.
pub fn jittered_delay(base: Duration, cap: Duration, attempt: usize) -> Duration {
    let exp = attempt.min(16) as u32;
    let scaled = base.checked_mul(2u32.saturating_pow(exp)).unwrap_or(cap);
    let scaled = scaled.min(cap);
    let jitter = rand::thread_rng().gen_range(0..=scaled.as_millis().max(1) as u64 / 4);
    scaled + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_name_is_account_qualified() {
        assert_eq!(
            bucket_name("minecloud", "123456789012", "eu-west-1"),
            "minecloud-123456789012-eu-west-1"
        );
    }

    #[test]
    fn key_helpers() {
        assert_eq!(solutions_key("addr1"), "solutions/addr1.json");
        assert_eq!(heartbeat_key("i-0abc"), "heartbeats/i-0abc.json");
    }

    #[test]
    fn jittered_delay_respects_cap() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(10);
        for attempt in 0..20 {
            let delay = jittered_delay(base, cap, attempt);
            assert!(delay >= base);
            assert!(delay <= cap + cap / 4);
        }
    }
}
