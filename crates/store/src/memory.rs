use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::{CasOutcome, ETag, Object, ObjectMeta, ObjectStore, Precondition, StoreError};

/// In-memory store with monotonic revision ETags. Backs tests and
/// `--backend memory` dry runs.
#[derive(Default)]
pub struct MemoryObjectStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<String, Stored>,
    revision: u64,
}

struct Stored {
    bytes: Vec<u8>,
    etag: ETag,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store lock")
    }
}

impl Inner {
    fn next_etag(&mut self) -> ETag {
        self.revision += 1;
        ETag(format!("v{:016x}", self.revision))
    }
}

impl ObjectStore for MemoryObjectStore {
    fn get(&self, key: &str) -> Result<Option<Object>, StoreError> {
        let guard = self.lock();
        Ok(guard.objects.get(key).map(|stored| Object {
            bytes: stored.bytes.clone(),
            etag: stored.etag.clone(),
        }))
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<ETag, StoreError> {
        let mut guard = self.lock();
        let etag = guard.next_etag();
        guard.objects.insert(
            key.to_string(),
            Stored {
                bytes: bytes.to_vec(),
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }

    fn put_conditional(
        &self,
        key: &str,
        bytes: &[u8],
        precondition: Precondition,
    ) -> Result<CasOutcome, StoreError> {
        let mut guard = self.lock();
        let matches = match (&precondition, guard.objects.get(key)) {
            (Precondition::IfMatch(expected), Some(stored)) => stored.etag == *expected,
            (Precondition::IfMatch(_), None) => false,
            (Precondition::IfNoneMatch, existing) => existing.is_none(),
        };
        if !matches {
            return Ok(CasOutcome::PreconditionFailed);
        }
        let etag = guard.next_etag();
        guard.objects.insert(
            key.to_string(),
            Stored {
                bytes: bytes.to_vec(),
                etag: etag.clone(),
            },
        );
        Ok(CasOutcome::Committed(etag))
    }

    fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError> {
        let guard = self.lock();
        Ok(guard.objects.get(key).map(|stored| ObjectMeta {
            etag: stored.etag.clone(),
            size: stored.bytes.len() as u64,
        }))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let guard = self.lock();
        Ok(guard
            .objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock().objects.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let store = MemoryObjectStore::new();
        let etag = store.put("registry.json", b"{}").expect("put");
        let object = store.get("registry.json").expect("get").expect("present");
        assert_eq!(object.bytes, b"{}");
        assert_eq!(object.etag, etag);
        assert!(store.get("missing.json").expect("get").is_none());
    }

    #[test]
    fn if_match_commits_only_on_observed_revision() {
        let store = MemoryObjectStore::new();
        let first = store.put("k", b"one").expect("put");

        let outcome = store
            .put_conditional("k", b"two", Precondition::IfMatch(first.clone()))
            .expect("cas");
        let second = match outcome {
            CasOutcome::Committed(etag) => etag,
            CasOutcome::PreconditionFailed => panic!("expected commit"),
        };
        assert_ne!(first, second);

        // Replay against the stale tag loses.
        match store
            .put_conditional("k", b"three", Precondition::IfMatch(first))
            .expect("cas")
        {
            CasOutcome::PreconditionFailed => {}
            CasOutcome::Committed(_) => panic!("stale etag must not commit"),
        }
        assert_eq!(store.get("k").unwrap().unwrap().bytes, b"two");
    }

    #[test]
    fn if_none_match_only_creates() {
        let store = MemoryObjectStore::new();
        match store
            .put_conditional("k", b"one", Precondition::IfNoneMatch)
            .expect("cas")
        {
            CasOutcome::Committed(_) => {}
            CasOutcome::PreconditionFailed => panic!("create should commit"),
        }
        match store
            .put_conditional("k", b"two", Precondition::IfNoneMatch)
            .expect("cas")
        {
            CasOutcome::PreconditionFailed => {}
            CasOutcome::Committed(_) => panic!("second create must fail"),
        }
    }

    #[test]
    fn if_match_on_missing_key_fails() {
        let store = MemoryObjectStore::new();
        match store
            .put_conditional("k", b"x", Precondition::IfMatch(ETag("v1".into())))
            .expect("cas")
        {
            CasOutcome::PreconditionFailed => {}
            CasOutcome::Committed(_) => panic!("missing key must not match"),
        }
    }

    #[test]
    fn list_filters_by_prefix_sorted() {
        let store = MemoryObjectStore::new();
        store.put("heartbeats/w2.json", b"{}").unwrap();
        store.put("heartbeats/w1.json", b"{}").unwrap();
        store.put("registry.json", b"{}").unwrap();
        assert_eq!(
            store.list("heartbeats/").unwrap(),
            vec![
                "heartbeats/w1.json".to_string(),
                "heartbeats/w2.json".to_string()
            ]
        );
    }

    #[test]
    fn delete_is_idempotent() {
        let store = MemoryObjectStore::new();
        store.put("k", b"x").unwrap();
        store.delete("k").expect("delete");
        store.delete("k").expect("repeat delete");
        assert!(store.get("k").unwrap().is_none());
    }
}
