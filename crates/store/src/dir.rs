use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use crate::{CasOutcome, ETag, Object, ObjectMeta, ObjectStore, Precondition, StoreError};

/// Filesystem-backed store: one file per key under a root directory,
/// ETag = SHA-256 of content, atomic rename writes. A store-wide mutex
/// makes conditional writes linearizable within one process; pointing
/// several processes at the same root is for a shared filesystem whose
/// rename is atomic.
pub struct DirObjectStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl DirObjectStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() || key.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(StoreError::Backend(format!("invalid object key '{key}'")));
        }
        Ok(self.root.join(key))
    }

    fn read(&self, key: &str) -> Result<Option<Object>, StoreError> {
        let path = self.path_for(key)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::Backend(err.to_string())),
        };
        let etag = content_etag(&bytes);
        Ok(Some(Object { bytes, etag }))
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<ETag, StoreError> {
        let path = self.path_for(key)?;
        write_file_atomic(&path, bytes)?;
        Ok(content_etag(bytes))
    }
}

fn content_etag(bytes: &[u8]) -> ETag {
    ETag(hex::encode(Sha256::digest(bytes)))
}

fn write_file_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| StoreError::Backend(err.to_string()))?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(|err| StoreError::Backend(err.to_string()))?;
    if fs::rename(&tmp, path).is_err() {
        let _ = fs::remove_file(path);
        fs::rename(&tmp, path).map_err(|err| StoreError::Backend(err.to_string()))?;
    }
    Ok(())
}

impl ObjectStore for DirObjectStore {
    fn get(&self, key: &str) -> Result<Option<Object>, StoreError> {
        let _guard = self.lock.lock().expect("dir store lock");
        self.read(key)
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<ETag, StoreError> {
        let _guard = self.lock.lock().expect("dir store lock");
        self.write(key, bytes)
    }

    fn put_conditional(
        &self,
        key: &str,
        bytes: &[u8],
        precondition: Precondition,
    ) -> Result<CasOutcome, StoreError> {
        let _guard = self.lock.lock().expect("dir store lock");
        let current = self.read(key)?;
        let matches = match (&precondition, &current) {
            (Precondition::IfMatch(expected), Some(object)) => object.etag == *expected,
            (Precondition::IfMatch(_), None) => false,
            (Precondition::IfNoneMatch, existing) => existing.is_none(),
        };
        if !matches {
            return Ok(CasOutcome::PreconditionFailed);
        }
        self.write(key, bytes).map(CasOutcome::Committed)
    }

    fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError> {
        let _guard = self.lock.lock().expect("dir store lock");
        Ok(self.read(key)?.map(|object| ObjectMeta {
            size: object.bytes.len() as u64,
            etag: object.etag,
        }))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let _guard = self.lock.lock().expect("dir store lock");
        let mut keys = Vec::new();
        collect_keys(&self.root, &self.root, &mut keys)?;
        keys.retain(|key| key.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().expect("dir store lock");
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Backend(err.to_string())),
        }
    }
}

fn collect_keys(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<(), StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(StoreError::Backend(err.to_string())),
    };
    for entry in entries {
        let entry = entry.map_err(|err| StoreError::Backend(err.to_string()))?;
        let path = entry.path();
        if path.is_dir() {
            collect_keys(root, &path, out)?;
            continue;
        }
        if path.extension().and_then(|ext| ext.to_str()) == Some("tmp") {
            continue;
        }
        let relative = path
            .strip_prefix(root)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        let key = relative
            .components()
            .map(|part| part.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        out.push(key);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn scratch_store(label: &str) -> DirObjectStore {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        let root = std::env::temp_dir().join(format!(
            "minecloud-store-{}-{label}-{seq}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&root);
        DirObjectStore::open(root).expect("open store")
    }

    #[test]
    fn etag_tracks_content() {
        let store = scratch_store("etag");
        let first = store.put("registry.json", b"one").unwrap();
        let second = store.put("registry.json", b"two").unwrap();
        assert_ne!(first, second);
        let object = store.get("registry.json").unwrap().unwrap();
        assert_eq!(object.etag, second);
    }

    #[test]
    fn conditional_put_guards_revision() {
        let store = scratch_store("cas");
        let etag = store.put("k", b"one").unwrap();
        match store
            .put_conditional("k", b"two", Precondition::IfMatch(etag.clone()))
            .unwrap()
        {
            CasOutcome::Committed(_) => {}
            CasOutcome::PreconditionFailed => panic!("expected commit"),
        }
        match store
            .put_conditional("k", b"three", Precondition::IfMatch(etag))
            .unwrap()
        {
            CasOutcome::PreconditionFailed => {}
            CasOutcome::Committed(_) => panic!("stale etag must not commit"),
        }
    }

    #[test]
    fn nested_keys_and_list() {
        let store = scratch_store("list");
        store.put("solutions/a1.json", b"{}").unwrap();
        store.put("solutions/a2.json", b"{}").unwrap();
        store.put("heartbeats/w1.json", b"{}").unwrap();
        assert_eq!(
            store.list("solutions/").unwrap(),
            vec![
                "solutions/a1.json".to_string(),
                "solutions/a2.json".to_string()
            ]
        );
    }

    #[test]
    fn rejects_escaping_keys() {
        let store = scratch_store("keys");
        assert!(store.put("../outside", b"x").is_err());
        assert!(store.get("").is_err());
    }

    #[test]
    fn delete_missing_is_ok() {
        let store = scratch_store("delete");
        store.delete("absent.json").expect("idempotent delete");
    }
}
