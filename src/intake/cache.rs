//! Content-addressed cache of extraction results.
//!
//! Keyed by the SHA-256 of a file's raw bytes, so byte-identical resubmissions
//! never pay for a second model call. Persisted as one JSON document that is
//! rewritten in full after every successful store (write-through). Persistence
//! fails open: a read or write error leaves the in-memory map authoritative
//! for the rest of the run.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::parser::DocumentFields;

/// Hex SHA-256 digest of a file's raw bytes, used as the cache key.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug)]
pub struct ResultCache {
    path: PathBuf,
    entries: Mutex<HashMap<String, DocumentFields>>,
}

impl ResultCache {
    /// Load the persisted cache; a missing or corrupt document is an empty
    /// cache, never a fatal error.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, DocumentFields>>(&raw) {
                Ok(map) => {
                    debug!(entries = map.len(), path = %path.display(), "analysis cache loaded");
                    map
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "analysis cache is corrupt, starting empty");
                    HashMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "analysis cache is unreadable, starting empty");
                HashMap::new()
            }
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    /// Pure read; no side effects.
    pub fn lookup(&self, hash: &str) -> Option<DocumentFields> {
        self.entries
            .lock()
            .expect("cache lock poisoned")
            .get(hash)
            .cloned()
    }

    /// Insert (or overwrite) an entry, then rewrite the persisted document.
    pub fn store(&self, hash: String, fields: DocumentFields) {
        let serialized = {
            let mut entries = self.entries.lock().expect("cache lock poisoned");
            entries.insert(hash, fields);
            serde_json::to_string_pretty(&*entries)
        };
        match serialized {
            Ok(json) => {
                if let Err(err) = std::fs::write(&self.path, json) {
                    warn!(path = %self.path.display(), error = %err, "failed to persist analysis cache");
                }
            }
            Err(err) => warn!(error = %err, "failed to serialize analysis cache"),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_fields() -> DocumentFields {
        DocumentFields {
            company_name: "Acme".to_string(),
            document_id: "INV-1".to_string(),
            document_date: "01/02/2025".to_string(),
        }
    }

    #[test]
    fn hash_is_stable_and_distinguishes_content() {
        let a = content_hash(b"same bytes");
        let b = content_hash(b"same bytes");
        let c = content_hash(b"other bytes");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn store_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");

        let cache = ResultCache::load(&path);
        assert!(cache.is_empty());
        cache.store(content_hash(b"doc"), sample_fields());
        assert_eq!(cache.lookup(&content_hash(b"doc")), Some(sample_fields()));

        // A fresh instance sees the persisted entry.
        let reloaded = ResultCache::load(&path);
        assert_eq!(reloaded.len(), 1);
        assert_eq!(
            reloaded.lookup(&content_hash(b"doc")),
            Some(sample_fields())
        );
    }

    #[test]
    fn corrupt_document_loads_as_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "{ not json").unwrap();

        let cache = ResultCache::load(&path);
        assert!(cache.is_empty());
    }

    #[test]
    fn persistence_failure_keeps_memory_authoritative() {
        // Point the persisted document at a path that cannot be created.
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing-subdir").join("cache.json");

        let cache = ResultCache::load(&path);
        cache.store(content_hash(b"doc"), sample_fields());
        assert_eq!(cache.lookup(&content_hash(b"doc")), Some(sample_fields()));
    }
}
