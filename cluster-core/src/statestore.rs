//! Persistent key-value state store
//!
//! The core treats persistence as an opaque string-keyed, byte-valued
//! store with ordered prefix iteration. Two implementations are provided:
//! an in-memory store for tests and a RocksDB-backed store for nodes.

use rocksdb::{IteratorMode, Options, DB};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("entry not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] rocksdb::Error),

    #[error("iteration aborted: {0}")]
    IterationAborted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of one iteration callback step.
pub enum IterOp {
    Continue,
    Stop,
}

/// String-keyed byte store with ordered prefix iteration.
///
/// `put` is last-writer-wins; callers needing read-modify-write atomicity
/// hold their own per-entry locks across the read and the write.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Iterate entries whose key starts with `prefix`, in key order.
    /// The callback may stop early or surface an error, which aborts the
    /// scan and propagates to the caller.
    fn iterate(
        &self,
        prefix: &str,
        cb: &mut dyn FnMut(&str, &[u8]) -> Result<IterOp, StoreError>,
    ) -> Result<(), StoreError>;
}

/// In-memory store backed by a BTreeMap; iteration order matches RocksDB.
#[derive(Default)]
pub struct MemStateStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemStateStore {
    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(key);
        Ok(())
    }

    fn iterate(
        &self,
        prefix: &str,
        cb: &mut dyn FnMut(&str, &[u8]) -> Result<IterOp, StoreError>,
    ) -> Result<(), StoreError> {
        // Snapshot under the lock so the callback can re-enter the store.
        let snapshot: Vec<(String, Vec<u8>)> = {
            let entries = self.entries.lock().unwrap();
            entries
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        for (key, value) in snapshot {
            match cb(&key, &value)? {
                IterOp::Continue => {}
                IterOp::Stop => break,
            }
        }
        Ok(())
    }
}

/// RocksDB-backed store, tuned for small point lookups.
pub struct RocksStateStore {
    db: Arc<DB>,
}

impl RocksStateStore {
    /// Open (or create) the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.optimize_for_point_lookup(64); // 64MB block cache
        opts.increase_parallelism(num_cpus::get() as i32);
        opts.set_write_buffer_size(16 * 1024 * 1024);

        let db = DB::open(&opts, path.as_ref())?;
        info!("Opened RocksDB state store at {:?}", path.as_ref());
        Ok(Self { db: Arc::new(db) })
    }
}

impl StateStore for RocksStateStore {
    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.db
            .get(key.as_bytes())?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.db.put(key.as_bytes(), value)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.db.delete(key.as_bytes())?;
        Ok(())
    }

    fn iterate(
        &self,
        prefix: &str,
        cb: &mut dyn FnMut(&str, &[u8]) -> Result<IterOp, StoreError>,
    ) -> Result<(), StoreError> {
        let iter = self.db.iterator(IteratorMode::From(
            prefix.as_bytes(),
            rocksdb::Direction::Forward,
        ));

        for entry in iter {
            let (key, value) = entry?;
            let key_str = match std::str::from_utf8(&key) {
                Ok(s) => s,
                Err(_) => continue, // non-ASCII keys are foreign to the core
            };
            if !key_str.starts_with(prefix) {
                break;
            }
            match cb(key_str, &value)? {
                IterOp::Continue => {}
                IterOp::Stop => break,
            }
        }
        Ok(())
    }
}
