//! In-memory persistence adapter.
//!
//! Backs tests and persistence-free deployments. Mirrors the snapshot +
//! update-log split of the RocksDB store, and can inject save failures and
//! load delays to exercise the retry and race paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use yrs::updates::decoder::Decode;
use yrs::{ReadTxn, StateVector, Transact};

use super::{PersistenceAdapter, StoreError};

#[derive(Default)]
struct FileSlot {
    raw: Vec<u8>,
    snapshot: Option<Vec<u8>>,
    updates: Vec<Vec<u8>>,
}

/// HashMap-backed adapter with injectable save failures.
#[derive(Default)]
pub struct MemoryAdapter {
    files: Mutex<HashMap<(String, String), FileSlot>>,
    /// Next N saves fail with a backend error.
    fail_saves: AtomicU32,
    /// Milliseconds every `load` stalls for.
    load_delay_ms: AtomicU64,
    save_count: AtomicU64,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` saves fail.
    pub fn fail_next_saves(&self, n: u32) {
        self.fail_saves.store(n, Ordering::SeqCst);
    }

    /// Stall every `load` by `delay`, widening race windows for tests.
    pub fn delay_loads(&self, delay: Duration) {
        self.load_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Total successful saves.
    pub fn save_count(&self) -> u64 {
        self.save_count.load(Ordering::SeqCst)
    }

    /// Seed a file directly, bypassing `save` bookkeeping.
    pub fn seed(&self, bucket: &str, path: &str, raw: &[u8], snapshot: Option<Vec<u8>>) {
        let mut files = self.files.lock().expect("memory adapter lock poisoned");
        files.insert(
            (bucket.to_string(), path.to_string()),
            FileSlot {
                raw: raw.to_vec(),
                snapshot,
                updates: Vec::new(),
            },
        );
    }

    /// Number of incremental updates currently logged for a file.
    pub fn update_count(&self, bucket: &str, path: &str) -> usize {
        let files = self.files.lock().expect("memory adapter lock poisoned");
        files
            .get(&(bucket.to_string(), path.to_string()))
            .map(|slot| slot.updates.len())
            .unwrap_or(0)
    }
}

impl PersistenceAdapter for MemoryAdapter {
    fn load(&self, bucket: &str, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let delay = self.load_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            // Runs on the blocking pool, so a thread sleep is fine here.
            std::thread::sleep(Duration::from_millis(delay));
        }
        let files = self.files.lock().expect("memory adapter lock poisoned");
        Ok(files
            .get(&(bucket.to_string(), path.to_string()))
            .map(|slot| slot.raw.clone()))
    }

    fn load_structured_state(
        &self,
        bucket: &str,
        path: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let files = self.files.lock().expect("memory adapter lock poisoned");
        let slot = match files.get(&(bucket.to_string(), path.to_string())) {
            Some(slot) => slot,
            None => return Ok(None),
        };
        if slot.snapshot.is_none() && slot.updates.is_empty() {
            return Ok(None);
        }

        let doc = yrs::Doc::new();
        {
            let mut txn = doc.transact_mut();
            for blob in slot.snapshot.iter().chain(slot.updates.iter()) {
                let update = yrs::Update::decode_v1(blob)
                    .map_err(|e| StoreError::CorruptBlob(e.to_string()))?;
                txn.apply_update(update)
                    .map_err(|e| StoreError::CorruptBlob(e.to_string()))?;
            }
        }
        let txn = doc.transact();
        Ok(Some(txn.encode_state_as_update_v1(&StateVector::default())))
    }

    fn save(
        &self,
        bucket: &str,
        path: &str,
        raw: &[u8],
        state_blob: &[u8],
        write_snapshot: bool,
    ) -> Result<(), StoreError> {
        loop {
            let remaining = self.fail_saves.load(Ordering::SeqCst);
            if remaining == 0 {
                break;
            }
            if self
                .fail_saves
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Err(StoreError::Backend("injected save failure".into()));
            }
        }

        let mut files = self.files.lock().expect("memory adapter lock poisoned");
        let slot = files
            .entry((bucket.to_string(), path.to_string()))
            .or_default();
        slot.raw = raw.to_vec();
        if write_snapshot {
            slot.snapshot = Some(state_blob.to_vec());
            slot.updates.clear();
        } else {
            slot.updates.push(state_blob.to_vec());
        }
        self.save_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn exists(&self, bucket: &str, path: &str) -> Result<bool, StoreError> {
        let files = self.files.lock().expect("memory adapter lock poisoned");
        Ok(files.contains_key(&(bucket.to_string(), path.to_string())))
    }
}
