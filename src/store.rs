//! Durable store of payment records, keyed by payment hash.
//!
//! The store is the only mutable shared state in the gate. Mutating
//! operations take the write lock for the whole read-modify-persist
//! sequence, so two concurrent updates can never interleave and lose a
//! flush. Reads take the read lock and return clones; the backing map is
//! never handed out.
//!
//! Persistence is a single JSON file mapping hex payment hash to record,
//! rewritten atomically (temp file + rename) after every mutation and
//! loaded once at startup. A missing or corrupt file is an empty store,
//! not a fatal error.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::instrument;

use crate::timestamp::UnixTimestamp;
use crate::types::{PaymentHash, PaymentRecord};

/// Store failure. Only persistence can fail; in-memory operations are
/// infallible.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to persist payment store to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Durable mapping from payment hash to [`PaymentRecord`].
#[derive(Debug)]
pub struct PaymentStore {
    records: RwLock<HashMap<PaymentHash, PaymentRecord>>,
    path: PathBuf,
}

impl PaymentStore {
    /// Opens the store at `path`, loading any previously persisted records.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let records = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(records) => records,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Corrupt payment store file, starting empty");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Unreadable payment store file, starting empty");
                HashMap::new()
            }
        };
        if !records.is_empty() {
            tracing::info!(path = %path.display(), count = records.len(), "Loaded payment store");
        }
        Self {
            records: RwLock::new(records),
            path,
        }
    }

    /// Inserts or replaces a record and flushes the store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persist`] if the flush fails; the in-memory
    /// insert is rolled back so an unpersisted challenge is never honored.
    #[instrument(skip_all, fields(payment_hash = %payment_hash), err)]
    pub async fn put(
        &self,
        payment_hash: PaymentHash,
        record: PaymentRecord,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let previous = records.insert(payment_hash, record);
        if let Err(e) = self.flush(&records) {
            match previous {
                Some(previous) => records.insert(payment_hash, previous),
                None => records.remove(&payment_hash),
            };
            return Err(e);
        }
        Ok(())
    }

    /// A clone of the record for `payment_hash`, if present.
    pub async fn get(&self, payment_hash: &PaymentHash) -> Option<PaymentRecord> {
        let records = self.records.read().await;
        records.get(payment_hash).cloned()
    }

    /// Marks the record as paid. Idempotent: marking an already-paid record
    /// changes nothing and skips the flush. Returns `Ok(false)` for an
    /// unknown hash.
    #[instrument(skip_all, fields(payment_hash = %payment_hash), err)]
    pub async fn mark_paid(&self, payment_hash: &PaymentHash) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        match records.get_mut(payment_hash) {
            Some(record) if record.paid => Ok(true),
            Some(record) => {
                record.paid = true;
                if let Err(e) = self.flush(&records) {
                    // Roll back so memory and disk stay consistent.
                    if let Some(record) = records.get_mut(payment_hash) {
                        record.paid = false;
                    }
                    return Err(e);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Removes records older than `max_age`, returning how many were
    /// deleted. Flushes only when something was removed.
    #[instrument(skip_all, err)]
    pub async fn delete_older_than(&self, max_age: Duration) -> Result<usize, StoreError> {
        let now = UnixTimestamp::now();
        let max_age_secs = max_age.as_secs();
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| now.seconds_since(record.created_at) <= max_age_secs);
        let removed = before - records.len();
        if removed > 0 {
            self.flush(&records)?;
        }
        Ok(removed)
    }

    /// Cloned view of all records, for aggregate statistics.
    pub async fn snapshot(&self) -> Vec<(PaymentHash, PaymentRecord)> {
        let records = self.records.read().await;
        records.iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    /// Writes the full map to the backing file via a temp file in the same
    /// directory, then renames over the target.
    fn flush(&self, records: &HashMap<PaymentHash, PaymentRecord>) -> Result<(), StoreError> {
        let persist = |records| -> std::io::Result<()> {
            if let Some(parent) = self.path.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent)?;
            }
            let serialized = serde_json::to_vec(records)?;
            let tmp_path = self.path.with_extension("tmp");
            let mut tmp = fs::File::create(&tmp_path)?;
            tmp.write_all(&serialized)?;
            tmp.sync_all()?;
            fs::rename(&tmp_path, &self.path)?;
            Ok(())
        };
        persist(records).map_err(|source| StoreError::Persist {
            path: self.path.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AmountSats, ResourceId};
    use std::sync::Arc;

    fn store_in(dir: &tempfile::TempDir) -> PaymentStore {
        PaymentStore::open(dir.path().join("payments.json"))
    }

    fn hash(n: u8) -> PaymentHash {
        PaymentHash::from_bytes([n; 32])
    }

    fn record(id: &str, sats: u64) -> PaymentRecord {
        PaymentRecord::pending(ResourceId::new(id), AmountSats(sats))
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.put(hash(1), record("K01", 50)).await.unwrap();
        let got = store.get(&hash(1)).await.unwrap();
        assert_eq!(got.resource_id, ResourceId::new("K01"));
        assert!(!got.paid);
        assert!(store.get(&hash(2)).await.is_none());
    }

    #[tokio::test]
    async fn reload_sees_persisted_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payments.json");
        {
            let store = PaymentStore::open(&path);
            store.put(hash(1), record("K01", 50)).await.unwrap();
            store.put(hash(2), record("I01", 75)).await.unwrap();
            store.mark_paid(&hash(2)).await.unwrap();
        }
        let reloaded = PaymentStore::open(&path);
        assert!(!reloaded.get(&hash(1)).await.unwrap().paid);
        assert!(reloaded.get(&hash(2)).await.unwrap().paid);
        assert_eq!(reloaded.snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn missing_and_corrupt_files_are_empty_stores() {
        let dir = tempfile::tempdir().unwrap();
        let missing = PaymentStore::open(dir.path().join("nope.json"));
        assert!(missing.snapshot().await.is_empty());

        let corrupt_path = dir.path().join("corrupt.json");
        fs::write(&corrupt_path, b"{not json").unwrap();
        let corrupt = PaymentStore::open(&corrupt_path);
        assert!(corrupt.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn mark_paid_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.put(hash(1), record("K01", 50)).await.unwrap();
        assert!(store.mark_paid(&hash(1)).await.unwrap());
        assert!(store.mark_paid(&hash(1)).await.unwrap());
        assert!(store.get(&hash(1)).await.unwrap().paid);
        assert!(!store.mark_paid(&hash(9)).await.unwrap());
    }

    #[tokio::test]
    async fn delete_older_than_removes_stale_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let mut stale = record("K01", 50);
        stale.created_at = UnixTimestamp::now() - 90_000;
        store.put(hash(1), stale).await.unwrap();
        store.put(hash(2), record("K02", 50)).await.unwrap();

        let removed = store
            .delete_older_than(Duration::from_secs(86_400))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(&hash(1)).await.is_none());
        assert!(store.get(&hash(2)).await.is_some());

        // Nothing stale left; second sweep is a no-op.
        let removed = store
            .delete_older_than(Duration::from_secs(86_400))
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn concurrent_puts_all_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payments.json");
        let store = Arc::new(PaymentStore::open(&path));

        let mut handles = Vec::new();
        for n in 0..32u8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.put(hash(n), record("K01", 50)).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.snapshot().await.len(), 32);
        let reloaded = PaymentStore::open(&path);
        let snapshot = reloaded.snapshot().await;
        assert_eq!(snapshot.len(), 32);
        for (_, record) in snapshot {
            assert_eq!(record.amount_sats, AmountSats(50));
        }
    }
}
