// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! The durable state store.
//!
//! One sled file per node. Buckets are key prefixes within a single tree so
//! that one committed batch is atomic across buckets. Every other crate reads
//! through snapshots ([`Store::get_json`], [`Store::iter_prefix`]) and writes
//! through [`Txn`]; the store serializes committers internally.

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

mod bucket;
pub use bucket::Bucket;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing file failed. The store stays consistent; the caller must
    /// treat the operation as not having happened.
    #[error("store io: {0}")]
    Io(#[from] sled::Error),
    #[error("corrupt value under {bucket}/{key}: {source}")]
    Corrupt {
        bucket: Bucket,
        key: String,
        source: serde_json::Error,
    },
    #[error("value encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    /// Stable error-kind string for the RPC/API surface.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Io(_) => "fatal-io",
            StoreError::Corrupt { .. } | StoreError::Encode(_) => "fatal-io",
        }
    }
}

/// Single-writer, multi-reader store over one sled tree.
///
/// sled's log replay on open covers the crash-recovery contract: a torn tail
/// is discarded, a complete one is applied.
pub struct Store {
    db: sled::Db,
    write_guard: Mutex<()>,
}

impl Store {
    /// Open (creating if absent) the store at `path`.
    pub fn open(path: &Path) -> Result<Store, StoreError> {
        let db = sled::open(path)?;
        info!("opened state store at {}, {} keys", path.display(), db.len());
        Ok(Store {
            db,
            write_guard: Mutex::new(()),
        })
    }

    /// Begin a buffered transaction. Writes are invisible until `commit`.
    #[must_use]
    pub fn begin(&self) -> Txn<'_> {
        Txn {
            store: self,
            pending: BTreeMap::new(),
        }
    }

    pub fn get(&self, bucket: Bucket, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .db
            .get(bucket.full_key(key))?
            .map(|ivec| ivec.to_vec()))
    }

    pub fn get_json<T: DeserializeOwned>(
        &self,
        bucket: Bucket,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        match self.get(bucket, key)? {
            None => Ok(None),
            Some(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|source| StoreError::Corrupt {
                    bucket,
                    key: key.to_string(),
                    source,
                }),
        }
    }

    /// Iterate `(key, value)` pairs in a bucket, optionally narrowed by a key
    /// prefix. Keys come back stripped of the bucket prefix.
    pub fn iter_prefix(
        &self,
        bucket: Bucket,
        prefix: &str,
    ) -> impl Iterator<Item = Result<(String, Vec<u8>), StoreError>> + '_ {
        let scan = self.db.scan_prefix(bucket.full_key(prefix));
        let strip = bucket.prefix_len();
        scan.map(move |entry| {
            let (key, value) = entry?;
            let key = String::from_utf8_lossy(&key[strip..]).to_string();
            Ok((key, value.to_vec()))
        })
    }

    /// Typed bucket scan; corrupt entries abort the scan with `Corrupt`.
    pub fn scan_json<T: DeserializeOwned>(
        &self,
        bucket: Bucket,
    ) -> Result<Vec<(String, T)>, StoreError> {
        let mut out = Vec::new();
        for entry in self.iter_prefix(bucket, "") {
            let (key, raw) = entry?;
            let value =
                serde_json::from_slice(&raw).map_err(|source| StoreError::Corrupt {
                    bucket,
                    key: key.clone(),
                    source,
                })?;
            out.push((key, value));
        }
        Ok(out)
    }

    pub fn count(&self, bucket: Bucket) -> usize {
        self.db.scan_prefix(bucket.full_key("")).count()
    }

    /// Flush without writing; used by the supervisor's health probe.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn commit_pending(
        &self,
        pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    ) -> Result<(), StoreError> {
        let _serialize = self.write_guard.lock();
        let mut batch = sled::Batch::default();
        let mutations = pending.len();
        for (key, value) in pending {
            match value {
                Some(value) => batch.insert(key, value),
                None => batch.remove(key),
            }
        }
        self.db.apply_batch(batch)?;
        // Durability: the batch must hit disk before commit returns.
        self.db.flush()?;
        debug!("committed {mutations} mutations");
        Ok(())
    }
}

/// A buffered write transaction.
///
/// Reads through a `Txn` see its own pending writes first (read-your-writes),
/// then the committed tree. Dropping the transaction discards it.
pub struct Txn<'a> {
    store: &'a Store,
    pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl Txn<'_> {
    pub fn get(&self, bucket: Bucket, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let full = bucket.full_key(key);
        if let Some(buffered) = self.pending.get(&full) {
            return Ok(buffered.clone());
        }
        self.store.get(bucket, key)
    }

    pub fn get_json<T: DeserializeOwned>(
        &self,
        bucket: Bucket,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        match self.get(bucket, key)? {
            None => Ok(None),
            Some(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|source| StoreError::Corrupt {
                    bucket,
                    key: key.to_string(),
                    source,
                }),
        }
    }

    pub fn put(&mut self, bucket: Bucket, key: &str, value: Vec<u8>) {
        self.pending.insert(bucket.full_key(key), Some(value));
    }

    pub fn put_json<T: Serialize>(
        &mut self,
        bucket: Bucket,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_vec(value)?;
        self.put(bucket, key, raw);
        Ok(())
    }

    pub fn delete(&mut self, bucket: Bucket, key: &str) {
        self.pending.insert(bucket.full_key(key), None);
    }

    /// Atomically apply and fsync every buffered mutation.
    pub fn commit(self) -> Result<(), StoreError> {
        self.store.commit_pending(self.pending)
    }

    /// Discard the buffer. Equivalent to dropping, spelled out for call sites
    /// that abort on purpose.
    pub fn abort(self) {
        drop(self);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Lease {
        ip: String,
        hostname: String,
    }

    fn open_temp() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("state.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn commit_makes_writes_visible() {
        let (_dir, store) = open_temp();
        let lease = Lease {
            ip: "192.168.1.100".into(),
            hostname: "printer".into(),
        };
        let mut txn = store.begin();
        txn.put_json(Bucket::DhcpLeases, "aa:bb:cc:dd:ee:01", &lease)
            .unwrap();
        // Not visible outside the txn before commit.
        assert!(
            store
                .get_json::<Lease>(Bucket::DhcpLeases, "aa:bb:cc:dd:ee:01")
                .unwrap()
                .is_none()
        );
        // Visible inside (read-your-writes).
        assert_eq!(
            txn.get_json::<Lease>(Bucket::DhcpLeases, "aa:bb:cc:dd:ee:01")
                .unwrap(),
            Some(lease.clone())
        );
        txn.commit().unwrap();
        assert_eq!(
            store
                .get_json::<Lease>(Bucket::DhcpLeases, "aa:bb:cc:dd:ee:01")
                .unwrap(),
            Some(lease)
        );
    }

    #[test]
    fn abort_discards() {
        let (_dir, store) = open_temp();
        let mut txn = store.begin();
        txn.put(Bucket::Flows, "k", b"v".to_vec());
        txn.abort();
        assert!(store.get(Bucket::Flows, "k").unwrap().is_none());
    }

    #[test]
    fn buckets_do_not_bleed() {
        let (_dir, store) = open_temp();
        let mut txn = store.begin();
        txn.put(Bucket::Flows, "shared-key", b"flow".to_vec());
        txn.put(Bucket::DhcpLeases, "shared-key", b"lease".to_vec());
        txn.commit().unwrap();

        assert_eq!(
            store.get(Bucket::Flows, "shared-key").unwrap().unwrap(),
            b"flow"
        );
        assert_eq!(
            store.get(Bucket::DhcpLeases, "shared-key").unwrap().unwrap(),
            b"lease"
        );
        assert_eq!(store.count(Bucket::Flows), 1);
    }

    #[test]
    fn prefix_iteration_strips_bucket() {
        let (_dir, store) = open_temp();
        let mut txn = store.begin();
        for mac in ["aa:00", "aa:01", "bb:00"] {
            txn.put(Bucket::DhcpLeases, mac, mac.as_bytes().to_vec());
        }
        txn.commit().unwrap();

        let keys: Vec<String> = store
            .iter_prefix(Bucket::DhcpLeases, "aa:")
            .map(|e| e.unwrap().0)
            .collect();
        assert_eq!(keys, vec!["aa:00".to_string(), "aa:01".to_string()]);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let store = Store::open(&path).unwrap();
            let mut txn = store.begin();
            txn.put(Bucket::HaState, "role", b"primary".to_vec());
            txn.commit().unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(
            store.get(Bucket::HaState, "role").unwrap().unwrap(),
            b"primary"
        );
    }

    #[test]
    fn delete_wins_over_earlier_put() {
        let (_dir, store) = open_temp();
        let mut txn = store.begin();
        txn.put(Bucket::Users, "admin", b"hash".to_vec());
        txn.commit().unwrap();

        let mut txn = store.begin();
        txn.put(Bucket::Users, "admin", b"newhash".to_vec());
        txn.delete(Bucket::Users, "admin");
        txn.commit().unwrap();
        assert!(store.get(Bucket::Users, "admin").unwrap().is_none());
    }
}
