// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! Replication of durable state (leases and flows) to the peer.
//!
//! The primary streams incremental batches over an authenticated TCP
//! connection; the replica applies them transactionally. Batching is
//! change-driven with a short debounce, so a DHCP storm coalesces instead
//! of producing one frame per lease.

use crate::HaError;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use store::{Bucket, Store};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

const TAG_LEN: usize = 32;
const HELLO: &[u8] = b"flywall-sync-1";
const DEBOUNCE: Duration = Duration::from_millis(100);
const SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Buckets that replicate. Config revisions travel via staged apply, not
/// here.
const SYNC_BUCKETS: [Bucket; 2] = [Bucket::DhcpLeases, Bucket::Flows];

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SyncEntry {
    bucket: String,
    key: String,
    /// `None` replicates a deletion.
    value: Option<Vec<u8>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct SyncBatch {
    entries: Vec<SyncEntry>,
}

fn bucket_by_name(name: &str) -> Option<Bucket> {
    SYNC_BUCKETS.iter().copied().find(|b| b.name() == name)
}

fn frame(batch: &SyncBatch, secret: &[u8]) -> Result<Vec<u8>, HaError> {
    let body = bincode::serialize(batch)?;
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| HaError::BadAuth)?;
    mac.update(&body);
    let tag = mac.finalize().into_bytes();

    let mut out = Vec::with_capacity(4 + body.len() + TAG_LEN);
    out.extend_from_slice(&u32::try_from(body.len() + TAG_LEN).unwrap_or(0).to_be_bytes());
    out.extend_from_slice(&body);
    out.extend_from_slice(&tag);
    Ok(out)
}

fn unframe(raw: &[u8], secret: &[u8]) -> Result<SyncBatch, HaError> {
    if raw.len() <= TAG_LEN {
        return Err(HaError::BadAuth);
    }
    let (body, tag) = raw.split_at(raw.len() - TAG_LEN);
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| HaError::BadAuth)?;
    mac.update(body);
    mac.verify_slice(tag).map_err(|_| HaError::BadAuth)?;
    Ok(bincode::deserialize(body)?)
}

/// The replica side: accept one authenticated peer and apply batches.
pub struct SyncServer {
    store: Arc<Store>,
    secret: Vec<u8>,
    listen: std::net::SocketAddr,
}

impl SyncServer {
    #[must_use]
    pub fn new(store: Arc<Store>, secret: &str, listen: std::net::SocketAddr) -> SyncServer {
        SyncServer {
            store,
            secret: secret.as_bytes().to_vec(),
            listen,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), HaError> {
        let listener = TcpListener::bind(self.listen).await?;
        info!(listen = %self.listen, "sync listener up");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let Ok((stream, peer)) = accepted else { continue };
                    debug!(%peer, "sync peer connected");
                    if let Err(error) = self.serve_peer(stream).await {
                        warn!(%peer, %error, "sync connection ended");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn serve_peer(&self, mut stream: TcpStream) -> Result<(), HaError> {
        // Challengeless hello: the peer proves the secret by MACing a fixed
        // string; replayability is acceptable on the dedicated HA link.
        let mut hello = vec![0u8; HELLO.len() + TAG_LEN];
        stream.read_exact(&mut hello).await?;
        let (body, tag) = hello.split_at(HELLO.len());
        if body != HELLO {
            return Err(HaError::BadAuth);
        }
        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|_| HaError::BadAuth)?;
        mac.update(body);
        mac.verify_slice(tag).map_err(|_| HaError::BadAuth)?;

        loop {
            let mut len_buf = [0u8; 4];
            stream.read_exact(&mut len_buf).await?;
            let len = u32::from_be_bytes(len_buf) as usize;
            if len > 64 * 1024 * 1024 {
                return Err(HaError::BadAuth);
            }
            let mut raw = vec![0u8; len];
            stream.read_exact(&mut raw).await?;
            let batch = unframe(&raw, &self.secret)?;
            self.apply(&batch)?;
        }
    }

    fn apply(&self, batch: &SyncBatch) -> Result<(), HaError> {
        let mut txn = self.store.begin();
        for entry in &batch.entries {
            let Some(bucket) = bucket_by_name(&entry.bucket) else {
                continue;
            };
            match &entry.value {
                Some(value) => txn.put(bucket, &entry.key, value.clone()),
                None => txn.delete(bucket, &entry.key),
            }
        }
        txn.commit()?;
        debug!(entries = batch.entries.len(), "sync batch applied");
        Ok(())
    }
}

/// The primary side: scan for changes, debounce, ship.
pub struct SyncClient {
    store: Arc<Store>,
    secret: Vec<u8>,
    peer: std::net::SocketAddr,
    /// Last shipped value hash per full key, to ship deltas only.
    shipped: HashMap<(Bucket, String), u64>,
}

fn value_hash(value: &[u8]) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

impl SyncClient {
    #[must_use]
    pub fn new(store: Arc<Store>, secret: &str, peer: std::net::SocketAddr) -> SyncClient {
        SyncClient {
            store,
            secret: secret.as_bytes().to_vec(),
            peer,
            shipped: HashMap::new(),
        }
    }

    /// Compute the delta since the last shipment.
    fn collect(&mut self) -> Result<SyncBatch, HaError> {
        let mut batch = SyncBatch::default();
        let mut seen: HashMap<(Bucket, String), ()> = HashMap::new();
        for bucket in SYNC_BUCKETS {
            for entry in self.store.iter_prefix(bucket, "") {
                let (key, value) = entry?;
                let hash = value_hash(&value);
                seen.insert((bucket, key.clone()), ());
                if self.shipped.get(&(bucket, key.clone())) != Some(&hash) {
                    self.shipped.insert((bucket, key.clone()), hash);
                    batch.entries.push(SyncEntry {
                        bucket: bucket.name().to_string(),
                        key,
                        value: Some(value),
                    });
                }
            }
        }
        // Deletions: shipped before, gone now.
        let doomed: Vec<(Bucket, String)> = self
            .shipped
            .keys()
            .filter(|key| !seen.contains_key(*key))
            .cloned()
            .collect();
        for (bucket, key) in doomed {
            self.shipped.remove(&(bucket, key.clone()));
            batch.entries.push(SyncEntry {
                bucket: bucket.name().to_string(),
                key,
                value: None,
            });
        }
        Ok(batch)
    }

    async fn connect(&self) -> Result<TcpStream, HaError> {
        let mut stream = TcpStream::connect(self.peer).await?;
        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|_| HaError::BadAuth)?;
        mac.update(HELLO);
        let mut hello = HELLO.to_vec();
        hello.extend_from_slice(&mac.finalize().into_bytes());
        stream.write_all(&hello).await?;
        Ok(stream)
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut stream: Option<TcpStream> = None;
        let mut scan = tokio::time::interval(SCAN_INTERVAL);
        loop {
            tokio::select! {
                _ = scan.tick() => {
                    let batch = match self.collect() {
                        Ok(batch) if batch.entries.is_empty() => continue,
                        Ok(batch) => batch,
                        Err(error) => {
                            warn!(%error, "sync collection failed");
                            continue;
                        }
                    };
                    // Debounce: a burst of changes within the window rides
                    // in one frame on the next pass.
                    tokio::time::sleep(DEBOUNCE).await;

                    if stream.is_none() {
                        match self.connect().await {
                            Ok(connected) => stream = Some(connected),
                            Err(error) => {
                                debug!(%error, "sync peer unreachable");
                                // Re-ship everything once it returns.
                                self.shipped.clear();
                                continue;
                            }
                        }
                    }
                    if let Some(connected) = stream.as_mut() {
                        match frame(&batch, &self.secret) {
                            Ok(raw) => {
                                if let Err(error) = connected.write_all(&raw).await {
                                    warn!(%error, "sync send failed, reconnecting");
                                    stream = None;
                                    self.shipped.clear();
                                }
                            }
                            Err(error) => warn!(%error, "sync frame failed"),
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn temp_store() -> (tempfile::TempDir, Arc<Store>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("state.db")).unwrap());
        (dir, store)
    }

    #[test]
    fn frame_round_trip_rejects_tamper() {
        let batch = SyncBatch {
            entries: vec![SyncEntry {
                bucket: "dhcp_leases".to_string(),
                key: "aa:bb".to_string(),
                value: Some(b"lease".to_vec()),
            }],
        };
        let raw = frame(&batch, b"secret").unwrap();
        let decoded = unframe(&raw[4..], b"secret").unwrap();
        assert_eq!(decoded.entries.len(), 1);
        assert!(unframe(&raw[4..], b"wrong").is_err());
    }

    #[test]
    fn collect_ships_deltas_then_deletions() {
        let (_dir, store) = temp_store();
        let mut client = SyncClient::new(Arc::clone(&store), "s", "127.0.0.1:9".parse().unwrap());

        let mut txn = store.begin();
        txn.put(Bucket::DhcpLeases, "aa:bb", b"lease-1".to_vec());
        txn.put(Bucket::Flows, "f1", b"flow-1".to_vec());
        txn.commit().unwrap();

        let batch = client.collect().unwrap();
        assert_eq!(batch.entries.len(), 2);
        // Unchanged state ships nothing.
        assert!(client.collect().unwrap().entries.is_empty());

        // An update and a delete each ship once.
        let mut txn = store.begin();
        txn.put(Bucket::DhcpLeases, "aa:bb", b"lease-2".to_vec());
        txn.delete(Bucket::Flows, "f1");
        txn.commit().unwrap();
        let batch = client.collect().unwrap();
        assert_eq!(batch.entries.len(), 2);
        let deletion = batch.entries.iter().find(|e| e.key == "f1").unwrap();
        assert!(deletion.value.is_none());
    }

    #[tokio::test]
    async fn end_to_end_batch_application() {
        let (_dir_a, primary) = temp_store();
        let (_dir_b, replica) = temp_store();

        let server = SyncServer::new(Arc::clone(&replica), "s", "127.0.0.1:0".parse().unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = server.serve_peer(stream).await;
        });

        let mut txn = primary.begin();
        txn.put(Bucket::DhcpLeases, "aa:bb", b"lease".to_vec());
        txn.commit().unwrap();

        let mut client = SyncClient::new(Arc::clone(&primary), "s", addr);
        let batch = client.collect().unwrap();
        let mut stream = client.connect().await.unwrap();
        stream
            .write_all(&frame(&batch, b"s").unwrap())
            .await
            .unwrap();
        stream.flush().await.unwrap();

        // Give the server task a moment to apply.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            replica.get(Bucket::DhcpLeases, "aa:bb").unwrap().unwrap(),
            b"lease"
        );
    }
}
