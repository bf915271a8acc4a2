// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! The verdict engine: learning and enforcement modes, verdict cache,
//! fast-path handoff, batched persistence.

use crate::flow::{Flow, FlowFlags, StoredFlow};
use crate::pattern::{PatternAction, PatternSet};
use crate::sentinel::Sentinel;
use crate::table::{adapt_interval, FlowTable};
use crate::Verdict;
use firewall::eval::FilterVerdict;
use firewall::ruleset::Hook;
use firewall::MemoryBackend;
use net::{FlowKey, MacAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use store::{Bucket, Store};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Trust-on-first-use when true; classify first packets when false.
    pub learning_mode: bool,
    /// Packets inspected before a stable flow is offloaded.
    pub packet_window: u32,
    pub flow_timeout: Duration,
    pub cleanup_interval: Duration,
    pub capacity: usize,
    pub verdict_cache_entries: u64,
    pub verdict_cache_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            learning_mode: true,
            packet_window: 10,
            flow_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            capacity: 100_000,
            verdict_cache_entries: 10_000,
            verdict_cache_ttl: Duration::from_secs(300),
        }
    }
}

/// The kernel fast-path seam. Install is best-effort: a refusal leaves the
/// flow marked offloaded in userspace, which simply means no further
/// classification work.
pub trait FastPath: Send + Sync {
    fn install(&self, key: &FlowKey, verdict: Verdict) -> bool;
    fn remove(&self, key: &FlowKey);
}

/// No kernel module present.
pub struct NullFastPath;

impl FastPath for NullFastPath {
    fn install(&self, _key: &FlowKey, _verdict: Verdict) -> bool {
        false
    }
    fn remove(&self, _key: &FlowKey) {}
}

/// In-memory fast-path used by tests and the dev loop.
#[derive(Default)]
pub struct MemoryFastPath {
    entries: dashmap::DashMap<FlowKey, Verdict>,
}

impl MemoryFastPath {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains(&self, key: &FlowKey) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FastPath for MemoryFastPath {
    fn install(&self, key: &FlowKey, verdict: Verdict) -> bool {
        self.entries.insert(*key, verdict);
        true
    }
    fn remove(&self, key: &FlowKey) {
        self.entries.remove(key);
    }
}

/// Counter/byte updates coming back from the kernel fast-path ring.
#[derive(Copy, Clone, Debug)]
pub struct FastPathEvent {
    pub key: FlowKey,
    pub packets: u64,
    pub bytes: u64,
}

/// One queued classification request from an async datapath shim.
pub struct VerdictRequest {
    pub pkt: firewall::eval::PacketView,
    pub bytes: u64,
    pub payload: Option<Vec<u8>>,
    pub src_mac: Option<MacAddr>,
    respond: tokio::sync::oneshot::Sender<Verdict>,
}

const EVENT_RING: usize = 1_000;
const PERSIST_QUEUE: usize = 1_000;
const VERDICT_QUEUE: usize = 1_000;

#[derive(Debug, Default)]
pub struct EngineCounters {
    pub dropped_events: AtomicU64,
    pub failed_persists: AtomicU64,
    pub slow_path_lookups: AtomicU64,
    pub fail_open: AtomicU64,
}

pub struct FlowEngine {
    config: EngineConfig,
    table: FlowTable,
    verdict_cache: moka::sync::Cache<u64, Verdict>,
    classifier: Arc<MemoryBackend>,
    patterns: PatternSet,
    sentinel: Arc<Sentinel>,
    fastpath: Arc<dyn FastPath>,
    store: Option<Arc<Store>>,
    persist_tx: parking_lot::Mutex<Option<mpsc::Sender<StoredFlow>>>,
    event_tx: parking_lot::Mutex<Option<mpsc::Sender<FastPathEvent>>>,
    verdict_tx: parking_lot::Mutex<Option<mpsc::Sender<VerdictRequest>>>,
    pub counters: EngineCounters,
}

enum HitOutcome {
    Verdict(Verdict),
    Promote(StoredFlow),
}

impl FlowEngine {
    #[must_use]
    pub fn new(
        config: EngineConfig,
        classifier: Arc<MemoryBackend>,
        patterns: PatternSet,
        fastpath: Arc<dyn FastPath>,
        store: Option<Arc<Store>>,
    ) -> Arc<FlowEngine> {
        Arc::new(FlowEngine {
            table: FlowTable::new(config.capacity, config.flow_timeout),
            verdict_cache: moka::sync::Cache::builder()
                .max_capacity(config.verdict_cache_entries)
                .time_to_live(config.verdict_cache_ttl)
                .build(),
            classifier,
            patterns,
            sentinel: Arc::new(Sentinel::default()),
            fastpath,
            store,
            persist_tx: parking_lot::Mutex::new(None),
            event_tx: parking_lot::Mutex::new(None),
            verdict_tx: parking_lot::Mutex::new(None),
            counters: EngineCounters::default(),
            config,
        })
    }

    #[must_use]
    pub fn sentinel(&self) -> Arc<Sentinel> {
        Arc::clone(&self.sentinel)
    }

    #[must_use]
    pub fn flow_count(&self) -> usize {
        self.table.len()
    }

    #[must_use]
    pub fn flows(&self) -> Vec<StoredFlow> {
        let now = unix_now();
        self.table
            .snapshot()
            .into_iter()
            .map(|flow| StoredFlow::from_flow(&flow, now))
            .collect()
    }

    /// Drop all in-memory state (table and verdict cache). Persisted flows
    /// survive; used on revision changes and by tests.
    pub fn clear_caches(&self) {
        for flow in self.table.reap(Instant::now() + self.config.flow_timeout * 2) {
            self.fastpath.remove(&flow.key);
        }
        self.verdict_cache.invalidate_all();
    }

    /// The per-packet entry point. Synchronous and bounded: one shard lock,
    /// one optional store read on a cold miss, one optional signature scan.
    pub fn process_packet(
        &self,
        pkt: &firewall::eval::PacketView,
        bytes: u64,
        payload: Option<&[u8]>,
        src_mac: Option<MacAddr>,
    ) -> Verdict {
        let now = Instant::now();
        if let Some(mac) = src_mac {
            self.sentinel.observe(mac, bytes, unix_now());
        }

        let learning = self.config.learning_mode;
        let window = u64::from(self.config.packet_window);
        let hit = self.table.with_flow(&pkt.key, |flow| {
            flow.touch(bytes, now);
            if flow.flags.contains(FlowFlags::BLOCKED) {
                return HitOutcome::Verdict(Verdict::Drop);
            }
            // Monitored flows stay on the userspace path, never offloaded.
            if flow.flags.contains(FlowFlags::MONITORED) {
                return HitOutcome::Verdict(Verdict::Inspect);
            }
            if flow.flags.contains(FlowFlags::OFFLOADED) {
                return HitOutcome::Verdict(Verdict::Offload);
            }
            // The first `packet_window` packets stay pending; the one after
            // them promotes.
            if learning && flow.packets > window {
                flow.flags |= FlowFlags::OFFLOADED;
                flow.verdict = Verdict::Offload;
                return HitOutcome::Promote(StoredFlow::from_flow(flow, unix_now()));
            }
            HitOutcome::Verdict(flow.verdict)
        });

        match hit {
            Some(HitOutcome::Verdict(verdict)) => verdict,
            Some(HitOutcome::Promote(stored)) => {
                if !self.fastpath.install(&stored.key, Verdict::Offload) {
                    debug!(key = %stored.key, "fast-path refused entry, staying in userspace");
                }
                self.persist(stored);
                Verdict::Offload
            }
            None => self.new_flow(pkt, bytes, payload, now),
        }
    }

    fn new_flow(
        &self,
        pkt: &firewall::eval::PacketView,
        bytes: u64,
        payload: Option<&[u8]>,
        now: Instant,
    ) -> Verdict {
        let key = pkt.key;
        if self.config.learning_mode {
            let mut flow = Flow::new(key, Verdict::Allow, now);
            flow.touch(bytes, now);
            self.table.insert(flow);
            return Verdict::Allow;
        }

        let digest = key.digest();
        // Near-duplicate flows short-circuit through the verdict cache.
        if let Some(verdict) = self.verdict_cache.get(&digest) {
            self.remember(key, verdict, bytes, now, false);
            return verdict;
        }

        // Denied flows persist, so repeated attempts cost one store read at
        // most; this is the only slow-path consult.
        if let Some(stored) = self.persisted_lookup(digest) {
            self.counters.slow_path_lookups.fetch_add(1, Ordering::Relaxed);
            self.verdict_cache.insert(digest, stored.verdict);
            self.remember(key, stored.verdict, bytes, now, false);
            return stored.verdict;
        }

        // Inline classification against the compiled ruleset view.
        let mut verdict = match self.classifier.evaluate(Hook::Forward, pkt) {
            FilterVerdict::Accept => Verdict::Allow,
            FilterVerdict::Drop | FilterVerdict::Reject => Verdict::Drop,
        };
        let mut monitored = false;
        if let Some(payload) = payload {
            if !self.patterns.is_empty() {
                match self.patterns.scan(payload) {
                    Some((name, PatternAction::Drop)) => {
                        debug!(signature = name, key = %key, "signature drop");
                        verdict = Verdict::Drop;
                    }
                    Some((name, PatternAction::Monitor)) => {
                        debug!(signature = name, key = %key, "signature monitor");
                        monitored = true;
                    }
                    None => {}
                }
            }
        }

        self.verdict_cache.insert(digest, verdict);
        self.remember(key, verdict, bytes, now, monitored);
        verdict
    }

    fn remember(&self, key: FlowKey, verdict: Verdict, bytes: u64, now: Instant, monitored: bool) {
        let mut flow = Flow::new(key, verdict, now);
        flow.touch(bytes, now);
        if monitored {
            flow.flags |= FlowFlags::MONITORED;
        }
        if verdict == Verdict::Drop {
            flow.flags |= FlowFlags::BLOCKED;
            self.persist(StoredFlow::from_flow(&flow, unix_now()));
        }
        self.table.insert(flow);
    }

    fn persisted_lookup(&self, digest: u64) -> Option<StoredFlow> {
        let store = self.store.as_ref()?;
        store
            .get_json::<StoredFlow>(Bucket::Flows, &format!("{digest:016x}"))
            .ok()
            .flatten()
    }

    /// Queue a flow for durable write. The queue is bounded; overflow fails
    /// open (the flow stays in memory, a counter ticks).
    fn persist(&self, stored: StoredFlow) {
        let guard = self.persist_tx.lock();
        match guard.as_ref() {
            Some(tx) => {
                if tx.try_send(stored).is_err() {
                    self.counters.failed_persists.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => {
                // No writer task (tests, early startup): write through.
                if let Some(store) = &self.store {
                    let mut txn = store.begin();
                    let key = stored.digest_key();
                    if txn.put_json(Bucket::Flows, &key, &stored).is_ok() {
                        if txn.commit().is_err() {
                            self.counters.failed_persists.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
        }
    }

    /// Spawn the batched persistence writer.
    pub fn start_persistence(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let (tx, mut rx) = mpsc::channel::<StoredFlow>(PERSIST_QUEUE);
        *self.persist_tx.lock() = Some(tx);
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut pending: Vec<StoredFlow> = Vec::new();
            let mut flush = tokio::time::interval(Duration::from_millis(500));
            loop {
                tokio::select! {
                    received = rx.recv() => {
                        match received {
                            Some(stored) => pending.push(stored),
                            None => return,
                        }
                    }
                    _ = flush.tick() => {
                        if pending.is_empty() {
                            continue;
                        }
                        let mut txn = store.begin();
                        let mut ok = true;
                        for stored in pending.drain(..) {
                            let key = stored.digest_key();
                            if txn.put_json(Bucket::Flows, &key, &stored).is_err() {
                                ok = false;
                            }
                        }
                        if !ok || txn.commit().is_err() {
                            engine.counters.failed_persists.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Sender for kernel fast-path counter events; the drain task keeps the
    /// table's counters converging without ever blocking the kernel side.
    pub fn start_event_drain(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let (tx, mut rx) = mpsc::channel::<FastPathEvent>(EVENT_RING);
        *self.event_tx.lock() = Some(tx);
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => {
                        let Some(event) = event else { return };
                        let now = Instant::now();
                        engine.table.with_flow(&event.key, |flow| {
                            flow.packets = flow.packets.saturating_add(event.packets);
                            flow.bytes = flow.bytes.saturating_add(event.bytes);
                            flow.last_seen = now;
                        });
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Non-blocking submission from the kernel shim; overflow counts, never
    /// blocks.
    pub fn submit_event(&self, event: FastPathEvent) {
        let guard = self.event_tx.lock();
        match guard.as_ref() {
            Some(tx) if tx.try_send(event).is_ok() => {}
            _ => {
                self.counters.dropped_events.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// The worker draining the bounded verdict channel. Async datapaths
    /// queue through [`request_verdict`](FlowEngine::request_verdict)
    /// instead of calling the synchronous path on their own task.
    pub fn start_verdict_worker(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let (tx, mut rx) = mpsc::channel::<VerdictRequest>(VERDICT_QUEUE);
        *self.verdict_tx.lock() = Some(tx);
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    request = rx.recv() => {
                        let Some(request) = request else { return };
                        let verdict = engine.process_packet(
                            &request.pkt,
                            request.bytes,
                            request.payload.as_deref(),
                            request.src_mac,
                        );
                        let _ = request.respond.send(verdict);
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Queue a packet for classification. A full queue (or an absent
    /// worker) fails open: the packet is allowed, the counter ticks, and
    /// the overflow is logged.
    pub async fn request_verdict(
        &self,
        pkt: firewall::eval::PacketView,
        bytes: u64,
        payload: Option<Vec<u8>>,
        src_mac: Option<MacAddr>,
    ) -> Verdict {
        let (respond, response) = tokio::sync::oneshot::channel();
        let queued = {
            let guard = self.verdict_tx.lock();
            match guard.as_ref() {
                Some(tx) => tx
                    .try_send(VerdictRequest {
                        pkt,
                        bytes,
                        payload,
                        src_mac,
                        respond,
                    })
                    .is_ok(),
                None => false,
            }
        };
        if !queued {
            self.counters.fail_open.fetch_add(1, Ordering::Relaxed);
            warn!("verdict queue full, failing open");
            return Verdict::Allow;
        }
        match response.await {
            Ok(verdict) => verdict,
            Err(_) => {
                // Worker went away mid-request (shutdown): fail open.
                self.counters.fail_open.fetch_add(1, Ordering::Relaxed);
                Verdict::Allow
            }
        }
    }

    /// One reaper pass; returns the new interval per the adaptive policy.
    pub fn reap(&self, current_interval: Duration) -> Duration {
        let removed = self.table.reap(Instant::now());
        if !removed.is_empty() {
            if let Some(store) = &self.store {
                let mut txn = store.begin();
                for flow in &removed {
                    self.fastpath.remove(&flow.key);
                    txn.delete(Bucket::Flows, &format!("{:016x}", flow.key.digest()));
                }
                if txn.commit().is_err() {
                    warn!("flow reap commit failed");
                }
            } else {
                for flow in &removed {
                    self.fastpath.remove(&flow.key);
                }
            }
        }
        adapt_interval(current_interval, self.table.utilization())
    }

    /// The reaper loop.
    pub fn start_reaper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = engine.config.cleanup_interval;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        interval = engine.reap(interval);
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests;
