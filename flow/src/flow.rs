// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

use crate::Verdict;
use net::FlowKey;
use serde::{Deserialize, Serialize};
use std::time::Instant;

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
    pub struct FlowFlags: u8 {
        const OFFLOADED = 0b0000_0001;
        const MONITORED = 0b0000_0010;
        const BLOCKED   = 0b0000_0100;
    }
}

/// In-memory flow record. Monotonic instants here; the persisted form
/// carries wall-clock seconds instead.
#[derive(Clone, Debug)]
pub struct Flow {
    pub key: FlowKey,
    pub verdict: Verdict,
    pub packets: u64,
    pub bytes: u64,
    pub created_at: Instant,
    pub last_seen: Instant,
    pub flags: FlowFlags,
}

impl Flow {
    #[must_use]
    pub fn new(key: FlowKey, verdict: Verdict, now: Instant) -> Flow {
        Flow {
            key,
            verdict,
            packets: 0,
            bytes: 0,
            created_at: now,
            last_seen: now,
            flags: FlowFlags::empty(),
        }
    }

    pub fn touch(&mut self, bytes: u64, now: Instant) {
        self.packets += 1;
        self.bytes = self.bytes.saturating_add(bytes);
        self.last_seen = now;
    }

    #[must_use]
    pub fn expired(&self, now: Instant, timeout: std::time::Duration) -> bool {
        now.saturating_duration_since(self.last_seen) >= timeout
    }
}

/// The durable shape in the `flows` bucket, keyed by the flow digest.
/// Only learned and denied flows persist.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StoredFlow {
    pub key: FlowKey,
    pub verdict: Verdict,
    pub packets: u64,
    pub bytes: u64,
    pub flags: FlowFlags,
    /// Unix seconds of the last update.
    pub updated_at: u64,
}

impl StoredFlow {
    #[must_use]
    pub fn from_flow(flow: &Flow, updated_at: u64) -> StoredFlow {
        StoredFlow {
            key: flow.key,
            verdict: flow.verdict,
            packets: flow.packets,
            bytes: flow.bytes,
            flags: flow.flags,
            updated_at,
        }
    }

    #[must_use]
    pub fn digest_key(&self) -> String {
        format!("{:016x}", self.key.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use net::Protocol;
    use std::time::Duration;

    fn key() -> FlowKey {
        FlowKey::new(
            "192.168.1.100".parse().unwrap(),
            "8.8.8.8".parse().unwrap(),
            34567,
            443,
            Protocol::Tcp,
        )
    }

    #[test]
    fn counters_are_monotonic() {
        let t0 = Instant::now();
        let mut flow = Flow::new(key(), Verdict::Allow, t0);
        for i in 1..=5 {
            flow.touch(100, t0 + Duration::from_secs(i));
            assert_eq!(flow.packets, i);
        }
        assert_eq!(flow.bytes, 500);
    }

    #[test]
    fn expiry_is_inactivity_based() {
        let t0 = Instant::now();
        let mut flow = Flow::new(key(), Verdict::Allow, t0);
        let timeout = Duration::from_secs(300);
        flow.touch(1, t0 + Duration::from_secs(200));
        assert!(!flow.expired(t0 + Duration::from_secs(400), timeout));
        assert!(flow.expired(t0 + Duration::from_secs(501), timeout));
    }

    #[test]
    fn stored_form_round_trips() {
        let flow = Flow::new(key(), Verdict::Drop, Instant::now());
        let stored = StoredFlow::from_flow(&flow, 1_000);
        let json = serde_json::to_string(&stored).unwrap();
        let back: StoredFlow = serde_json::from_str(&json).unwrap();
        assert_eq!(stored, back);
        assert_eq!(stored.digest_key().len(), 16);
    }
}
