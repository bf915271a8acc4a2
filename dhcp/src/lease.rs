// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

use net::MacAddr;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Per-MAC lease lifecycle: `none -> offered -> bound -> renewing ->
/// expired`. Offers live in memory only; everything from `Bound` on is
/// persisted.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    Offered,
    Bound,
    Renewing,
    Expired,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub hostname: Option<String>,
    /// Unix seconds.
    pub expires_at: u64,
    pub vendor_class: Option<String>,
    pub state: LeaseState,
}

/// Unix seconds now; a plain function so tests pass explicit instants
/// everywhere the logic matters.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Lease {
    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// When the reaper may delete the record (and with it, stickiness).
    #[must_use]
    pub fn reap_after(&self, grace: u64) -> u64 {
        self.expires_at.saturating_add(grace)
    }

    pub fn renew(&mut self, lease_time: u64, now: u64) {
        self.expires_at = now.saturating_add(lease_time);
        self.state = LeaseState::Bound;
    }
}

/// Reaper grace: half the lease time, capped so day-long leases do not
/// linger for hours past expiry.
#[must_use]
pub fn grace_for(lease_time: u64) -> u64 {
    (lease_time / 2).min(300)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(expires_at: u64) -> Lease {
        Lease {
            mac: "aa:bb:cc:dd:ee:01".parse().unwrap(),
            ip: Ipv4Addr::new(192, 168, 1, 100),
            hostname: Some("printer".into()),
            expires_at,
            vendor_class: None,
            state: LeaseState::Bound,
        }
    }

    #[test]
    fn expiry_and_reap_windows() {
        let l = lease(100);
        assert!(!l.is_expired(99));
        assert!(l.is_expired(100));
        // 5 s lease: gone within 8 s of silence.
        assert_eq!(grace_for(5), 2);
        assert!(lease(105).reap_after(grace_for(5)) <= 108);
        // Long leases cap at five minutes of grace.
        assert_eq!(grace_for(86_400), 300);
    }

    #[test]
    fn renew_extends_and_binds() {
        let mut l = lease(100);
        l.state = LeaseState::Renewing;
        l.renew(50, 90);
        assert_eq!(l.expires_at, 140);
        assert_eq!(l.state, LeaseState::Bound);
    }
}
