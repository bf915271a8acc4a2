// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! Caching DNS forwarder with local authoritative zones.
//!
//! Query path: local zones and DHCP-learned hosts, then blocklists
//! (allowlist wins), then cache, then the upstream ladder. Upstreams can be
//! plain UDP/TCP, DoT or DoH; unhealthy ones are skipped until a cooldown
//! passes.

pub mod blocklist;
pub mod cache;
pub mod local;
pub mod resolver;
pub mod upstream;

pub use blocklist::BlockSet;
pub use cache::DnsCache;
pub use local::LocalZones;
pub use resolver::{Resolver, ResolverHandle};
pub use upstream::{Upstream, UpstreamPool};

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    #[error("codec: {0}")]
    Codec(#[from] hickory_proto::error::ProtoError),
    #[error("socket: {0}")]
    Socket(#[from] std::io::Error),
    #[error("all upstreams failed")]
    NoUpstream,
    #[error("upstream timeout")]
    Timeout,
}

impl DnsError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            DnsError::Codec(_) => "validation",
            _ => "transient-io",
        }
    }
}

/// Aggregate counters surfaced on `/api/dns/stats`.
#[derive(Debug, Default)]
pub struct DnsStats {
    pub queries: AtomicU64,
    pub cache_hits: AtomicU64,
    pub blocked: AtomicU64,
    pub local_answers: AtomicU64,
    pub upstream_errors: AtomicU64,
}

impl DnsStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> DnsStatsSnapshot {
        DnsStatsSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            local_answers: self.local_answers.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct DnsStatsSnapshot {
    pub queries: u64,
    pub cache_hits: u64,
    pub blocked: u64,
    pub local_answers: u64,
    pub upstream_errors: u64,
}
