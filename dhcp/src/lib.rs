// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! RFC 2131 DHCPv4 service.
//!
//! One scope per interface, reservations first, sticky re-offers, vendor
//! class option injection, and a reaper that retires stale leases. All
//! durable state lives in the `dhcp_leases` bucket; the resolver is told of
//! every bind and release so local names stay fresh.

pub mod lease;
pub mod scope;
pub mod server;

pub use lease::{Lease, LeaseState};
pub use scope::Scope;
pub use server::{DhcpServer, HostEvent};

#[derive(Debug, thiserror::Error)]
pub enum DhcpError {
    #[error("codec: {0}")]
    Codec(String),
    #[error("socket: {0}")]
    Socket(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] store::StoreError),
}

impl DhcpError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            DhcpError::Codec(_) => "validation",
            DhcpError::Socket(_) => "transient-io",
            DhcpError::Store(e) => e.kind(),
        }
    }
}
