// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! High availability: heartbeat, virtual-IP ownership, and state sync.
//!
//! The role machine is deliberately pure (`RoleFsm`) so failover timing is
//! testable with injected ticks; the node loop wires it to UDP heartbeats
//! and a [`VipHandler`]. Split-brain is fail-open: both nodes may hold the
//! VIP while partitioned, and the higher priority wins (with preemption)
//! once heartbeats flow again.

pub mod fsm;
pub mod heartbeat;
pub mod sync;
pub mod vip;

pub use fsm::{Role, RoleFsm, Transition};
pub use heartbeat::{HaNode, HeartbeatMsg};
pub use sync::{SyncClient, SyncServer};
pub use vip::{FakeVip, NetlinkVip, VipHandler};

#[derive(Debug, thiserror::Error)]
pub enum HaError {
    #[error("socket: {0}")]
    Socket(#[from] std::io::Error),
    #[error("netlink: {0}")]
    Netlink(#[from] rtnetlink::Error),
    #[error("bad heartbeat authentication")]
    BadAuth,
    #[error("malformed heartbeat: {0}")]
    Malformed(#[from] Box<bincode::ErrorKind>),
    #[error(transparent)]
    Store(#[from] store::StoreError),
}

impl HaError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            HaError::BadAuth => "auth",
            HaError::Malformed(_) => "validation",
            HaError::Netlink(_) => "kernel",
            HaError::Socket(_) => "transient-io",
            HaError::Store(e) => e.kind(),
        }
    }
}
