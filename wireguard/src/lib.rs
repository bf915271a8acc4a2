// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! WireGuard orchestration over the kernel's own interface (netlink via
//! `wireguard-control`), never an external tool.
//!
//! Link addresses and up/down state belong to the link reconciler; this
//! crate owns device lifecycle, keys and the peer table, plus the lockout
//! guard that auto-reverts a change which would orphan the admin session.

pub mod backend;
pub mod lockout;
pub mod reconciler;

pub use backend::{FakeWg, KernelWg, PeerSnapshot, TunnelSnapshot, WgBackend};
pub use lockout::{GuardOutcome, LockoutGuard};
pub use reconciler::{DesiredTunnels, PeerSpec, TunnelSpec, WgOp, WgPlan, WgReconciler};

#[derive(Debug, thiserror::Error)]
pub enum WgError {
    #[error("wireguard device {0}: {1}")]
    Device(String, std::io::Error),
    #[error("bad key for {0}")]
    Key(String),
    #[error("task join: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl WgError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        "kernel"
    }
}
