// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! The privileged supervisor.
//!
//! Owns the process lifecycle: loads and stages configuration revisions,
//! orchestrates the transactional apply across reconcilers, serves the
//! framed RPC on the control socket, and reacts to SIGHUP/SIGTERM. All
//! other processes (API included) reach kernel and store state only through
//! the RPC surface defined here.

pub mod apply;
pub mod revision;
pub mod rpc;
pub mod server;
pub mod supervisor;

pub use revision::{ConfigDb, ConfigRevision, RevisionStatus};
pub use rpc::{RpcClient, RpcError, RpcRequest, RpcResponse};
pub use supervisor::{Event, Supervisor, SupervisorOptions};

#[derive(Debug, thiserror::Error)]
pub enum MgmtError {
    #[error("validation failed: {0}")]
    Validation(#[from] config::ValidationErrors),
    #[error("config front-end: {0}")]
    Frontend(#[from] config::frontend::FrontendError),
    #[error("no staged configuration")]
    NothingStaged,
    #[error("apply already in progress")]
    Busy,
    #[error(transparent)]
    Store(#[from] store::StoreError),
    #[error("firewall: {0}")]
    Firewall(#[from] firewall::BackendError),
    #[error("compile: {0}")]
    Compile(#[from] firewall::compile::CompileError),
    #[error("links: {0}")]
    Links(#[from] interface_manager::LinkError),
    #[error("wireguard: {0}")]
    Wireguard(#[from] wireguard::WgError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("digest mismatch for staged binary")]
    DigestMismatch,
    #[error("permission denied")]
    Denied,
}

impl MgmtError {
    /// Stable kind strings surfaced through RPC and API.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            MgmtError::Validation(_) | MgmtError::Frontend(_) | MgmtError::NothingStaged => {
                "validation"
            }
            MgmtError::Busy => "conflict",
            MgmtError::Store(e) => e.kind(),
            MgmtError::Firewall(_) | MgmtError::Compile(_) => "kernel",
            MgmtError::Links(_) | MgmtError::Wireguard(_) => "kernel",
            MgmtError::Io(_) => "transient-io",
            MgmtError::DigestMismatch => "validation",
            MgmtError::Denied => "auth",
        }
    }

    /// Path context for validation errors, when present.
    #[must_use]
    pub fn path(&self) -> Option<String> {
        match self {
            MgmtError::Validation(errors) => errors.0.first().map(|e| e.path.clone()),
            _ => None,
        }
    }
}
