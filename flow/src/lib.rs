// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! The per-packet decision engine.
//!
//! First packets of a flow are classified in userspace (bounded,
//! synchronous); stable flows are promoted to the kernel fast-path and never
//! come back here. Learning mode trusts the first `packet_window` packets;
//! enforcement mode consults the compiled ruleset view, the signature set
//! and the persisted denied-flow table.

pub mod engine;
pub mod flow;
pub mod pattern;
pub mod sentinel;
pub mod table;

pub use engine::{
    EngineConfig, FastPath, FastPathEvent, FlowEngine, MemoryFastPath, NullFastPath,
    VerdictRequest,
};
pub use flow::{Flow, FlowFlags, StoredFlow};
pub use pattern::{PatternAction, PatternSet, Signature};
pub use sentinel::Sentinel;
pub use table::FlowTable;

use serde::{Deserialize, Serialize};

/// What the engine tells the datapath to do with a packet.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allow,
    Drop,
    /// Keep steering this flow through userspace.
    Inspect,
    /// Fast-path entry installed; the kernel owns it now.
    Offload,
}

#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error(transparent)]
    Store(#[from] store::StoreError),
}
