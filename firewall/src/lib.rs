// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! The firewall compiler.
//!
//! Projects a validated model into a [`Ruleset`] confined to the `flywall`
//! table namespace, renders it as one atomic nft transaction, and applies it
//! through a [`RulesetBackend`]. The in-memory backend doubles as the flow
//! engine's inline classifier view, so userspace verdicts and the kernel
//! table never disagree about policy.

pub mod backend;
pub mod compile;
pub mod eval;
pub mod fetcher;
pub mod render;
pub mod ruleset;

pub use backend::{BackendError, MemoryBackend, NftBackend, RulesetBackend};
pub use compile::compile;
pub use ruleset::*;

/// The kernel table namespace owned by flywall. Rules from other tools live
/// in their own tables and are never touched.
pub const TABLE_NAME: &str = "flywall";

/// The compiler-owned dynamic set fed by the fail2ban signal.
pub const BLOCKED_SET: &str = "blocked_ips";
