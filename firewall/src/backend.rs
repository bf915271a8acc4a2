// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! The kernel seam.
//!
//! `NftBackend` drives the system's nft in one transaction per apply;
//! `MemoryBackend` holds the applied ruleset in process for tests and for
//! the flow engine's inline classifier. Both present the same surface, so
//! the supervisor and the scheduler never care which one they hold.

use crate::eval::{DynamicState, FilterVerdict, PacketView};
use crate::render;
use crate::ruleset::{Hook, Ruleset};
use crate::TABLE_NAME;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use ipnet::IpNet;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("nft transaction rejected: {0}")]
    Rejected(String),
    #[error("kernel apply failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown set {0}")]
    UnknownSet(String),
}

impl BackendError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        "kernel"
    }
}

/// Operations the compiler, scheduler and supervisor need from the kernel
/// packet filter. Only this crate writes the `flywall` table.
#[async_trait]
pub trait RulesetBackend: Send + Sync {
    /// Apply the full desired ruleset in one atomic transaction. On failure
    /// the previously applied ruleset remains in force verbatim.
    async fn apply(&self, ruleset: &Ruleset) -> Result<(), BackendError>;

    /// Render the currently applied ruleset (the `list` view).
    async fn list(&self) -> Result<String, BackendError>;

    /// Add one address to a dynamic set, with the set's element timeout.
    async fn add_set_member(&self, set: &str, addr: IpAddr) -> Result<(), BackendError>;

    async fn remove_set_member(&self, set: &str, addr: IpAddr) -> Result<(), BackendError>;

    /// Replace a dynamic set's membership wholesale (ipset refresh).
    async fn replace_set(&self, set: &str, members: &[IpNet]) -> Result<(), BackendError>;

    /// Reconcile schedule gates against the active window set.
    async fn update_schedules(&self, active: &BTreeSet<String>) -> Result<(), BackendError>;
}

/// Production backend: one `nft -f -` process per transaction.
pub struct NftBackend {
    nft_path: String,
    /// Last ruleset the kernel accepted; gate updates re-render from it.
    applied: ArcSwap<Ruleset>,
    active: RwLock<BTreeSet<String>>,
}

impl NftBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::with_program("nft")
    }

    #[must_use]
    pub fn with_program(nft_path: &str) -> Self {
        NftBackend {
            nft_path: nft_path.to_string(),
            applied: ArcSwap::from_pointee(Ruleset::default()),
            active: RwLock::new(BTreeSet::new()),
        }
    }

    async fn run(&self, script: &str) -> Result<(), BackendError> {
        let mut child = tokio::process::Command::new(&self.nft_path)
            .arg("-f")
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(stdin) = child.stdin.as_mut() {
            stdin.write_all(script.as_bytes()).await?;
        }
        drop(child.stdin.take());
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(BackendError::Rejected(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for NftBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RulesetBackend for NftBackend {
    async fn apply(&self, ruleset: &Ruleset) -> Result<(), BackendError> {
        let script = render::nft(ruleset);
        self.run(&script).await?;
        self.applied.store(Arc::new(ruleset.clone()));
        // Fresh gates start closed; re-open the ones that should be active.
        let active = self.active.read().clone();
        for schedule in &active {
            if ruleset.schedules.contains(schedule) {
                self.run(&render::gate_update(ruleset, schedule, true))
                    .await?;
            }
        }
        debug!(rules = ruleset.rule_count(), "kernel ruleset swapped");
        Ok(())
    }

    async fn list(&self) -> Result<String, BackendError> {
        let output = tokio::process::Command::new(&self.nft_path)
            .args(["list", "table", "inet", TABLE_NAME])
            .output()
            .await?;
        if !output.status.success() {
            return Err(BackendError::Rejected(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn add_set_member(&self, set: &str, addr: IpAddr) -> Result<(), BackendError> {
        let applied = self.applied.load();
        let def = applied
            .set(set)
            .ok_or_else(|| BackendError::UnknownSet(set.to_string()))?;
        let suffix = family_of(addr);
        let timeout = def
            .timeout_secs
            .map(|t| format!(" timeout {t}s"))
            .unwrap_or_default();
        self.run(&format!(
            "add element inet {TABLE_NAME} {set}{suffix} {{ {addr}{timeout} }}\n"
        ))
        .await
    }

    async fn remove_set_member(&self, set: &str, addr: IpAddr) -> Result<(), BackendError> {
        let suffix = family_of(addr);
        self.run(&format!(
            "delete element inet {TABLE_NAME} {set}{suffix} {{ {addr} }}\n"
        ))
        .await
    }

    async fn replace_set(&self, set: &str, members: &[IpNet]) -> Result<(), BackendError> {
        let mut script = String::new();
        for suffix in ["_v4", "_v6"] {
            script.push_str(&format!("flush set inet {TABLE_NAME} {set}{suffix}\n"));
        }
        let v4: Vec<String> = members
            .iter()
            .filter(|m| matches!(m, IpNet::V4(_)))
            .map(ToString::to_string)
            .collect();
        let v6: Vec<String> = members
            .iter()
            .filter(|m| matches!(m, IpNet::V6(_)))
            .map(ToString::to_string)
            .collect();
        if !v4.is_empty() {
            script.push_str(&format!(
                "add element inet {TABLE_NAME} {set}_v4 {{ {} }}\n",
                v4.join(", ")
            ));
        }
        if !v6.is_empty() {
            script.push_str(&format!(
                "add element inet {TABLE_NAME} {set}_v6 {{ {} }}\n",
                v6.join(", ")
            ));
        }
        self.run(&script).await
    }

    async fn update_schedules(&self, active: &BTreeSet<String>) -> Result<(), BackendError> {
        let applied = self.applied.load();
        let previous = {
            let mut guard = self.active.write();
            std::mem::replace(&mut *guard, active.clone())
        };
        for schedule in &applied.schedules {
            let was = previous.contains(schedule);
            let is = active.contains(schedule);
            if was != is {
                debug!(schedule, active = is, "schedule gate toggled");
                self.run(&render::gate_update(&applied, schedule, is)).await?;
            }
        }
        Ok(())
    }
}

fn family_of(addr: IpAddr) -> &'static str {
    match addr {
        IpAddr::V4(_) => "_v4",
        IpAddr::V6(_) => "_v6",
    }
}

/// In-process backend: the applied ruleset plus dynamic membership, readable
/// lock-free by the verdict path.
pub struct MemoryBackend {
    applied: ArcSwap<Ruleset>,
    dynamic: RwLock<DynamicState>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        MemoryBackend {
            applied: ArcSwap::from_pointee(Ruleset::default()),
            dynamic: RwLock::new(DynamicState::default()),
        }
    }

    /// Snapshot of the applied ruleset.
    #[must_use]
    pub fn ruleset(&self) -> Arc<Ruleset> {
        self.applied.load_full()
    }

    /// Evaluate a packet against the applied ruleset, used by the flow
    /// engine's inline path.
    #[must_use]
    pub fn evaluate(&self, hook: Hook, pkt: &PacketView) -> FilterVerdict {
        let ruleset = self.applied.load();
        let state = self.dynamic.read();
        crate::eval::evaluate(&ruleset, &state, hook, pkt)
    }

    /// Test and introspection helper.
    #[must_use]
    pub fn set_members(&self, set: &str) -> Vec<IpNet> {
        self.dynamic
            .read()
            .sets
            .get(set)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn active_schedules(&self) -> BTreeSet<String> {
        self.dynamic.read().active_schedules.clone()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RulesetBackend for MemoryBackend {
    async fn apply(&self, ruleset: &Ruleset) -> Result<(), BackendError> {
        self.applied.store(Arc::new(ruleset.clone()));
        // Drop dynamic members of sets that no longer exist.
        let mut dynamic = self.dynamic.write();
        dynamic
            .sets
            .retain(|name, _| ruleset.set(name).is_some());
        Ok(())
    }

    async fn list(&self) -> Result<String, BackendError> {
        Ok(render::nft(&self.applied.load()))
    }

    async fn add_set_member(&self, set: &str, addr: IpAddr) -> Result<(), BackendError> {
        if self.applied.load().set(set).is_none() {
            warn!(set, "membership change for unknown set");
            return Err(BackendError::UnknownSet(set.to_string()));
        }
        self.dynamic
            .write()
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(IpNet::from(addr));
        Ok(())
    }

    async fn remove_set_member(&self, set: &str, addr: IpAddr) -> Result<(), BackendError> {
        if let Some(members) = self.dynamic.write().sets.get_mut(set) {
            members.remove(&IpNet::from(addr));
        }
        Ok(())
    }

    async fn replace_set(&self, set: &str, members: &[IpNet]) -> Result<(), BackendError> {
        self.dynamic
            .write()
            .sets
            .insert(set.to_string(), members.iter().copied().collect());
        Ok(())
    }

    async fn update_schedules(&self, active: &BTreeSet<String>) -> Result<(), BackendError> {
        self.dynamic.write().active_schedules = active.clone();
        Ok(())
    }
}
