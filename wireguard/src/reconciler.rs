// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! Desired tunnel state and its reconciliation against the kernel.

use crate::backend::{TunnelSnapshot, WgBackend};
use crate::WgError;
use async_trait::async_trait;
use config::{ValidModel, WgTunnelConfig};
use ipnet::IpNet;
use recon::{ApplyReport, Reconciler, ResourceOutcome};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PeerSpec {
    pub public_key: String,
    pub preshared_key: Option<String>,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<IpNet>,
    pub persistent_keepalive: u16,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TunnelSpec {
    pub name: String,
    pub private_key: String,
    pub listen_port: u16,
    pub peers: Vec<PeerSpec>,
    pub lockout_protection: bool,
    pub lockout_timeout: u64,
}

impl TunnelSpec {
    #[must_use]
    pub fn from_config(config: &WgTunnelConfig) -> TunnelSpec {
        TunnelSpec {
            name: config.name.clone(),
            private_key: config.private_key.clone(),
            listen_port: config.listen_port,
            peers: config
                .peers
                .iter()
                .map(|peer| PeerSpec {
                    public_key: peer.public_key.clone(),
                    preshared_key: peer.preshared_key.clone(),
                    endpoint: peer.endpoint,
                    allowed_ips: peer.allowed_ips.clone(),
                    persistent_keepalive: peer.persistent_keepalive,
                })
                .collect(),
            lockout_protection: config.lockout_protection,
            lockout_timeout: config.lockout_timeout,
        }
    }

    /// Whether the kernel snapshot already satisfies this spec. Handshake
    /// and counter fields are runtime noise and ignored.
    #[must_use]
    pub fn satisfied_by(&self, snapshot: &TunnelSnapshot) -> bool {
        if snapshot.listen_port != Some(self.listen_port) {
            return false;
        }
        if snapshot.private_key.as_deref() != Some(self.private_key.as_str()) {
            return false;
        }
        if snapshot.peers.len() != self.peers.len() {
            return false;
        }
        self.peers.iter().all(|peer| {
            snapshot.peers.iter().any(|observed| {
                observed.public_key == peer.public_key
                    && observed.endpoint == peer.endpoint
                    && observed.persistent_keepalive == peer.persistent_keepalive
                    && {
                        let mut a = observed.allowed_ips.clone();
                        let mut b = peer.allowed_ips.clone();
                        a.sort();
                        b.sort();
                        a == b
                    }
            })
        })
    }
}

/// Reconstruct a spec from a snapshot, for rollback of reconfigurations.
fn spec_from_snapshot(snapshot: &TunnelSnapshot) -> Option<TunnelSpec> {
    Some(TunnelSpec {
        name: snapshot.name.clone(),
        private_key: snapshot.private_key.clone()?,
        listen_port: snapshot.listen_port?,
        peers: snapshot
            .peers
            .iter()
            .map(|peer| PeerSpec {
                public_key: peer.public_key.clone(),
                // The kernel never reports preshared keys back.
                preshared_key: None,
                endpoint: peer.endpoint,
                allowed_ips: peer.allowed_ips.clone(),
                persistent_keepalive: peer.persistent_keepalive,
            })
            .collect(),
        lockout_protection: false,
        lockout_timeout: 0,
    })
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WgOp {
    Configure(TunnelSpec),
    Remove(String),
}

impl std::fmt::Display for WgOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WgOp::Configure(spec) => write!(f, "configure {}", spec.name),
            WgOp::Remove(name) => write!(f, "remove {name}"),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WgPlan {
    pub forward: Vec<WgOp>,
    pub reverse: Vec<WgOp>,
}

impl WgPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

/// Desired set = every tunnel in the model.
#[derive(Clone, Debug, Default)]
pub struct DesiredTunnels(pub Vec<TunnelSpec>);

impl DesiredTunnels {
    #[must_use]
    pub fn from_model(model: &ValidModel) -> DesiredTunnels {
        DesiredTunnels(
            model
                .model()
                .vpn
                .iter()
                .map(TunnelSpec::from_config)
                .collect(),
        )
    }
}

pub struct WgReconciler {
    backend: Arc<dyn WgBackend>,
}

impl WgReconciler {
    #[must_use]
    pub fn new(backend: Arc<dyn WgBackend>) -> WgReconciler {
        WgReconciler { backend }
    }

    #[must_use]
    pub fn backend(&self) -> Arc<dyn WgBackend> {
        Arc::clone(&self.backend)
    }
}

#[async_trait]
impl Reconciler for WgReconciler {
    type Desired = DesiredTunnels;
    type Plan = WgPlan;
    type Error = WgError;

    fn name(&self) -> &'static str {
        "wireguard"
    }

    async fn diff(&self, desired: &DesiredTunnels) -> Result<WgPlan, WgError> {
        let backend = Arc::clone(&self.backend);
        let desired = desired.0.clone();
        tokio::task::spawn_blocking(move || {
            let mut plan = WgPlan::default();
            for spec in &desired {
                match backend.get(&spec.name)? {
                    Some(snapshot) if spec.satisfied_by(&snapshot) => {}
                    maybe => {
                        plan.forward.push(WgOp::Configure(spec.clone()));
                        plan.reverse.push(match maybe.as_ref().and_then(spec_from_snapshot) {
                            Some(previous) => WgOp::Configure(previous),
                            None => WgOp::Remove(spec.name.clone()),
                        });
                    }
                }
            }
            for name in backend.list()? {
                if desired.iter().all(|spec| spec.name != name) {
                    if let Some(snapshot) = backend.get(&name)? {
                        plan.forward.push(WgOp::Remove(name.clone()));
                        if let Some(previous) = spec_from_snapshot(&snapshot) {
                            plan.reverse.push(WgOp::Configure(previous));
                        }
                    }
                }
            }
            debug!(ops = plan.forward.len(), "wireguard plan computed");
            Ok(plan)
        })
        .await?
    }

    async fn apply(&self, plan: WgPlan) -> Result<(WgPlan, ApplyReport), WgError> {
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || {
            let mut report = ApplyReport::new("wireguard");
            let mut applied_reverse = Vec::new();
            for (position, op) in plan.forward.iter().enumerate() {
                let result = match op {
                    WgOp::Configure(spec) => backend.configure(spec),
                    WgOp::Remove(name) => backend.remove(name),
                };
                let resource = match op {
                    WgOp::Configure(spec) => spec.name.clone(),
                    WgOp::Remove(name) => name.clone(),
                };
                match result {
                    Ok(()) => {
                        if let Some(reverse) = plan.reverse.get(position) {
                            applied_reverse.push(reverse.clone());
                        }
                        report.record(resource, ResourceOutcome::Converged);
                    }
                    Err(error) => {
                        report.record(
                            resource,
                            ResourceOutcome::Degraded {
                                reason: error.to_string(),
                            },
                        );
                    }
                }
            }
            applied_reverse.reverse();
            Ok((
                WgPlan {
                    forward: applied_reverse,
                    reverse: Vec::new(),
                },
                report,
            ))
        })
        .await?
    }

    async fn rollback(&self, reverse: WgPlan) -> Result<(), WgError> {
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || {
            for op in &reverse.forward {
                let result = match op {
                    WgOp::Configure(spec) => backend.configure(spec),
                    WgOp::Remove(name) => backend.remove(name),
                };
                if let Err(error) = result {
                    tracing::warn!(%op, %error, "wireguard rollback op failed");
                }
            }
            Ok(())
        })
        .await?
    }
}
