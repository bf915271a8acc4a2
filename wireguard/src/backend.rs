// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! The kernel seam for WireGuard devices, with a fake for tests and for the
//! lockout guard's unit coverage.

use crate::reconciler::{PeerSpec, TunnelSpec};
use crate::WgError;
use ipnet::IpNet;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::SystemTime;
use wireguard_control::{
    AllowedIp, Backend, Device, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder,
};

/// Kernel view of one configured peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub public_key: String,
    pub endpoint: Option<std::net::SocketAddr>,
    pub allowed_ips: Vec<IpNet>,
    pub persistent_keepalive: u16,
    pub last_handshake: Option<SystemTime>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Kernel view of one tunnel device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelSnapshot {
    pub name: String,
    pub listen_port: Option<u16>,
    pub private_key: Option<String>,
    pub peers: Vec<PeerSnapshot>,
}

/// Device operations the reconciler and the lockout guard need. Sync on
/// purpose: the kernel calls are ioctl-fast and callers wrap them in
/// `spawn_blocking`.
pub trait WgBackend: Send + Sync {
    fn list(&self) -> Result<Vec<String>, WgError>;
    fn get(&self, name: &str) -> Result<Option<TunnelSnapshot>, WgError>;
    /// Create the device if missing and swap in the full configuration
    /// (private key, listen port, complete peer table).
    fn configure(&self, spec: &TunnelSpec) -> Result<(), WgError>;
    fn remove(&self, name: &str) -> Result<(), WgError>;
}

/// The production backend over the kernel module.
#[derive(Default)]
pub struct KernelWg;

impl KernelWg {
    fn iface(name: &str) -> Result<InterfaceName, WgError> {
        name.parse()
            .map_err(|_| WgError::Key(format!("bad interface name {name}")))
    }

    fn key(name: &str, key: &str) -> Result<Key, WgError> {
        Key::from_base64(key).map_err(|_| WgError::Key(name.to_string()))
    }
}

impl WgBackend for KernelWg {
    fn list(&self) -> Result<Vec<String>, WgError> {
        let names = Device::list(Backend::Kernel)
            .map_err(|e| WgError::Device("list".to_string(), e))?;
        Ok(names.iter().map(|n| n.as_str_lossy().to_string()).collect())
    }

    fn get(&self, name: &str) -> Result<Option<TunnelSnapshot>, WgError> {
        let iface = Self::iface(name)?;
        let device = match Device::get(&iface, Backend::Kernel) {
            Ok(device) => device,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(WgError::Device(name.to_string(), error)),
        };
        Ok(Some(TunnelSnapshot {
            name: name.to_string(),
            listen_port: device.listen_port,
            private_key: device.private_key.as_ref().map(Key::to_base64),
            peers: device
                .peers
                .iter()
                .map(|peer| PeerSnapshot {
                    public_key: peer.config.public_key.to_base64(),
                    endpoint: peer.config.endpoint,
                    allowed_ips: peer
                        .config
                        .allowed_ips
                        .iter()
                        .filter_map(|ip| IpNet::new(ip.address, ip.cidr).ok())
                        .collect(),
                    persistent_keepalive: peer.config.persistent_keepalive_interval.unwrap_or(0),
                    last_handshake: peer.stats.last_handshake_time,
                    rx_bytes: peer.stats.rx_bytes,
                    tx_bytes: peer.stats.tx_bytes,
                })
                .collect(),
        }))
    }

    fn configure(&self, spec: &TunnelSpec) -> Result<(), WgError> {
        let iface = Self::iface(&spec.name)?;
        let mut update = DeviceUpdate::new()
            .set_private_key(Self::key(&spec.name, &spec.private_key)?)
            .set_listen_port(spec.listen_port)
            .replace_peers();
        for peer in &spec.peers {
            update = update.add_peer(peer_config(peer)?);
        }
        update
            .apply(&iface, Backend::Kernel)
            .map_err(|e| WgError::Device(spec.name.clone(), e))
    }

    fn remove(&self, name: &str) -> Result<(), WgError> {
        let iface = Self::iface(name)?;
        match Device::get(&iface, Backend::Kernel) {
            Ok(device) => device
                .delete()
                .map_err(|e| WgError::Device(name.to_string(), e)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(WgError::Device(name.to_string(), error)),
        }
    }
}

fn peer_config(peer: &PeerSpec) -> Result<PeerConfigBuilder, WgError> {
    let key = Key::from_base64(&peer.public_key)
        .map_err(|_| WgError::Key(peer.public_key.clone()))?;
    let mut builder = PeerConfigBuilder::new(&key).replace_allowed_ips();
    if let Some(psk) = &peer.preshared_key {
        builder = builder.set_preshared_key(
            Key::from_base64(psk).map_err(|_| WgError::Key(peer.public_key.clone()))?,
        );
    }
    if let Some(endpoint) = peer.endpoint {
        builder = builder.set_endpoint(endpoint);
    }
    if peer.persistent_keepalive > 0 {
        builder = builder.set_persistent_keepalive_interval(peer.persistent_keepalive);
    }
    let allowed: Vec<AllowedIp> = peer
        .allowed_ips
        .iter()
        .map(|net| AllowedIp {
            address: net.addr(),
            cidr: net.prefix_len(),
        })
        .collect();
    Ok(builder.add_allowed_ips(&allowed))
}

/// In-memory backend for tests. Handshakes are injected by the test to
/// drive the lockout guard.
#[derive(Default)]
pub struct FakeWg {
    devices: Mutex<BTreeMap<String, TunnelSnapshot>>,
}

impl FakeWg {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a peer handshake observed now.
    pub fn handshake(&self, tunnel: &str, public_key: &str) {
        let mut devices = self.devices.lock();
        if let Some(device) = devices.get_mut(tunnel) {
            for peer in &mut device.peers {
                if peer.public_key == public_key {
                    peer.last_handshake = Some(SystemTime::now());
                }
            }
        }
    }

    /// Addresses the fake does not track; handy in tests.
    #[must_use]
    pub fn device_names(&self) -> Vec<String> {
        self.devices.lock().keys().cloned().collect()
    }
}

impl WgBackend for FakeWg {
    fn list(&self) -> Result<Vec<String>, WgError> {
        Ok(self.device_names())
    }

    fn get(&self, name: &str) -> Result<Option<TunnelSnapshot>, WgError> {
        Ok(self.devices.lock().get(name).cloned())
    }

    fn configure(&self, spec: &TunnelSpec) -> Result<(), WgError> {
        let mut devices = self.devices.lock();
        let previous = devices.get(&spec.name);
        let peers = spec
            .peers
            .iter()
            .map(|peer| PeerSnapshot {
                public_key: peer.public_key.clone(),
                endpoint: peer.endpoint,
                allowed_ips: peer.allowed_ips.clone(),
                persistent_keepalive: peer.persistent_keepalive,
                // Keep handshake history for peers that persist across
                // reconfiguration, like the kernel does.
                last_handshake: previous.and_then(|d| {
                    d.peers
                        .iter()
                        .find(|p| p.public_key == peer.public_key)
                        .and_then(|p| p.last_handshake)
                }),
                rx_bytes: 0,
                tx_bytes: 0,
            })
            .collect();
        devices.insert(
            spec.name.clone(),
            TunnelSnapshot {
                name: spec.name.clone(),
                listen_port: Some(spec.listen_port),
                private_key: Some(spec.private_key.clone()),
                peers,
            },
        );
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), WgError> {
        self.devices.lock().remove(name);
        Ok(())
    }
}

/// Convenience: which peers of a snapshot shook hands after `since`.
#[must_use]
pub fn handshakes_after(snapshot: &TunnelSnapshot, since: SystemTime) -> Vec<&PeerSnapshot> {
    snapshot
        .peers
        .iter()
        .filter(|peer| peer.last_handshake.is_some_and(|t| t > since))
        .collect()
}

/// Rough liveness used by `vpn status`: any endpoint or handshake at all.
#[must_use]
pub fn peer_is_live(peer: &PeerSnapshot, now: SystemTime, keepalive_grace: u64) -> bool {
    peer.last_handshake.is_some_and(|t| {
        now.duration_since(t)
            .map(|d| d.as_secs() < 180 + keepalive_grace)
            .unwrap_or(false)
    })
}
