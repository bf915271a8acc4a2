// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! The heartbeat channel: authenticated UDP datagrams and the node loop
//! binding the role machine to the VIP handler.

use crate::fsm::{Role, RoleFsm, Transition};
use crate::vip::VipHandler;
use crate::HaError;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

const TAG_LEN: usize = 32;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatMsg {
    pub role: Role,
    pub priority: u8,
    /// Applied config revision, for drift visibility on the status surface.
    pub revision: u64,
    pub seq: u64,
}

impl HeartbeatMsg {
    /// bincode body followed by an HMAC-SHA256 tag over it.
    pub fn encode(&self, secret: &[u8]) -> Result<Vec<u8>, HaError> {
        let mut body = bincode::serialize(self)?;
        let mut mac =
            HmacSha256::new_from_slice(secret).map_err(|_| HaError::BadAuth)?;
        mac.update(&body);
        body.extend_from_slice(&mac.finalize().into_bytes());
        Ok(body)
    }

    /// Verify and decode; a bad or missing tag is dropped (and counted by
    /// the caller), never parsed.
    pub fn decode(raw: &[u8], secret: &[u8]) -> Result<HeartbeatMsg, HaError> {
        if raw.len() <= TAG_LEN {
            return Err(HaError::BadAuth);
        }
        let (body, tag) = raw.split_at(raw.len() - TAG_LEN);
        let mut mac =
            HmacSha256::new_from_slice(secret).map_err(|_| HaError::BadAuth)?;
        mac.update(body);
        mac.verify_slice(tag).map_err(|_| HaError::BadAuth)?;
        Ok(bincode::deserialize(body)?)
    }
}

/// The running node: announces over UDP, listens for the peer, drives the
/// FSM and the VIP.
pub struct HaNode {
    fsm: Mutex<RoleFsm>,
    vip: Arc<dyn VipHandler>,
    secret: Vec<u8>,
    peer: std::net::SocketAddr,
    listen: std::net::SocketAddr,
    interval: Duration,
    revision: Mutex<u64>,
    pub bad_auth_drops: std::sync::atomic::AtomicU64,
}

impl HaNode {
    #[must_use]
    pub fn new(
        config: &config::ReplicationConfig,
        vip: Arc<dyn VipHandler>,
    ) -> Arc<HaNode> {
        let role = match config.role {
            config::HaRole::Primary => Role::Primary,
            config::HaRole::Replica => Role::Replica,
        };
        Arc::new(HaNode {
            fsm: Mutex::new(RoleFsm::new(role, config.priority, config.failure_threshold)),
            vip,
            secret: config.secret.as_bytes().to_vec(),
            peer: config.peer,
            listen: config.listen,
            interval: Duration::from_secs(config.heartbeat_interval.max(1)),
            revision: Mutex::new(0),
            bad_auth_drops: std::sync::atomic::AtomicU64::new(0),
        })
    }

    pub fn set_revision(&self, revision: u64) {
        *self.revision.lock() = revision;
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.fsm.lock().role()
    }

    #[must_use]
    pub fn holding_vip(&self) -> bool {
        self.vip.holding()
    }

    async fn react(&self, transition: Option<Transition>) {
        match transition {
            Some(Transition::Promote) => {
                if let Err(error) = self.vip.claim().await {
                    warn!(%error, "vip claim failed");
                }
            }
            Some(Transition::Yield) => {
                if let Err(error) = self.vip.release().await {
                    warn!(%error, "vip release failed");
                }
            }
            None => {}
        }
    }

    /// Feed one received datagram. Exposed for tests; the loop calls this.
    pub async fn handle_datagram(&self, raw: &[u8]) {
        match HeartbeatMsg::decode(raw, &self.secret) {
            Ok(message) => {
                let transition = self
                    .fsm
                    .lock()
                    .on_heartbeat(message.role, message.priority);
                self.react(transition).await;
            }
            Err(_) => {
                self.bad_auth_drops
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }
    }

    /// One missed-interval tick. Exposed for tests.
    pub async fn handle_missed(&self) {
        let transition = self.fsm.lock().on_missed();
        self.react(transition).await;
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), HaError> {
        let socket = UdpSocket::bind(self.listen).await?;
        // A configured primary owns the VIP from the start.
        if self.fsm.lock().is_primary() {
            self.react(Some(Transition::Promote)).await;
        }

        let mut seq: u64 = 0;
        let mut ticker = tokio::time::interval(self.interval);
        let mut buf = vec![0u8; 512];
        let mut heard_this_interval = false;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Announce.
                    let message = HeartbeatMsg {
                        role: self.role(),
                        priority: self.fsm.lock().priority(),
                        revision: *self.revision.lock(),
                        seq,
                    };
                    seq = seq.wrapping_add(1);
                    match message.encode(&self.secret) {
                        Ok(datagram) => {
                            if let Err(error) = socket.send_to(&datagram, self.peer).await {
                                debug!(%error, "heartbeat send failed");
                            }
                        }
                        Err(error) => warn!(%error, "heartbeat encode failed"),
                    }
                    // Score the interval that just ended.
                    if heard_this_interval {
                        heard_this_interval = false;
                    } else {
                        self.handle_missed().await;
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    if let Ok((len, _peer)) = received {
                        heard_this_interval = true;
                        self.handle_datagram(&buf[..len]).await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // Leaving gracefully: drop the VIP so the peer can
                        // take over without waiting out the threshold.
                        if self.vip.holding() {
                            let _ = self.vip.release().await;
                        }
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vip::FakeVip;
    use pretty_assertions::assert_eq;

    fn replication(role: config::HaRole, priority: u8) -> config::ReplicationConfig {
        config::ReplicationConfig {
            role,
            priority,
            secret: "hunter2".to_string(),
            peer: "127.0.0.1:9".parse().unwrap(),
            listen: "127.0.0.1:0".parse().unwrap(),
            heartbeat_interval: 1,
            failure_threshold: 3,
            ..config::ReplicationConfig::default()
        }
    }

    #[test]
    fn heartbeat_wire_round_trip_and_auth() {
        let message = HeartbeatMsg {
            role: Role::Primary,
            priority: 150,
            revision: 42,
            seq: 7,
        };
        let raw = message.encode(b"secret").unwrap();
        assert_eq!(HeartbeatMsg::decode(&raw, b"secret").unwrap(), message);

        // Wrong secret or tampered body are rejected.
        assert!(HeartbeatMsg::decode(&raw, b"other").is_err());
        let mut tampered = raw.clone();
        tampered[0] ^= 0xff;
        assert!(HeartbeatMsg::decode(&tampered, b"secret").is_err());
        assert!(HeartbeatMsg::decode(&raw[..10], b"secret").is_err());
    }

    #[tokio::test]
    async fn partition_promotes_and_restoration_resolves() {
        let vip = Arc::new(FakeVip::new());
        let node = HaNode::new(
            &replication(config::HaRole::Replica, 150),
            Arc::clone(&vip) as Arc<dyn VipHandler>,
        );

        // Three silent intervals: promote and claim.
        node.handle_missed().await;
        node.handle_missed().await;
        assert!(!vip.holding());
        node.handle_missed().await;
        assert!(vip.holding());
        assert_eq!(node.role(), Role::Primary);

        // Partition heals; the old primary (priority 50) still announces
        // primary. We outrank it: keep the VIP.
        let peer = HeartbeatMsg {
            role: Role::Primary,
            priority: 50,
            revision: 0,
            seq: 0,
        };
        node.handle_datagram(&peer.encode(b"hunter2").unwrap()).await;
        assert!(vip.holding());
        assert_eq!(node.role(), Role::Primary);
    }

    #[tokio::test]
    async fn outranked_primary_yields_on_restoration() {
        let vip = Arc::new(FakeVip::new());
        vip.force_hold();
        let node = HaNode::new(
            &replication(config::HaRole::Primary, 50),
            Arc::clone(&vip) as Arc<dyn VipHandler>,
        );
        let peer = HeartbeatMsg {
            role: Role::Primary,
            priority: 150,
            revision: 0,
            seq: 0,
        };
        node.handle_datagram(&peer.encode(b"hunter2").unwrap()).await;
        assert!(!vip.holding());
        assert_eq!(node.role(), Role::Replica);
    }

    #[tokio::test]
    async fn bad_auth_is_counted_not_processed() {
        let vip = Arc::new(FakeVip::new());
        let node = HaNode::new(
            &replication(config::HaRole::Replica, 150),
            Arc::clone(&vip) as Arc<dyn VipHandler>,
        );
        let forged = HeartbeatMsg {
            role: Role::Primary,
            priority: 255,
            revision: 0,
            seq: 0,
        }
        .encode(b"wrong-secret")
        .unwrap();
        node.handle_datagram(&forged).await;
        assert_eq!(
            node.bad_auth_drops
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
        assert_eq!(node.role(), Role::Replica);
    }
}
