// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! Protocol handling, lease persistence, the reaper, and the sockets.
//!
//! `handle_message` is a pure function of (scope state, lease table, packet,
//! now) so the protocol tests never open a socket.

use crate::lease::{grace_for, unix_now, Lease, LeaseState};
use crate::scope::Scope;
use crate::DhcpError;
use config::ValidModel;
use dhcproto::v4::{DhcpOption, Message, MessageType, Opcode, OptionCode, UnknownOption};
use dhcproto::{Decodable, Decoder, Encodable, Encoder};
use ipnet::IpNet;
use net::MacAddr;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use store::{Bucket, Store};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Hostname events pushed to the resolver on bind and release.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HostEvent {
    Bind {
        hostname: String,
        ip: IpAddr,
        mac: MacAddr,
    },
    Release {
        hostname: String,
        mac: MacAddr,
    },
}

struct ScopeRuntime {
    scope: Scope,
    /// Our address inside the scope's subnet; server-id and default router.
    server_ip: Ipv4Addr,
    subnet_mask: Option<Ipv4Addr>,
}

pub struct DhcpServer {
    scopes: Vec<ScopeRuntime>,
    leases: BTreeMap<MacAddr, Lease>,
    store: Arc<Store>,
    notify: mpsc::Sender<HostEvent>,
}

impl DhcpServer {
    /// Build scope runtimes from the model and warm the lease table from
    /// the store.
    pub fn from_model(
        model: &ValidModel,
        store: Arc<Store>,
        notify: mpsc::Sender<HostEvent>,
    ) -> Result<DhcpServer, DhcpError> {
        let mut scopes = Vec::new();
        for scope_config in &model.model().dhcp {
            let subnet = model
                .interface(&scope_config.interface)
                .and_then(|iface| {
                    iface.addresses.iter().find_map(|net| match net {
                        IpNet::V4(v4) => Some(*v4),
                        IpNet::V6(_) => None,
                    })
                });
            let server_ip = subnet.map_or(Ipv4Addr::UNSPECIFIED, |net| net.addr());
            scopes.push(ScopeRuntime {
                scope: Scope::new(scope_config.clone()),
                server_ip,
                subnet_mask: subnet.map(|net| net.netmask()),
            });
        }

        let mut leases = BTreeMap::new();
        for (key, lease) in store.scan_json::<Lease>(Bucket::DhcpLeases)? {
            match key.parse::<MacAddr>() {
                Ok(mac) => {
                    leases.insert(mac, lease);
                }
                Err(_) => warn!(key, "skipping lease with malformed key"),
            }
        }
        info!(
            scopes = scopes.len(),
            leases = leases.len(),
            "dhcp service loaded"
        );
        Ok(DhcpServer {
            scopes,
            leases,
            store,
            notify,
        })
    }

    #[must_use]
    pub fn leases(&self) -> Vec<Lease> {
        self.leases.values().cloned().collect()
    }

    /// Process one incoming frame for the scope serving `interface`.
    /// Returns the reply, if any is due.
    pub fn handle_message(
        &mut self,
        interface: &str,
        incoming: &Message,
        now: u64,
    ) -> Result<Option<Message>, DhcpError> {
        let scope_index = self
            .scopes
            .iter()
            .position(|s| s.scope.config.interface == interface);
        let Some(scope_index) = scope_index else {
            return Ok(None);
        };
        let Some(mac) = mac_of(incoming) else {
            return Ok(None);
        };
        let message_type = incoming
            .opts()
            .msg_type()
            .ok_or_else(|| DhcpError::Codec("missing message type".to_string()))?;

        match message_type {
            MessageType::Discover => Ok(self.offer(scope_index, mac, incoming, now)),
            MessageType::Request => self.acknowledge(scope_index, mac, incoming, now),
            MessageType::Release => {
                self.release(mac)?;
                Ok(None)
            }
            MessageType::Decline => {
                // The client found the address in use; forget the lease so
                // the allocator skips past it next time.
                self.release(mac)?;
                Ok(None)
            }
            MessageType::Inform => {
                let runtime = &self.scopes[scope_index];
                let class = vendor_class(incoming);
                let mut reply =
                    base_reply(runtime, incoming, MessageType::Ack, incoming.ciaddr());
                fill_options(&mut reply, runtime, class.as_deref(), None);
                Ok(Some(reply))
            }
            _ => Ok(None),
        }
    }

    fn offer(
        &mut self,
        scope_index: usize,
        mac: MacAddr,
        incoming: &Message,
        now: u64,
    ) -> Option<Message> {
        let runtime = &mut self.scopes[scope_index];
        runtime.scope.expire_offers(now);
        let ip = runtime.scope.allocate(mac, &self.leases, now)?;
        runtime.scope.record_offer(mac, ip, now);
        debug!(%mac, %ip, "offering");

        let class = vendor_class(incoming);
        let mut reply = base_reply(runtime, incoming, MessageType::Offer, ip);
        fill_options(
            &mut reply,
            runtime,
            class.as_deref(),
            Some(runtime.scope.config.lease_time),
        );
        Some(reply)
    }

    fn acknowledge(
        &mut self,
        scope_index: usize,
        mac: MacAddr,
        incoming: &Message,
        now: u64,
    ) -> Result<Option<Message>, DhcpError> {
        let requested = requested_ip(incoming);
        let runtime = &self.scopes[scope_index];
        let Some(requested) = requested else {
            return Ok(Some(nak(runtime, incoming)));
        };

        // A REQUEST is honored when the address is ours to give: it matches
        // the offer, the reservation, an existing lease (renewal), or is
        // simply still free.
        let offered = runtime.scope.offered_to(mac, now);
        let reservation = runtime.scope.reservation_for(mac);
        let acceptable = runtime.scope.contains(requested)
            && (offered == Some(requested)
                || reservation == Some(requested)
                || runtime.scope.allocate(mac, &self.leases, now) == Some(requested));
        if !acceptable {
            debug!(%mac, %requested, "nak: address not ours or taken");
            return Ok(Some(nak(runtime, incoming)));
        }

        let state = runtime
            .scope
            .requested_state(mac, requested, &self.leases, now);
        let hostname = hostname_of(incoming);
        let class = vendor_class(incoming);
        let lease = Lease {
            mac,
            ip: requested,
            hostname: hostname.clone(),
            expires_at: now.saturating_add(runtime.scope.config.lease_time),
            vendor_class: class.clone(),
            state: LeaseState::Bound,
        };

        let mut txn = self.store.begin();
        txn.put_json(Bucket::DhcpLeases, &mac.to_string(), &lease)?;
        txn.commit()?;
        self.leases.insert(mac, lease);
        self.scopes[scope_index].scope.clear_offer(mac);
        info!(%mac, ip = %requested, renewing = (state == LeaseState::Renewing), "bound");

        if let Some(hostname) = hostname {
            let _ = self.notify.try_send(HostEvent::Bind {
                hostname,
                ip: IpAddr::V4(requested),
                mac,
            });
        }

        let runtime = &self.scopes[scope_index];
        let mut reply = base_reply(runtime, incoming, MessageType::Ack, requested);
        fill_options(
            &mut reply,
            runtime,
            class.as_deref(),
            Some(runtime.scope.config.lease_time),
        );
        Ok(Some(reply))
    }

    fn release(&mut self, mac: MacAddr) -> Result<(), DhcpError> {
        if let Some(lease) = self.leases.remove(&mac) {
            let mut txn = self.store.begin();
            txn.delete(Bucket::DhcpLeases, &mac.to_string());
            txn.commit()?;
            info!(%mac, ip = %lease.ip, "released");
            if let Some(hostname) = lease.hostname {
                let _ = self.notify.try_send(HostEvent::Release { hostname, mac });
            }
        }
        Ok(())
    }

    /// One reaper pass: drop leases past expiry + grace, with their sticky
    /// association. Returns how many were removed.
    pub fn reap(&mut self, now: u64) -> Result<usize, DhcpError> {
        let mut doomed = Vec::new();
        for (mac, lease) in &mut self.leases {
            if lease.is_expired(now) {
                let grace = grace_for(
                    self.scopes
                        .iter()
                        .find(|s| s.scope.contains(lease.ip))
                        .map_or(300, |s| s.scope.config.lease_time),
                );
                if now >= lease.reap_after(grace) {
                    doomed.push(*mac);
                } else {
                    lease.state = LeaseState::Expired;
                }
            }
        }
        if doomed.is_empty() {
            return Ok(0);
        }
        let mut txn = self.store.begin();
        for mac in &doomed {
            txn.delete(Bucket::DhcpLeases, &mac.to_string());
        }
        txn.commit()?;
        for mac in &doomed {
            if let Some(lease) = self.leases.remove(mac) {
                debug!(%mac, ip = %lease.ip, "reaped");
                if let Some(hostname) = lease.hostname {
                    let _ = self.notify.try_send(HostEvent::Release { hostname, mac: *mac });
                }
            }
        }
        Ok(doomed.len())
    }

    /// Reaper cadence: quick for short leases, never slower than 5 s per the
    /// shortest scope.
    #[must_use]
    pub fn reap_interval(&self) -> std::time::Duration {
        let shortest = self
            .scopes
            .iter()
            .map(|s| s.scope.config.lease_time)
            .min()
            .unwrap_or(86_400);
        std::time::Duration::from_secs((shortest / 4).clamp(1, 5))
    }

    /// Serve until shutdown. One socket per scope, bound to the scope's
    /// interface so overlapping subnets cannot cross-talk; a forwarder task
    /// per socket funnels datagrams into one handling loop, keeping the
    /// lease table single-writer.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), DhcpError> {
        let (frame_tx, mut frame_rx) = mpsc::channel::<(String, Vec<u8>, SocketAddr)>(256);
        let mut sockets: BTreeMap<String, Arc<UdpSocket>> = BTreeMap::new();
        for runtime in &self.scopes {
            let interface = runtime.scope.config.interface.clone();
            match bind_scope_socket(&interface) {
                Ok(socket) => {
                    let socket = Arc::new(socket);
                    sockets.insert(interface.clone(), Arc::clone(&socket));
                    let frames = frame_tx.clone();
                    let reader_shutdown = shutdown.clone();
                    tokio::spawn(socket_reader(interface, socket, frames, reader_shutdown));
                }
                Err(error) => {
                    warn!(
                        interface = %interface,
                        %error,
                        "dhcp socket bind failed, scope disabled"
                    );
                }
            }
        }
        drop(frame_tx);
        if sockets.is_empty() {
            // Nothing to serve; still run the reaper for persisted leases.
            debug!("dhcp running reaper-only");
        }

        let mut reaper = tokio::time::interval(self.reap_interval());
        loop {
            tokio::select! {
                _ = reaper.tick() => {
                    let _ = self.reap(unix_now());
                }
                frame = frame_rx.recv() => {
                    let Some((interface, datagram, peer)) = frame else { continue };
                    let Ok(incoming) = Message::decode(&mut Decoder::new(&datagram)) else {
                        continue;
                    };
                    match self.handle_message(&interface, &incoming, unix_now()) {
                        Ok(Some(reply)) => {
                            if let Some(socket) = sockets.get(&interface) {
                                send_reply(socket, &reply, peer).await;
                            }
                        }
                        Ok(None) => {}
                        Err(error) => warn!(%error, "dhcp message rejected"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn socket_reader(
    interface: String,
    socket: Arc<UdpSocket>,
    frames: mpsc::Sender<(String, Vec<u8>, SocketAddr)>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 1500];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, peer)) => {
                        let _ = frames
                            .send((interface.clone(), buf[..len].to_vec(), peer))
                            .await;
                    }
                    Err(error) => {
                        warn!(interface = %interface, %error, "dhcp recv failed");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn send_reply(socket: &UdpSocket, reply: &Message, peer: SocketAddr) {
    let mut out = Vec::with_capacity(576);
    let mut encoder = Encoder::new(&mut out);
    if reply.encode(&mut encoder).is_err() {
        return;
    }
    // Unicast renewals answer where they came from; everything else
    // broadcasts, since the client has no address yet.
    let destination = if reply.ciaddr().is_unspecified() || peer.ip().is_unspecified() {
        SocketAddr::from((Ipv4Addr::BROADCAST, 68))
    } else {
        peer
    };
    if let Err(error) = socket.send_to(&out, destination).await {
        warn!(%error, "dhcp reply send failed");
    }
}

fn bind_scope_socket(interface: &str) -> std::io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.bind_device(Some(interface.as_bytes()))?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 67)).into())?;
    UdpSocket::from_std(socket.into())
}

fn mac_of(message: &Message) -> Option<MacAddr> {
    let chaddr = message.chaddr();
    if chaddr.len() < 6 {
        return None;
    }
    let mut octets = [0u8; 6];
    octets.copy_from_slice(&chaddr[..6]);
    let mac = MacAddr(octets);
    (!mac.is_zero()).then_some(mac)
}

fn requested_ip(message: &Message) -> Option<Ipv4Addr> {
    if let Some(DhcpOption::RequestedIpAddress(ip)) =
        message.opts().get(OptionCode::RequestedIpAddress)
    {
        return Some(*ip);
    }
    let ciaddr = message.ciaddr();
    (!ciaddr.is_unspecified()).then_some(ciaddr)
}

fn hostname_of(message: &Message) -> Option<String> {
    match message.opts().get(OptionCode::Hostname) {
        Some(DhcpOption::Hostname(name)) if !name.is_empty() => Some(name.clone()),
        _ => None,
    }
}

fn vendor_class(message: &Message) -> Option<String> {
    match message.opts().get(OptionCode::ClassIdentifier) {
        Some(DhcpOption::ClassIdentifier(raw)) => {
            Some(String::from_utf8_lossy(raw).to_string())
        }
        _ => None,
    }
}

fn base_reply(
    runtime: &ScopeRuntime,
    incoming: &Message,
    message_type: MessageType,
    yiaddr: Ipv4Addr,
) -> Message {
    let mut reply = Message::default();
    reply
        .set_opcode(Opcode::BootReply)
        .set_xid(incoming.xid())
        .set_yiaddr(yiaddr)
        .set_siaddr(runtime.server_ip)
        .set_giaddr(incoming.giaddr())
        .set_chaddr(incoming.chaddr())
        .set_flags(incoming.flags());
    reply
        .opts_mut()
        .insert(DhcpOption::MessageType(message_type));
    reply
        .opts_mut()
        .insert(DhcpOption::ServerIdentifier(runtime.server_ip));
    reply
}

fn nak(runtime: &ScopeRuntime, incoming: &Message) -> Message {
    base_reply(runtime, incoming, MessageType::Nak, Ipv4Addr::UNSPECIFIED)
}

fn fill_options(
    reply: &mut Message,
    runtime: &ScopeRuntime,
    class: Option<&str>,
    lease_time: Option<u64>,
) {
    let scope = &runtime.scope.config;
    if let Some(lease_time) = lease_time {
        reply.opts_mut().insert(DhcpOption::AddressLeaseTime(
            u32::try_from(lease_time).unwrap_or(u32::MAX),
        ));
    }
    if let Some(mask) = runtime.subnet_mask {
        reply.opts_mut().insert(DhcpOption::SubnetMask(mask));
    }
    let router = scope.router.unwrap_or(runtime.server_ip);
    if !router.is_unspecified() {
        reply.opts_mut().insert(DhcpOption::Router(vec![router]));
    }
    let dns: Vec<Ipv4Addr> = scope
        .dns
        .iter()
        .filter_map(|ip| match ip {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        })
        .collect();
    if !dns.is_empty() {
        reply.opts_mut().insert(DhcpOption::DomainNameServer(dns));
    }
    if let Some(domain) = &scope.domain {
        reply
            .opts_mut()
            .insert(DhcpOption::DomainName(domain.clone()));
    }
    for (code, value) in runtime.scope.assemble_options(class) {
        reply.opts_mut().insert(DhcpOption::Unknown(UnknownOption::new(
            OptionCode::from(code),
            value,
        )));
    }
}

#[cfg(test)]
mod tests;
