// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! Virtual-IP ownership: address add/remove over netlink plus gratuitous
//! ARP so switches re-learn the MAC without waiting for their cache.

use crate::HaError;
use async_trait::async_trait;
use futures::TryStreamExt;
use ipnet::IpNet;
use net::MacAddr;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

#[async_trait]
pub trait VipHandler: Send + Sync {
    async fn claim(&self) -> Result<(), HaError>;
    async fn release(&self) -> Result<(), HaError>;
    fn holding(&self) -> bool;
}

pub struct NetlinkVip {
    handle: rtnetlink::Handle,
    interface: String,
    vip: IpNet,
    holding: AtomicBool,
}

impl NetlinkVip {
    pub fn new(interface: &str, vip: IpNet) -> Result<NetlinkVip, HaError> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);
        Ok(NetlinkVip {
            handle,
            interface: interface.to_string(),
            vip,
            holding: AtomicBool::new(false),
        })
    }

    async fn link_index(&self) -> Result<u32, HaError> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(self.interface.clone())
            .execute();
        match links.try_next().await? {
            Some(message) => Ok(message.header.index),
            None => Err(HaError::Socket(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("interface {} not found", self.interface),
            ))),
        }
    }
}

#[async_trait]
impl VipHandler for NetlinkVip {
    async fn claim(&self) -> Result<(), HaError> {
        let index = self.link_index().await?;
        match self
            .handle
            .address()
            .add(index, self.vip.addr(), self.vip.prefix_len())
            .execute()
            .await
        {
            Ok(()) => {}
            // Already present (we held it before a restart): fine.
            Err(rtnetlink::Error::NetlinkError(ref e)) if e.raw_code() == -libc::EEXIST => {}
            Err(error) => return Err(error.into()),
        }
        self.holding.store(true, Ordering::SeqCst);
        info!(vip = %self.vip, interface = %self.interface, "vip claimed");

        if let IpAddr::V4(vip) = self.vip.addr() {
            let interface = self.interface.clone();
            let result =
                tokio::task::spawn_blocking(move || send_gratuitous_arp(&interface, vip, 3));
            match result.await {
                Ok(Err(error)) => warn!(%error, "gratuitous arp failed"),
                Ok(Ok(())) => debug!("gratuitous arps sent"),
                Err(_) => {}
            }
        }
        Ok(())
    }

    async fn release(&self) -> Result<(), HaError> {
        let index = self.link_index().await?;
        let mut addresses = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        while let Some(message) = addresses.try_next().await? {
            use rtnetlink::packet_route::address::AddressAttribute;
            let matches = message.header.prefix_len == self.vip.prefix_len()
                && message.attributes.iter().any(|attribute| {
                    matches!(attribute, AddressAttribute::Address(a) if *a == self.vip.addr())
                });
            if matches {
                self.handle.address().del(message).execute().await?;
                break;
            }
        }
        self.holding.store(false, Ordering::SeqCst);
        info!(vip = %self.vip, "vip released");
        Ok(())
    }

    fn holding(&self) -> bool {
        self.holding.load(Ordering::SeqCst)
    }
}

/// Broadcast ARP announcements for `vip` out of `interface`.
fn send_gratuitous_arp(
    interface: &str,
    vip: std::net::Ipv4Addr,
    count: usize,
) -> std::io::Result<()> {
    let (ifindex, mac) = interface_identity(interface)?;
    let frame = arp_announcement(mac, vip);

    // SAFETY: plain socket syscalls with a stack-local sockaddr_ll; the fd
    // is closed before return.
    unsafe {
        let fd = libc::socket(
            libc::AF_PACKET,
            libc::SOCK_RAW,
            (libc::ETH_P_ARP as u16).to_be() as libc::c_int,
        );
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let mut addr: libc::sockaddr_ll = std::mem::zeroed();
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = (libc::ETH_P_ARP as u16).to_be();
        addr.sll_ifindex = ifindex;
        addr.sll_halen = 6;
        addr.sll_addr[..6].copy_from_slice(&mac.octets());

        for _ in 0..count {
            let sent = libc::sendto(
                fd,
                frame.as_ptr().cast(),
                frame.len(),
                0,
                std::ptr::addr_of!(addr).cast(),
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            );
            if sent < 0 {
                let error = std::io::Error::last_os_error();
                libc::close(fd);
                return Err(error);
            }
        }
        libc::close(fd);
    }
    Ok(())
}

fn interface_identity(interface: &str) -> std::io::Result<(libc::c_int, MacAddr)> {
    let index = {
        let name = std::ffi::CString::new(interface)
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
        // SAFETY: name is a valid NUL-terminated string.
        let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if index == 0 {
            return Err(std::io::Error::last_os_error());
        }
        index as libc::c_int
    };
    let mac_text = std::fs::read_to_string(format!("/sys/class/net/{interface}/address"))?;
    let mac: MacAddr = mac_text
        .trim()
        .parse()
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidData))?;
    Ok((index, mac))
}

/// Ethernet broadcast frame carrying an ARP announcement (request with
/// sender == target == vip).
fn arp_announcement(mac: MacAddr, vip: std::net::Ipv4Addr) -> Vec<u8> {
    let mut frame = Vec::with_capacity(42);
    frame.extend_from_slice(&[0xff; 6]); // dst broadcast
    frame.extend_from_slice(&mac.octets()); // src
    frame.extend_from_slice(&0x0806u16.to_be_bytes()); // ethertype arp
    frame.extend_from_slice(&1u16.to_be_bytes()); // htype ethernet
    frame.extend_from_slice(&0x0800u16.to_be_bytes()); // ptype ipv4
    frame.push(6); // hlen
    frame.push(4); // plen
    frame.extend_from_slice(&1u16.to_be_bytes()); // op request
    frame.extend_from_slice(&mac.octets()); // sender hw
    frame.extend_from_slice(&vip.octets()); // sender ip
    frame.extend_from_slice(&[0; 6]); // target hw
    frame.extend_from_slice(&vip.octets()); // target ip
    frame
}

/// Test double tracking claim/release ordering.
#[derive(Default)]
pub struct FakeVip {
    holding: AtomicBool,
}

impl FakeVip {
    #[must_use]
    pub fn new() -> FakeVip {
        FakeVip::default()
    }

    pub fn force_hold(&self) {
        self.holding.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl VipHandler for FakeVip {
    async fn claim(&self) -> Result<(), HaError> {
        self.holding.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn release(&self) -> Result<(), HaError> {
        self.holding.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn holding(&self) -> bool {
        self.holding.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn arp_announcement_layout() {
        let mac = MacAddr([0x02, 0, 0, 0, 0, 1]);
        let frame = arp_announcement(mac, "192.0.2.10".parse().unwrap());
        assert_eq!(frame.len(), 42);
        assert_eq!(&frame[0..6], &[0xff; 6]);
        assert_eq!(&frame[12..14], &[0x08, 0x06]);
        // Sender and target protocol addresses both carry the VIP.
        assert_eq!(&frame[28..32], &[192, 0, 2, 10]);
        assert_eq!(&frame[38..42], &[192, 0, 2, 10]);
    }
}
