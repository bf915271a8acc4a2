// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! Per-interface scope state: the allocator and the option assembly.

use crate::lease::{Lease, LeaseState};
use config::catalog;
use config::DhcpScopeConfig;
use net::MacAddr;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// Runtime scope over its config. Offers are scoped-local and volatile;
/// bound leases come from (and go to) the store through the server.
#[derive(Debug)]
pub struct Scope {
    pub config: DhcpScopeConfig,
    /// MAC -> offered IP, awaiting REQUEST. Cleared on ACK or timeout.
    offers: BTreeMap<MacAddr, (Ipv4Addr, u64)>,
}

const OFFER_TTL: u64 = 30;

impl Scope {
    #[must_use]
    pub fn new(config: DhcpScopeConfig) -> Scope {
        Scope {
            config,
            offers: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let ip = u32::from(ip);
        (u32::from(self.config.range_start)..=u32::from(self.config.range_end)).contains(&ip)
    }

    #[must_use]
    pub fn reservation_for(&self, mac: MacAddr) -> Option<Ipv4Addr> {
        self.config
            .reservations
            .iter()
            .find(|r| r.mac.parse::<MacAddr>() == Ok(mac))
            .map(|r| r.ip)
    }

    fn reserved_ips(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.config.reservations.iter().map(|r| r.ip)
    }

    /// Allocation strategy per the lease contract: reservation first, then
    /// the MAC's last known IP (sticky), then first free in range.
    #[must_use]
    pub fn allocate(&self, mac: MacAddr, leases: &BTreeMap<MacAddr, Lease>, now: u64) -> Option<Ipv4Addr> {
        if let Some(reserved) = self.reservation_for(mac) {
            return Some(reserved);
        }
        if let Some(previous) = leases.get(&mac) {
            if self.contains(previous.ip) && !self.ip_taken_by_other(previous.ip, mac, leases, now) {
                return Some(previous.ip);
            }
        }
        self.first_free(mac, leases, now)
    }

    fn ip_taken_by_other(
        &self,
        ip: Ipv4Addr,
        mac: MacAddr,
        leases: &BTreeMap<MacAddr, Lease>,
        now: u64,
    ) -> bool {
        if self.reserved_ips().any(|r| r == ip) && self.reservation_for(mac) != Some(ip) {
            return true;
        }
        let offered = self
            .offers
            .iter()
            .any(|(m, (o, at))| *m != mac && *o == ip && now.saturating_sub(*at) < OFFER_TTL);
        if offered {
            return true;
        }
        leases
            .values()
            .any(|l| l.mac != mac && l.ip == ip && !l.is_expired(now))
    }

    fn first_free(
        &self,
        mac: MacAddr,
        leases: &BTreeMap<MacAddr, Lease>,
        now: u64,
    ) -> Option<Ipv4Addr> {
        let start = u32::from(self.config.range_start);
        let end = u32::from(self.config.range_end);
        (start..=end)
            .map(Ipv4Addr::from)
            .find(|ip| !self.ip_taken_by_other(*ip, mac, leases, now))
    }

    pub fn record_offer(&mut self, mac: MacAddr, ip: Ipv4Addr, now: u64) {
        self.offers.insert(mac, (ip, now));
    }

    #[must_use]
    pub fn offered_to(&self, mac: MacAddr, now: u64) -> Option<Ipv4Addr> {
        self.offers
            .get(&mac)
            .filter(|(_, at)| now.saturating_sub(*at) < OFFER_TTL)
            .map(|(ip, _)| *ip)
    }

    pub fn clear_offer(&mut self, mac: MacAddr) {
        self.offers.remove(&mac);
    }

    pub fn expire_offers(&mut self, now: u64) {
        self.offers
            .retain(|_, (_, at)| now.saturating_sub(*at) < OFFER_TTL);
    }

    /// Scope options plus vendor-class injections for `class` (substring
    /// match on option 60), as `(code, raw bytes)` pairs ready to encode.
    #[must_use]
    pub fn assemble_options(&self, class: Option<&str>) -> Vec<(u8, Vec<u8>)> {
        let mut out: BTreeMap<u8, Vec<u8>> = BTreeMap::new();
        for (name, value) in &self.config.options {
            if let Some(code) = catalog::dhcp_option_code(name) {
                out.insert(code, encode_option_value(code, value));
            }
        }
        if let Some(class) = class {
            for vendor in &self.config.vendor_classes {
                if class.contains(&vendor.identifier) {
                    for (name, value) in &vendor.options {
                        if let Some(code) = catalog::dhcp_option_code(name) {
                            out.insert(code, encode_option_value(code, value));
                        }
                    }
                }
            }
        }
        out.into_iter().collect()
    }

    /// Lease FSM bookkeeping: is this REQUEST a renewal of a bound lease?
    #[must_use]
    pub fn requested_state(
        &self,
        mac: MacAddr,
        requested: Ipv4Addr,
        leases: &BTreeMap<MacAddr, Lease>,
        now: u64,
    ) -> LeaseState {
        match leases.get(&mac) {
            Some(lease) if lease.ip == requested && !lease.is_expired(now) => LeaseState::Renewing,
            _ => LeaseState::Offered,
        }
    }
}

/// Options whose value is an IPv4 address encode as 4 bytes; everything else
/// goes out as text, which covers the tftp/bootfile family.
fn encode_option_value(code: u8, value: &str) -> Vec<u8> {
    const ADDRESS_OPTIONS: [u8; 7] = [1, 3, 6, 28, 42, 44, 150];
    if ADDRESS_OPTIONS.contains(&code) {
        if let Ok(ip) = value.parse::<Ipv4Addr>() {
            return ip.octets().to_vec();
        }
    }
    value.as_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::ReservationConfig;
    use pretty_assertions::assert_eq;

    fn mac(last: u8) -> MacAddr {
        MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, last])
    }

    fn scope() -> Scope {
        Scope::new(DhcpScopeConfig {
            interface: "eth0".into(),
            range_start: Ipv4Addr::new(192, 168, 1, 100),
            range_end: Ipv4Addr::new(192, 168, 1, 102),
            lease_time: 5,
            ..DhcpScopeConfig::default()
        })
    }

    fn bound(mac: MacAddr, ip: [u8; 4], expires_at: u64) -> Lease {
        Lease {
            mac,
            ip: Ipv4Addr::from(ip),
            hostname: None,
            expires_at,
            vendor_class: None,
            state: LeaseState::Bound,
        }
    }

    #[test]
    fn first_free_walks_the_range() {
        let s = scope();
        let mut leases = BTreeMap::new();
        assert_eq!(
            s.allocate(mac(1), &leases, 0),
            Some(Ipv4Addr::new(192, 168, 1, 100))
        );
        leases.insert(mac(2), bound(mac(2), [192, 168, 1, 100], 1_000));
        assert_eq!(
            s.allocate(mac(1), &leases, 0),
            Some(Ipv4Addr::new(192, 168, 1, 101))
        );
    }

    #[test]
    fn sticky_prefers_last_known_ip() {
        let s = scope();
        let mut leases = BTreeMap::new();
        leases.insert(mac(1), bound(mac(1), [192, 168, 1, 101], 1_000));
        assert_eq!(
            s.allocate(mac(1), &leases, 0),
            Some(Ipv4Addr::new(192, 168, 1, 101))
        );
        // Even an expired record keeps stickiness until the reaper drops it.
        leases.get_mut(&mac(1)).unwrap().expires_at = 10;
        assert_eq!(
            s.allocate(mac(1), &leases, 500),
            Some(Ipv4Addr::new(192, 168, 1, 101))
        );
    }

    #[test]
    fn reservation_pins_the_ip() {
        let mut s = scope();
        s.config.reservations.push(ReservationConfig {
            mac: mac(1).to_string(),
            ip: Ipv4Addr::new(192, 168, 1, 102),
            hostname: Some("printer".into()),
        });
        let leases = BTreeMap::new();
        assert_eq!(
            s.allocate(mac(1), &leases, 0),
            Some(Ipv4Addr::new(192, 168, 1, 102))
        );
        // Nobody else may take the reserved address.
        assert_eq!(
            s.allocate(mac(2), &leases, 0),
            Some(Ipv4Addr::new(192, 168, 1, 100))
        );
    }

    #[test]
    fn exhausted_range_allocates_nothing() {
        let s = scope();
        let mut leases = BTreeMap::new();
        for (i, last) in (100..=102).enumerate() {
            let m = mac(10 + i as u8);
            leases.insert(m, bound(m, [192, 168, 1, last], 1_000));
        }
        assert_eq!(s.allocate(mac(1), &leases, 0), None);
    }

    #[test]
    fn offers_block_allocation_until_ttl() {
        let mut s = scope();
        let leases = BTreeMap::new();
        s.record_offer(mac(1), Ipv4Addr::new(192, 168, 1, 100), 0);
        assert_eq!(
            s.allocate(mac(2), &leases, 1),
            Some(Ipv4Addr::new(192, 168, 1, 101))
        );
        // Offer aged out: the address frees up.
        assert_eq!(
            s.allocate(mac(2), &leases, OFFER_TTL + 1),
            Some(Ipv4Addr::new(192, 168, 1, 100))
        );
    }

    #[test]
    fn vendor_class_injects_on_substring() {
        let mut s = scope();
        s.config
            .options
            .insert("domain".into(), "lan.example.com".into());
        s.config.vendor_classes.push(config::VendorClassConfig {
            identifier: "Polycom".into(),
            options: [("tftp_server".to_string(), "tftp-voip.example.com".to_string())]
                .into_iter()
                .collect(),
        });

        let plain = s.assemble_options(Some("Generic-Device"));
        assert!(plain.iter().all(|(code, _)| *code != 66));

        let phone = s.assemble_options(Some("Polycom-VVX400"));
        let tftp = phone.iter().find(|(code, _)| *code == 66).unwrap();
        assert_eq!(tftp.1, b"tftp-voip.example.com".to_vec());
        // Scope defaults stay present.
        assert!(phone.iter().any(|(code, _)| *code == 15));
    }
}
