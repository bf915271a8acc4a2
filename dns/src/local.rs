// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! Local authoritative data: static hosts, configured zones, and hostnames
//! learned from DHCP binds.

use config::DnsConfig;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;

const LOCAL_TTL: u32 = 60;

#[derive(Debug, Default)]
pub struct LocalZones {
    /// fqdn (no trailing dot, lowercase) -> address.
    r#static: HashMap<String, IpAddr>,
    /// Zone suffixes we are authoritative for (lowercase, no trailing dot).
    zones: Vec<String>,
    /// hostname (bare, lowercase) -> address, maintained by DHCP events.
    learned: RwLock<HashMap<String, IpAddr>>,
}

fn canon(name: &str) -> String {
    name.trim_end_matches('.').to_lowercase()
}

impl LocalZones {
    #[must_use]
    pub fn from_config(config: &DnsConfig) -> LocalZones {
        let mut r#static = HashMap::new();
        for host in &config.static_hosts {
            r#static.insert(canon(&host.name), host.ip);
        }
        let mut zones = Vec::new();
        for zone in &config.local_zones {
            zones.push(canon(&zone.domain));
            for host in &zone.hosts {
                let fqdn = if host.name.contains('.') {
                    canon(&host.name)
                } else {
                    format!("{}.{}", canon(&host.name), canon(&zone.domain))
                };
                r#static.insert(fqdn, host.ip);
            }
        }
        LocalZones {
            r#static,
            zones,
            learned: RwLock::new(HashMap::new()),
        }
    }

    pub fn learn(&self, hostname: &str, ip: IpAddr) {
        self.learned.write().insert(canon(hostname), ip);
    }

    pub fn forget(&self, hostname: &str) {
        self.learned.write().remove(&canon(hostname));
    }

    /// Are we authoritative for this name (so misses answer NXDOMAIN rather
    /// than being forwarded upstream)?
    #[must_use]
    pub fn is_authoritative(&self, name: &str) -> bool {
        let name = canon(name);
        self.zones
            .iter()
            .any(|zone| name == *zone || name.ends_with(&format!(".{zone}")))
    }

    /// Resolve a name locally. Learned hostnames answer both bare and under
    /// any local zone.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<(IpAddr, u32)> {
        let name = canon(name);
        if let Some(ip) = self.r#static.get(&name) {
            return Some((*ip, LOCAL_TTL));
        }
        let learned = self.learned.read();
        if let Some(ip) = learned.get(&name) {
            return Some((*ip, LOCAL_TTL));
        }
        for zone in &self.zones {
            if let Some(host) = name.strip_suffix(&format!(".{zone}")) {
                if let Some(ip) = learned.get(host) {
                    return Some((*ip, LOCAL_TTL));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{LocalZoneConfig, StaticHostConfig};
    use pretty_assertions::assert_eq;

    fn zones() -> LocalZones {
        LocalZones::from_config(&DnsConfig {
            static_hosts: vec![StaticHostConfig {
                name: "nas.lan".to_string(),
                ip: "192.168.1.5".parse().unwrap(),
            }],
            local_zones: vec![LocalZoneConfig {
                domain: "lan".to_string(),
                hosts: vec![StaticHostConfig {
                    name: "router".to_string(),
                    ip: "192.168.1.1".parse().unwrap(),
                }],
            }],
            ..DnsConfig::default()
        })
    }

    #[test]
    fn static_and_zone_hosts_resolve() {
        let zones = zones();
        assert_eq!(
            zones.lookup("nas.lan").unwrap().0,
            "192.168.1.5".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            zones.lookup("Router.LAN.").unwrap().0,
            "192.168.1.1".parse::<IpAddr>().unwrap()
        );
        assert!(zones.lookup("ghost.lan").is_none());
    }

    #[test]
    fn authority_covers_zone_misses() {
        let zones = zones();
        assert!(zones.is_authoritative("anything.lan"));
        assert!(zones.is_authoritative("lan"));
        assert!(!zones.is_authoritative("example.com"));
        assert!(!zones.is_authoritative("notlan"));
    }

    #[test]
    fn dhcp_learning_round_trip() {
        let zones = zones();
        zones.learn("printer", "192.168.1.42".parse().unwrap());
        assert!(zones.lookup("printer").is_some());
        // Learned names resolve under the local zone too.
        assert!(zones.lookup("printer.lan").is_some());
        zones.forget("printer");
        assert!(zones.lookup("printer").is_none());
    }
}
