// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! Service sections: DHCP scopes, DNS, WireGuard tunnels, IPSets, uplink
//! groups, schedules, protection and replication.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReservationConfig {
    pub mac: String,
    pub ip: Ipv4Addr,
    pub hostname: Option<String>,
}

/// Vendor-class option injection: substring match on option 60.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VendorClassConfig {
    pub identifier: String,
    /// Option name (or numeric code as string) to value.
    pub options: BTreeMap<String, String>,
}

/// One DHCP scope; at most one per interface.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DhcpScopeConfig {
    pub interface: String,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    pub router: Option<Ipv4Addr>,
    pub dns: Vec<IpAddr>,
    pub domain: Option<String>,
    /// Seconds.
    pub lease_time: u64,
    pub reservations: Vec<ReservationConfig>,
    /// Extra options by name or numeric code.
    pub options: BTreeMap<String, String>,
    pub vendor_classes: Vec<VendorClassConfig>,
}

impl Default for DhcpScopeConfig {
    fn default() -> Self {
        DhcpScopeConfig {
            interface: String::new(),
            range_start: Ipv4Addr::UNSPECIFIED,
            range_end: Ipv4Addr::UNSPECIFIED,
            router: None,
            dns: Vec::new(),
            domain: None,
            lease_time: 86_400,
            reservations: Vec::new(),
            options: BTreeMap::new(),
            vendor_classes: Vec::new(),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamKind {
    Udp,
    Tcp,
    Dot,
    Doh,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DnsUpstreamConfig {
    /// `ip[:port]` for udp/tcp/dot; URL for doh.
    pub address: String,
    pub kind: UpstreamKind,
    /// Lower number tried first.
    pub priority: u32,
    /// SNI / certificate name for DoT when it differs from the address.
    pub tls_name: Option<String>,
}

impl Default for DnsUpstreamConfig {
    fn default() -> Self {
        DnsUpstreamConfig {
            address: String::new(),
            kind: UpstreamKind::Udp,
            priority: 10,
            tls_name: None,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlocklistFormat {
    Hosts,
    Domains,
    Adblock,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BlocklistConfig {
    pub url: String,
    pub format: BlocklistFormat,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StaticHostConfig {
    pub name: String,
    pub ip: IpAddr,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LocalZoneConfig {
    pub domain: String,
    pub hosts: Vec<StaticHostConfig>,
}

impl Default for LocalZoneConfig {
    fn default() -> Self {
        LocalZoneConfig {
            domain: String::new(),
            hosts: Vec::new(),
        }
    }
}

/// What a blocked name resolves to.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockResponse {
    #[default]
    Zero,
    Nxdomain,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DnsCacheConfig {
    pub max_entries: usize,
    pub min_ttl: u32,
    pub max_ttl: u32,
}

impl Default for DnsCacheConfig {
    fn default() -> Self {
        DnsCacheConfig {
            max_entries: 10_000,
            min_ttl: 30,
            max_ttl: 86_400,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DnsConfig {
    pub listen: Vec<SocketAddr>,
    pub upstreams: Vec<DnsUpstreamConfig>,
    pub blocklists: Vec<BlocklistConfig>,
    /// Names exempt from blocklists, wildcards included.
    pub allowlist: Vec<String>,
    pub local_zones: Vec<LocalZoneConfig>,
    pub static_hosts: Vec<StaticHostConfig>,
    pub cache: DnsCacheConfig,
    pub block_response: BlockResponse,
    /// Seconds between blocklist refreshes.
    pub blocklist_refresh: u64,
    pub query_log: Option<String>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        DnsConfig {
            listen: vec!["0.0.0.0:53".parse().unwrap_or_else(|_| unreachable!())],
            upstreams: Vec::new(),
            blocklists: Vec::new(),
            allowlist: Vec::new(),
            local_zones: Vec::new(),
            static_hosts: Vec::new(),
            cache: DnsCacheConfig::default(),
            block_response: BlockResponse::default(),
            blocklist_refresh: 86_400,
            query_log: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WgPeerConfig {
    pub public_key: String,
    pub preshared_key: Option<String>,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<IpNet>,
    /// Seconds; zero disables.
    pub persistent_keepalive: u16,
}

impl Default for WgPeerConfig {
    fn default() -> Self {
        WgPeerConfig {
            public_key: String::new(),
            preshared_key: None,
            endpoint: None,
            allowed_ips: Vec::new(),
            persistent_keepalive: 0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WgTunnelConfig {
    pub name: String,
    pub private_key: String,
    pub listen_port: u16,
    pub addresses: Vec<IpNet>,
    pub peers: Vec<WgPeerConfig>,
    /// Auto-revert a config change that would orphan the admin session.
    pub lockout_protection: bool,
    /// Seconds before an unconfirmed change reverts.
    pub lockout_timeout: u64,
}

impl Default for WgTunnelConfig {
    fn default() -> Self {
        WgTunnelConfig {
            name: String::new(),
            private_key: String::new(),
            listen_port: 0,
            addresses: Vec::new(),
            peers: Vec::new(),
            lockout_protection: false,
            lockout_timeout: 90,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IpSetConfig {
    pub name: String,
    /// Static members, also the fallback when a URL source fails cold.
    pub entries: Vec<IpNet>,
    pub url: Option<String>,
    pub file: Option<String>,
    /// Domains resolved through the resolver, refreshed on TTL expiry.
    pub domains: Vec<String>,
    /// Seconds between URL refreshes.
    pub refresh_interval: u64,
}

impl Default for IpSetConfig {
    fn default() -> Self {
        IpSetConfig {
            name: String::new(),
            entries: Vec::new(),
            url: None,
            file: None,
            domains: Vec::new(),
            refresh_interval: 3_600,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UplinkMemberConfig {
    pub interface: String,
    /// Lower number preferred.
    pub priority: u32,
    pub weight: u32,
}

impl Default for UplinkMemberConfig {
    fn default() -> Self {
        UplinkMemberConfig {
            interface: String::new(),
            priority: 10,
            weight: 1,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub ping: Vec<IpAddr>,
    pub http: Vec<String>,
    pub interval: u64,
    /// Consecutive successes to go up.
    pub up_threshold: u32,
    /// Consecutive failures to go down.
    pub down_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        HealthCheckConfig {
            ping: Vec::new(),
            http: Vec::new(),
            interval: 5,
            up_threshold: 3,
            down_threshold: 3,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UplinkGroupConfig {
    pub name: String,
    pub members: Vec<UplinkMemberConfig>,
    pub health: HealthCheckConfig,
}

/// Chain-level protections the compiler emits plus the fail2ban knobs.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProtectionConfig {
    /// New TCP connections per second per source before drop; None disables.
    pub syn_flood_rate: Option<u32>,
    /// ICMP echo per second before drop; None disables.
    pub icmp_rate: Option<u32>,
    pub fail2ban: Fail2banConfig,
    /// URL template with `{cc}` for country CIDR feeds.
    pub geoip_url: Option<String>,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        ProtectionConfig {
            syn_flood_rate: None,
            icmp_rate: None,
            fail2ban: Fail2banConfig::default(),
            geoip_url: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Fail2banConfig {
    pub threshold: u32,
    /// Seconds.
    pub window: u64,
    /// Seconds an address stays in `blocked_ips`; zero means until reboot.
    pub ban_time: u64,
}

impl Default for Fail2banConfig {
    fn default() -> Self {
        Fail2banConfig {
            threshold: 5,
            window: 600,
            ban_time: 3_600,
        }
    }
}

/// One scheduler window. `days` are lowercase English day names; times are
/// `HH:MM` wall clock in `timezone`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScheduleConfig {
    pub name: String,
    pub days: Vec<String>,
    pub start: String,
    pub end: String,
    /// Defaults to `system.timezone` when empty.
    pub timezone: Option<String>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig {
            name: String::new(),
            days: Vec::new(),
            start: "00:00".to_string(),
            end: "00:00".to_string(),
            timezone: None,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HaRole {
    Primary,
    Replica,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReplicationConfig {
    pub role: HaRole,
    /// Heartbeat destination (the peer's heartbeat listener).
    pub peer: SocketAddr,
    pub listen: SocketAddr,
    /// Higher wins, with preemption.
    pub priority: u8,
    /// Seconds.
    pub heartbeat_interval: u64,
    pub failure_threshold: u32,
    pub virtual_ip: IpNet,
    pub vip_interface: String,
    /// Authenticates heartbeat and sync channels.
    pub secret: String,
    pub sync_listen: Option<SocketAddr>,
    pub sync_peer: Option<SocketAddr>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            role: HaRole::Primary,
            peer: "0.0.0.0:0".parse().unwrap_or_else(|_| unreachable!()),
            listen: "0.0.0.0:7846".parse().unwrap_or_else(|_| unreachable!()),
            priority: 100,
            heartbeat_interval: 1,
            failure_threshold: 3,
            virtual_ip: "0.0.0.0/32".parse().unwrap_or_else(|_| unreachable!()),
            vip_interface: String::new(),
            secret: String::new(),
            sync_listen: None,
            sync_peer: None,
        }
    }
}
