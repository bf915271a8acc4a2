// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! The intermediate model as received from a front-end, prior to validation.

mod interfaces;
mod policy;
mod services;
mod zones;

pub use interfaces::*;
pub use policy::*;
pub use services::*;
pub use zones::*;

use serde::{Deserialize, Serialize};

/// The special zone naming the host itself.
pub const HOST_ZONE: &str = "flywall";

/// Root of the intermediate model. Field names match the declarative
/// sections; unknown sections the core does not interpret are retained
/// verbatim so staged diffs round-trip.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Model {
    pub system: SystemConfig,
    #[serde(rename = "interface")]
    pub interfaces: Vec<InterfaceConfig>,
    #[serde(rename = "zone")]
    pub zones: Vec<ZoneConfig>,
    #[serde(rename = "policy")]
    pub policies: Vec<PolicyConfig>,
    pub nat: Vec<NatRuleConfig>,
    pub dhcp: Vec<DhcpScopeConfig>,
    pub dns: Option<DnsConfig>,
    #[serde(rename = "vpn")]
    pub vpn: Vec<WgTunnelConfig>,
    #[serde(rename = "ipset")]
    pub ipsets: Vec<IpSetConfig>,
    #[serde(rename = "uplink_group")]
    pub uplink_groups: Vec<UplinkGroupConfig>,
    pub protection: ProtectionConfig,
    #[serde(rename = "scheduler")]
    pub schedules: Vec<ScheduleConfig>,
    #[serde(rename = "scheduled_rule")]
    pub scheduled_rules: Vec<ScheduledRuleConfig>,
    pub replication: Option<ReplicationConfig>,
    pub api: ApiConfig,
    pub features: FeaturesConfig,
    // Passed through untouched for the UI and external collaborators.
    pub notifications: Option<serde_json::Value>,
    pub audit: Option<serde_json::Value>,
    pub web: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SystemConfig {
    pub hostname: Option<String>,
    /// IANA timezone name, the default for schedules that name none.
    pub timezone: String,
    pub state_dir: Option<String>,
    pub run_dir: Option<String>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            hostname: None,
            timezone: "UTC".to_string(),
            state_dir: None,
            run_dir: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeaturesConfig {
    /// Trust-on-first-use flow learning. Off means enforcement mode.
    pub learning_mode: bool,
    /// Packets of a new flow inspected before offload.
    pub packet_window: u32,
    /// Seconds of inactivity after which a flow expires.
    pub flow_timeout: u64,
    /// Seconds between flow reaper passes (adapted at runtime).
    pub cleanup_interval: u64,
    /// Leave forwarding disabled after apply; management input stays open.
    pub safe_mode: bool,
    /// Rejected by the validator: superseded by the top-level `dns` section.
    pub dns_blocklist: Option<serde_json::Value>,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        FeaturesConfig {
            learning_mode: true,
            packet_window: 10,
            flow_timeout: 300,
            cleanup_interval: 60,
            safe_mode: false,
            dns_blocklist: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    pub listen: String,
    /// Secret for session-cookie HMAC; generated at startup when absent.
    pub session_secret: Option<String>,
    /// SHA-256 digests of accepted API keys.
    pub api_keys: Vec<String>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            listen: "127.0.0.1:8443".to_string(),
            session_secret: None,
            api_keys: Vec::new(),
            tls_cert: None,
            tls_key: None,
        }
    }
}
