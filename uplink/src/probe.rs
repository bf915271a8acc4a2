// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! Health probes: unprivileged ICMP echo and plain HTTP GET.

use async_trait::async_trait;
use config::HealthCheckConfig;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self) -> bool;
}

/// ICMP echo over a datagram socket (`net.ipv4.ping_group_range`), no raw
/// socket privilege needed.
pub struct PingProbe {
    target: IpAddr,
}

impl PingProbe {
    #[must_use]
    pub fn new(target: IpAddr) -> PingProbe {
        PingProbe { target }
    }

    fn ping_blocking(target: IpAddr) -> std::io::Result<bool> {
        let (domain, protocol) = match target {
            IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
            IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(protocol))?;
        socket.set_read_timeout(Some(PROBE_TIMEOUT))?;
        socket.connect(&SocketAddr::new(target, 0).into())?;

        let request = echo_request(target, 0x4657, 1);
        socket.send(&request)?;

        let mut buf = [std::mem::MaybeUninit::<u8>::uninit(); 512];
        let received = socket.recv(&mut buf)?;
        Ok(received >= 8)
    }
}

/// Echo request with header checksum; the kernel rewrites the identifier on
/// datagram ICMP sockets, so only type/code/payload matter.
fn echo_request(target: IpAddr, ident: u16, sequence: u16) -> Vec<u8> {
    let echo_type: u8 = match target {
        IpAddr::V4(_) => 8,
        IpAddr::V6(_) => 128,
    };
    let mut packet = vec![echo_type, 0, 0, 0];
    packet.extend_from_slice(&ident.to_be_bytes());
    packet.extend_from_slice(&sequence.to_be_bytes());
    packet.extend_from_slice(b"flywall-probe");
    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    packet
}

fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let word = match chunk {
            [a, b] => u16::from_be_bytes([*a, *b]),
            [a] => u16::from_be_bytes([*a, 0]),
            _ => 0,
        };
        sum += u32::from(word);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[async_trait]
impl Probe for PingProbe {
    async fn check(&self) -> bool {
        let target = self.target;
        let result = tokio::task::spawn_blocking(move || Self::ping_blocking(target)).await;
        match result {
            Ok(Ok(ok)) => ok,
            Ok(Err(error)) => {
                debug!(%target, %error, "ping probe failed");
                false
            }
            Err(_) => false,
        }
    }
}

/// HTTP GET returning a success status.
pub struct HttpProbe {
    url: String,
    client: reqwest::Client,
}

impl HttpProbe {
    #[must_use]
    pub fn new(url: &str) -> HttpProbe {
        HttpProbe {
            url: url.to_string(),
            client: reqwest::Client::builder()
                .timeout(PROBE_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => response.status().is_success(),
            Err(error) => {
                debug!(url = %self.url, %error, "http probe failed");
                false
            }
        }
    }
}

/// Probes for one health-check spec, ping targets then http targets.
#[must_use]
pub fn build_probes(health: &HealthCheckConfig) -> Vec<Arc<dyn Probe>> {
    let mut probes: Vec<Arc<dyn Probe>> = Vec::new();
    for target in &health.ping {
        probes.push(Arc::new(PingProbe::new(*target)));
    }
    for url in &health.http {
        probes.push(Arc::new(HttpProbe::new(url)));
    }
    probes
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn checksum_matches_known_vector() {
        // Echo request type 8, zeroed checksum field, ident 1, seq 1.
        let packet = [8u8, 0, 0, 0, 0, 1, 0, 1];
        assert_eq!(icmp_checksum(&packet), 0xf7fd);
    }

    #[test]
    fn echo_request_is_well_formed() {
        let v4 = echo_request("192.0.2.1".parse().unwrap(), 7, 3);
        assert_eq!(v4[0], 8);
        assert!(v4.len() > 8);
        // Checksum verifies to zero over the whole packet.
        assert_eq!(icmp_checksum(&v4), 0);

        let v6 = echo_request("2001:db8::1".parse().unwrap(), 7, 3);
        assert_eq!(v6[0], 128);
    }

    #[test]
    fn probe_set_matches_config() {
        let probes = build_probes(&HealthCheckConfig {
            ping: vec!["192.0.2.1".parse().unwrap()],
            http: vec!["http://192.0.2.1/health".to_string()],
            ..HealthCheckConfig::default()
        });
        assert_eq!(probes.len(), 2);
    }
}
