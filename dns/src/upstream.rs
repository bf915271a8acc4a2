// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! The upstream ladder: ordered transports with per-upstream health.

use crate::{DnsError, DnsStats};
use config::{DnsUpstreamConfig, UpstreamKind};
use hickory_proto::op::Message;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

const QUERY_TIMEOUT: Duration = Duration::from_secs(2);
const UNHEALTHY_AFTER: u32 = 3;
const RETRY_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct Health {
    consecutive_failures: u32,
    down_since: Option<Instant>,
}

pub struct Upstream {
    pub config: DnsUpstreamConfig,
    health: Mutex<Health>,
}

impl Upstream {
    #[must_use]
    pub fn new(config: DnsUpstreamConfig) -> Upstream {
        Upstream {
            config,
            health: Mutex::new(Health {
                consecutive_failures: 0,
                down_since: None,
            }),
        }
    }

    /// Default port for the transport when the address names none.
    fn socket_addr(&self) -> Option<SocketAddr> {
        let address = &self.config.address;
        if let Ok(parsed) = address.parse() {
            return Some(parsed);
        }
        let port = match self.config.kind {
            UpstreamKind::Dot => 853,
            _ => 53,
        };
        format!("{address}:{port}").parse().ok()
    }

    fn usable(&self, now: Instant) -> bool {
        let health = self.health.lock();
        match health.down_since {
            None => true,
            Some(since) => now.saturating_duration_since(since) >= RETRY_COOLDOWN,
        }
    }

    fn record(&self, ok: bool, now: Instant) {
        let mut health = self.health.lock();
        if ok {
            health.consecutive_failures = 0;
            health.down_since = None;
        } else {
            health.consecutive_failures += 1;
            if health.consecutive_failures >= UNHEALTHY_AFTER && health.down_since.is_none() {
                warn!(upstream = %self.config.address, "upstream marked unhealthy");
                health.down_since = Some(now);
            }
        }
    }

    async fn query_udp(&self, raw: &[u8]) -> Result<Vec<u8>, DnsError> {
        let addr = self.socket_addr().ok_or(DnsError::NoUpstream)?;
        let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;
        socket.send(raw).await?;
        let mut buf = vec![0u8; 4096];
        let len = socket.recv(&mut buf).await?;
        buf.truncate(len);
        Ok(buf)
    }

    async fn query_tcp(&self, raw: &[u8]) -> Result<Vec<u8>, DnsError> {
        let addr = self.socket_addr().ok_or(DnsError::NoUpstream)?;
        let stream = tokio::net::TcpStream::connect(addr).await?;
        framed_exchange(stream, raw).await
    }

    async fn query_dot(&self, raw: &[u8]) -> Result<Vec<u8>, DnsError> {
        let addr = self.socket_addr().ok_or(DnsError::NoUpstream)?;
        let server_name = self
            .config
            .tls_name
            .clone()
            .unwrap_or_else(|| addr.ip().to_string());
        let server_name = rustls::pki_types::ServerName::try_from(server_name)
            .map_err(|_| DnsError::NoUpstream)?;

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));

        let tcp = tokio::net::TcpStream::connect(addr).await?;
        let stream = connector.connect(server_name, tcp).await?;
        framed_exchange(stream, raw).await
    }

    async fn query_doh(&self, raw: &[u8]) -> Result<Vec<u8>, DnsError> {
        let client = reqwest::Client::builder()
            .timeout(QUERY_TIMEOUT)
            .build()
            .map_err(|_| DnsError::NoUpstream)?;
        let response = client
            .post(&self.config.address)
            .header("content-type", "application/dns-message")
            .header("accept", "application/dns-message")
            .body(raw.to_vec())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|error| {
                debug!(upstream = %self.config.address, %error, "doh error");
                DnsError::NoUpstream
            })?;
        let body = response.bytes().await.map_err(|_| DnsError::NoUpstream)?;
        Ok(body.to_vec())
    }

    pub async fn query(&self, raw: &[u8]) -> Result<Vec<u8>, DnsError> {
        let fut = async {
            match self.config.kind {
                UpstreamKind::Udp => self.query_udp(raw).await,
                UpstreamKind::Tcp => self.query_tcp(raw).await,
                UpstreamKind::Dot => self.query_dot(raw).await,
                UpstreamKind::Doh => self.query_doh(raw).await,
            }
        };
        tokio::time::timeout(QUERY_TIMEOUT, fut)
            .await
            .map_err(|_| DnsError::Timeout)?
    }
}

/// 2-byte length framing shared by TCP and DoT.
async fn framed_exchange<S>(mut stream: S, raw: &[u8]) -> Result<Vec<u8>, DnsError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let len = u16::try_from(raw.len()).map_err(|_| DnsError::NoUpstream)?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(raw).await?;
    stream.flush().await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let response_len = usize::from(u16::from_be_bytes(len_buf));
    let mut response = vec![0u8; response_len];
    stream.read_exact(&mut response).await?;
    Ok(response)
}

/// Upstreams in priority order; the first healthy one that answers wins.
pub struct UpstreamPool {
    upstreams: Vec<Upstream>,
}

impl UpstreamPool {
    #[must_use]
    pub fn new(mut configs: Vec<DnsUpstreamConfig>) -> UpstreamPool {
        configs.sort_by_key(|c| c.priority);
        UpstreamPool {
            upstreams: configs.into_iter().map(Upstream::new).collect(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }

    /// Walk the ladder. Unhealthy upstreams are skipped until their cooldown
    /// lapses; total failure is `NoUpstream`.
    pub async fn forward(&self, query: &Message, stats: &DnsStats) -> Result<Message, DnsError> {
        let raw = query.to_vec()?;
        let now = Instant::now();
        // Skip unhealthy first; if everything is unhealthy, try them anyway
        // rather than failing a client query outright.
        for pass in 0..2 {
            for upstream in &self.upstreams {
                if pass == 0 && !upstream.usable(now) {
                    continue;
                }
                match upstream.query(&raw).await {
                    Ok(body) => {
                        if let Ok(message) = Message::from_vec(&body) {
                            upstream.record(true, now);
                            return Ok(message);
                        }
                        upstream.record(false, now);
                        DnsStats::bump(&stats.upstream_errors);
                    }
                    Err(error) => {
                        debug!(upstream = %upstream.config.address, %error, "upstream failed");
                        upstream.record(false, now);
                        DnsStats::bump(&stats.upstream_errors);
                    }
                }
            }
        }
        Err(DnsError::NoUpstream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream() -> Upstream {
        Upstream::new(DnsUpstreamConfig {
            address: "192.0.2.1".to_string(),
            kind: UpstreamKind::Udp,
            priority: 10,
            tls_name: None,
        })
    }

    #[test]
    fn default_ports_by_transport() {
        let udp = upstream();
        assert_eq!(udp.socket_addr().unwrap().port(), 53);

        let dot = Upstream::new(DnsUpstreamConfig {
            address: "192.0.2.2".to_string(),
            kind: UpstreamKind::Dot,
            priority: 10,
            tls_name: Some("dns.example".to_string()),
        });
        assert_eq!(dot.socket_addr().unwrap().port(), 853);

        let explicit = Upstream::new(DnsUpstreamConfig {
            address: "192.0.2.3:5353".to_string(),
            kind: UpstreamKind::Udp,
            priority: 10,
            tls_name: None,
        });
        assert_eq!(explicit.socket_addr().unwrap().port(), 5353);
    }

    #[test]
    fn health_flips_after_consecutive_failures() {
        let upstream = upstream();
        let t0 = Instant::now();
        assert!(upstream.usable(t0));
        upstream.record(false, t0);
        upstream.record(false, t0);
        assert!(upstream.usable(t0), "two failures are not enough");
        upstream.record(false, t0);
        assert!(!upstream.usable(t0));
        // Cooldown elapses, it becomes probeable again.
        assert!(upstream.usable(t0 + RETRY_COOLDOWN));
        // A success resets entirely.
        upstream.record(true, t0);
        assert!(upstream.usable(t0));
    }
}
