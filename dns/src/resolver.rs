// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! The query pipeline and the listeners.

use crate::blocklist::BlockSet;
use crate::cache::{CacheKey, DnsCache};
use crate::local::LocalZones;
use crate::upstream::UpstreamPool;
use crate::{DnsError, DnsStats, DnsStatsSnapshot};
use config::{BlockResponse, DnsConfig};
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use parking_lot::{Mutex, RwLock};
use std::io::Write;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

const BLOCK_TTL: u32 = 60;

pub struct Resolver {
    config: DnsConfig,
    local: LocalZones,
    blocklist: RwLock<BlockSet>,
    cache: DnsCache,
    pool: UpstreamPool,
    stats: DnsStats,
    query_log: Option<Mutex<std::fs::File>>,
}

/// Shared handle the supervisor, API, ipset fetcher and DHCP bridge hold.
pub type ResolverHandle = Arc<Resolver>;

impl Resolver {
    pub fn new(config: DnsConfig) -> Result<ResolverHandle, DnsError> {
        let query_log = match &config.query_log {
            Some(path) => Some(Mutex::new(
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?,
            )),
            None => None,
        };
        Ok(Arc::new(Resolver {
            local: LocalZones::from_config(&config),
            blocklist: RwLock::new(BlockSet::new(&config.allowlist)),
            cache: DnsCache::new(&config.cache),
            pool: UpstreamPool::new(config.upstreams.clone()),
            stats: DnsStats::default(),
            query_log,
            config,
        }))
    }

    #[must_use]
    pub fn stats(&self) -> DnsStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn learn_host(&self, hostname: &str, ip: IpAddr) {
        self.local.learn(hostname, ip);
    }

    pub fn forget_host(&self, hostname: &str) {
        self.local.forget(hostname);
    }

    pub fn swap_blocklist(&self, set: BlockSet) {
        info!(entries = set.len(), "blocklist swapped");
        *self.blocklist.write() = set;
    }

    #[must_use]
    pub fn blocklist_len(&self) -> usize {
        self.blocklist.read().len()
    }

    /// The full pipeline for one request message.
    pub async fn resolve_message(&self, request: &Message) -> Message {
        DnsStats::bump(&self.stats.queries);
        let Some(query) = request.queries().first().cloned() else {
            return reply_to(request, ResponseCode::FormErr);
        };
        let name = query.name().to_ascii();
        let record_type = query.query_type();
        let now = Instant::now();

        // 1. Local zones, static hosts, DHCP-learned names.
        if let Some((ip, ttl)) = self.local.lookup(&name) {
            if let Some(rdata) = rdata_for(record_type, ip) {
                DnsStats::bump(&self.stats.local_answers);
                self.log_query(&name, record_type, "local");
                return answer(request, &query, rdata, ttl);
            }
        }
        if self.local.is_authoritative(&name) {
            DnsStats::bump(&self.stats.local_answers);
            self.log_query(&name, record_type, "local-nx");
            return reply_to(request, ResponseCode::NXDomain);
        }

        // 2. Blocklists, allowlist already folded in.
        if self.blocklist.read().is_blocked(&name) {
            DnsStats::bump(&self.stats.blocked);
            self.log_query(&name, record_type, "blocked");
            return match self.config.block_response {
                BlockResponse::Nxdomain => reply_to(request, ResponseCode::NXDomain),
                BlockResponse::Zero => {
                    let zero = match record_type {
                        RecordType::AAAA => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
                        _ => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
                    };
                    match rdata_for(record_type, zero) {
                        Some(rdata) => answer(request, &query, rdata, BLOCK_TTL),
                        None => reply_to(request, ResponseCode::NXDomain),
                    }
                }
            };
        }

        // 3. Cache.
        let cache_key = CacheKey {
            name: name.clone(),
            record_type,
        };
        if let Some(mut cached) = self.cache.fetch(&cache_key, now) {
            DnsStats::bump(&self.stats.cache_hits);
            self.log_query(&name, record_type, "cache");
            cached.set_id(request.id());
            return cached;
        }

        // 4. Upstream ladder.
        match self.pool.forward(request, &self.stats).await {
            Ok(mut response) => {
                response.set_id(request.id());
                self.cache.store(cache_key, response.clone(), now);
                self.log_query(&name, record_type, "forwarded");
                response
            }
            Err(error) => {
                debug!(%error, name, "resolution failed");
                self.log_query(&name, record_type, "servfail");
                reply_to(request, ResponseCode::ServFail)
            }
        }
    }

    /// Convenience for the RPC `DnsLookup` and the ipset fetcher.
    pub async fn lookup(&self, name: &str, record_type: RecordType) -> Vec<(IpAddr, u32)> {
        let Ok(qname) = Name::from_ascii(name) else {
            return Vec::new();
        };
        let mut request = Message::new();
        request
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .set_id(rand_id());
        request.add_query(hickory_proto::op::Query::query(qname, record_type));
        let response = self.resolve_message(&request).await;
        response
            .answers()
            .iter()
            .filter_map(|record| match record.data() {
                Some(RData::A(a)) => Some((IpAddr::V4(a.0), record.ttl())),
                Some(RData::AAAA(aaaa)) => Some((IpAddr::V6(aaaa.0), record.ttl())),
                _ => None,
            })
            .collect()
    }

    fn log_query(&self, name: &str, record_type: RecordType, outcome: &str) {
        if let Some(log) = &self.query_log {
            let line = format!("{} {name} {record_type} {outcome}\n", unix_now());
            if let Err(error) = log.lock().write_all(line.as_bytes()) {
                warn!(%error, "query log write failed");
            }
        }
    }

    /// Refresh every configured blocklist. Per-list failures keep that
    /// list's previous body; the swap happens only after the rebuild.
    pub async fn refresh_blocklists(
        &self,
        client: &reqwest::Client,
        previous: &mut std::collections::HashMap<String, String>,
    ) {
        let mut set = BlockSet::new(&self.config.allowlist);
        for list in &self.config.blocklists {
            let body = match client
                .get(&list.url)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
            {
                Ok(response) => match response.text().await {
                    Ok(body) => {
                        previous.insert(list.url.clone(), body.clone());
                        body
                    }
                    Err(_) => previous.get(&list.url).cloned().unwrap_or_default(),
                },
                Err(error) => {
                    warn!(url = %list.url, %error, "blocklist fetch failed, reusing previous");
                    previous.get(&list.url).cloned().unwrap_or_default()
                }
            };
            let added = set.ingest(&body, list.format);
            debug!(url = %list.url, added, "blocklist ingested");
        }
        self.swap_blocklist(set);
    }

    /// Serve UDP and TCP on every configured listen address until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), DnsError> {
        for listen in self.config.listen.clone() {
            let udp = tokio::net::UdpSocket::bind(listen).await?;
            tokio::spawn(Arc::clone(&self).serve_udp(udp, shutdown.clone()));
            let tcp = tokio::net::TcpListener::bind(listen).await?;
            tokio::spawn(Arc::clone(&self).serve_tcp(tcp, shutdown.clone()));
            info!(%listen, "dns listening");
        }

        // Blocklist refresh loop lives here with the listeners.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        let mut bodies = std::collections::HashMap::new();
        if !self.config.blocklists.is_empty() {
            self.refresh_blocklists(&client, &mut bodies).await;
        }
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.blocklist_refresh.max(60)));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.config.blocklists.is_empty() {
                        self.refresh_blocklists(&client, &mut bodies).await;
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

    async fn serve_udp(self: Arc<Self>, socket: tokio::net::UdpSocket, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; 4096];
        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => {
                    let Ok((len, peer)) = received else { continue };
                    let Ok(request) = Message::from_vec(&buf[..len]) else { continue };
                    let response = self.resolve_message(&request).await;
                    if let Ok(raw) = response.to_vec() {
                        let _ = socket.send_to(&raw, peer).await;
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

    async fn serve_tcp(self: Arc<Self>, listener: tokio::net::TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let Ok((mut stream, _peer)) = accepted else { continue };
                    let resolver = Arc::clone(&self);
                    tokio::spawn(async move {
                        let mut len_buf = [0u8; 2];
                        if stream.read_exact(&mut len_buf).await.is_err() {
                            return;
                        }
                        let len = usize::from(u16::from_be_bytes(len_buf));
                        let mut raw = vec![0u8; len];
                        if stream.read_exact(&mut raw).await.is_err() {
                            return;
                        }
                        let Ok(request) = Message::from_vec(&raw) else { return };
                        let response = resolver.resolve_message(&request).await;
                        if let Ok(raw) = response.to_vec() {
                            let len = u16::try_from(raw.len()).unwrap_or(0);
                            let _ = stream.write_all(&len.to_be_bytes()).await;
                            let _ = stream.write_all(&raw).await;
                        }
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

/// The fetcher resolves domain-sourced ipsets through the same pipeline.
#[async_trait::async_trait]
impl firewall::fetcher::DomainResolver for Resolver {
    async fn resolve(&self, domain: &str) -> Option<(Vec<IpAddr>, Duration)> {
        let answers = self.lookup(domain, RecordType::A).await;
        if answers.is_empty() {
            return None;
        }
        let min_ttl = answers.iter().map(|(_, ttl)| *ttl).min().unwrap_or(60);
        Some((
            answers.into_iter().map(|(ip, _)| ip).collect(),
            Duration::from_secs(u64::from(min_ttl)),
        ))
    }
}

fn rand_id() -> u16 {
    rand::random()
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn reply_to(request: &Message, code: ResponseCode) -> Message {
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(code);
    for query in request.queries() {
        response.add_query(query.clone());
    }
    response
}

fn rdata_for(record_type: RecordType, ip: IpAddr) -> Option<RData> {
    match (record_type, ip) {
        (RecordType::A, IpAddr::V4(v4)) => Some(RData::A(A(v4))),
        (RecordType::AAAA, IpAddr::V6(v6)) => Some(RData::AAAA(AAAA(v6))),
        _ => None,
    }
}

fn answer(request: &Message, query: &hickory_proto::op::Query, rdata: RData, ttl: u32) -> Message {
    let mut response = reply_to(request, ResponseCode::NoError);
    response.add_answer(Record::from_rdata(query.name().clone(), ttl, rdata));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn resolver(config: DnsConfig) -> ResolverHandle {
        Resolver::new(config).unwrap()
    }

    fn query(name: &str, record_type: RecordType) -> Message {
        let mut request = Message::new();
        request
            .set_id(0x7777)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true);
        request.add_query(hickory_proto::op::Query::query(
            Name::from_ascii(name).unwrap(),
            record_type,
        ));
        request
    }

    #[tokio::test]
    async fn local_zone_answers_and_nxdomains() {
        let r = resolver(DnsConfig {
            local_zones: vec![config::LocalZoneConfig {
                domain: "lan".to_string(),
                hosts: vec![config::StaticHostConfig {
                    name: "router".to_string(),
                    ip: "192.168.1.1".parse().unwrap(),
                }],
            }],
            ..DnsConfig::default()
        });

        let response = r.resolve_message(&query("router.lan.", RecordType::A)).await;
        assert_eq!(response.answers().len(), 1);
        assert_eq!(response.id(), 0x7777);

        let missing = r.resolve_message(&query("ghost.lan.", RecordType::A)).await;
        assert_eq!(missing.response_code(), ResponseCode::NXDomain);
        assert_eq!(r.stats().local_answers, 2);
    }

    #[tokio::test]
    async fn blocked_names_zero_or_nx() {
        let r = resolver(DnsConfig::default());
        let mut set = BlockSet::default();
        set.insert("ads.example.com");
        r.swap_blocklist(set);

        let response = r
            .resolve_message(&query("tracker.ads.example.com.", RecordType::A))
            .await;
        match response.answers()[0].data() {
            Some(RData::A(a)) => assert!(a.0.is_unspecified()),
            other => panic!("expected zero answer, got {other:?}"),
        }
        assert_eq!(r.stats().blocked, 1);

        let r = resolver(DnsConfig {
            block_response: BlockResponse::Nxdomain,
            ..DnsConfig::default()
        });
        let mut set = BlockSet::default();
        set.insert("ads.example.com");
        r.swap_blocklist(set);
        let response = r
            .resolve_message(&query("ads.example.com.", RecordType::A))
            .await;
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
    }

    #[tokio::test]
    async fn dhcp_learned_hosts_resolve_until_forgotten() {
        let r = resolver(DnsConfig::default());
        r.learn_host("printer", "192.168.1.42".parse().unwrap());
        let response = r.resolve_message(&query("printer.", RecordType::A)).await;
        assert_eq!(response.answers().len(), 1);

        r.forget_host("printer");
        // No upstreams configured: unresolvable now.
        let response = r.resolve_message(&query("printer.", RecordType::A)).await;
        assert_eq!(response.response_code(), ResponseCode::ServFail);
    }

    #[tokio::test]
    async fn no_upstream_is_servfail_not_panic() {
        let r = resolver(DnsConfig::default());
        let response = r
            .resolve_message(&query("example.com.", RecordType::A))
            .await;
        assert_eq!(response.response_code(), ResponseCode::ServFail);
    }
}
