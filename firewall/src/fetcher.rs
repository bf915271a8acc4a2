// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! Background population of dynamic sets from URL, file and DNS-domain
//! sources. External fetch failures are never fatal: the set keeps its
//! previous membership (or the declared static entries) and the fetcher
//! retries with exponential backoff.

use crate::{RulesetBackend, BLOCKED_SET};
use async_trait::async_trait;
use config::IpSetConfig;
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use store::{Bucket, Store};
use tokio::sync::watch;
use tracing::{debug, info, warn};

const BACKOFF_BASE: Duration = Duration::from_secs(30);
const BACKOFF_CAP: Duration = Duration::from_secs(3_600);

/// Resolver hook for domain-sourced sets; the DNS service implements it so
/// the fetcher follows the same upstream path as clients.
#[async_trait]
pub trait DomainResolver: Send + Sync {
    /// Resolve a name to addresses plus the smallest record TTL.
    async fn resolve(&self, domain: &str) -> Option<(Vec<IpAddr>, Duration)>;
}

pub struct SetFetcher {
    client: reqwest::Client,
    backend: Arc<dyn RulesetBackend>,
    store: Option<Arc<Store>>,
    resolver: Option<Arc<dyn DomainResolver>>,
}

impl SetFetcher {
    #[must_use]
    pub fn new(
        backend: Arc<dyn RulesetBackend>,
        store: Option<Arc<Store>>,
        resolver: Option<Arc<dyn DomainResolver>>,
    ) -> Self {
        SetFetcher {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            backend,
            store,
            resolver,
        }
    }

    /// Spawn one refresh task per sourced set. Tasks end when `shutdown`
    /// flips to true.
    pub fn spawn_all(
        self: &Arc<Self>,
        sets: &[IpSetConfig],
        geoip_url: Option<String>,
        countries: Vec<String>,
        shutdown: watch::Receiver<bool>,
    ) {
        for set in sets {
            if set.url.is_some() || set.file.is_some() || !set.domains.is_empty() {
                let fetcher = Arc::clone(self);
                let set = set.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { fetcher.run_set(set, shutdown).await });
            }
        }
        if let Some(template) = geoip_url {
            for cc in countries {
                let fetcher = Arc::clone(self);
                let shutdown = shutdown.clone();
                let set = IpSetConfig {
                    name: format!("country_{cc}"),
                    url: Some(template.replace("{cc}", &cc)),
                    refresh_interval: 86_400,
                    ..IpSetConfig::default()
                };
                tokio::spawn(async move { fetcher.run_set(set, shutdown).await });
            }
        }
    }

    async fn run_set(&self, set: IpSetConfig, mut shutdown: watch::Receiver<bool>) {
        // Last good membership outlives restarts through the ipsets bucket.
        if let Some(persisted) = self.load_persisted(&set.name) {
            if !persisted.is_empty() {
                let _ = self.backend.replace_set(&set.name, &persisted).await;
                debug!(set = %set.name, entries = persisted.len(), "restored persisted members");
            }
        }

        let mut failures: u32 = 0;
        loop {
            let delay = match self.refresh(&set).await {
                Ok(count) => {
                    if failures > 0 {
                        info!(set = %set.name, "source recovered");
                    }
                    failures = 0;
                    debug!(set = %set.name, entries = count, "set refreshed");
                    Duration::from_secs(set.refresh_interval)
                }
                Err(reason) => {
                    failures = failures.saturating_add(1);
                    let backoff = backoff_delay(failures);
                    warn!(
                        set = %set.name,
                        failures,
                        retry_in = ?backoff,
                        "set refresh failed, keeping previous entries: {reason}"
                    );
                    backoff
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn refresh(&self, set: &IpSetConfig) -> Result<usize, String> {
        let mut members: Vec<IpNet> = set.entries.clone();

        if let Some(url) = &set.url {
            let body = self
                .client
                .get(url)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|e| e.to_string())?
                .text()
                .await
                .map_err(|e| e.to_string())?;
            members.extend(parse_members(&body));
        }
        if let Some(path) = &set.file {
            let body = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| e.to_string())?;
            members.extend(parse_members(&body));
        }
        if !set.domains.is_empty() {
            let Some(resolver) = &self.resolver else {
                return Err("no resolver wired for domain-sourced set".to_string());
            };
            for domain in &set.domains {
                if let Some((addrs, _ttl)) = resolver.resolve(domain).await {
                    members.extend(addrs.into_iter().map(IpNet::from));
                }
            }
        }

        members.sort();
        members.dedup();
        self.backend
            .replace_set(&set.name, &members)
            .await
            .map_err(|e| e.to_string())?;
        self.persist(&set.name, &members);
        Ok(members.len())
    }

    fn load_persisted(&self, set: &str) -> Option<Vec<IpNet>> {
        let store = self.store.as_ref()?;
        store.get_json::<Vec<IpNet>>(Bucket::IpSets, set).ok()?
    }

    fn persist(&self, set: &str, members: &[IpNet]) {
        let Some(store) = &self.store else {
            return;
        };
        let mut txn = store.begin();
        if txn.put_json(Bucket::IpSets, set, &members.to_vec()).is_ok() {
            if let Err(error) = txn.commit() {
                warn!(set, %error, "failed to persist set members");
            }
        }
    }
}

fn backoff_delay(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(7);
    BACKOFF_BASE
        .saturating_mul(1 << shift)
        .min(BACKOFF_CAP)
}

/// One entry per line; `#` and `;` comments, bare addresses become host
/// prefixes.
fn parse_members(body: &str) -> Vec<IpNet> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| {
            let token = line.split_whitespace().next()?;
            if let Ok(net) = token.parse::<IpNet>() {
                return Some(net);
            }
            token.parse::<IpAddr>().ok().map(IpNet::from)
        })
        .collect()
}

/// Members of `blocked_ips` the API layer asks about.
pub async fn is_blocked(backend: &crate::MemoryBackend, addr: IpAddr) -> bool {
    backend
        .set_members(BLOCKED_SET)
        .iter()
        .any(|net| net.contains(&addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_mixed_feed() {
        let feed = "
# bogons feed
192.0.2.0/24
198.51.100.7
; trailing comment block
2001:db8::/32   extra-junk-column
not-an-address
";
        let members = parse_members(feed);
        assert_eq!(members.len(), 3);
        assert_eq!(members[1].to_string(), "198.51.100.7/32");
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(30));
        assert_eq!(backoff_delay(2), Duration::from_secs(60));
        assert_eq!(backoff_delay(5), Duration::from_secs(480));
        assert_eq!(backoff_delay(50), BACKOFF_CAP);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_members() {
        let backend = Arc::new(crate::MemoryBackend::new());
        let ruleset = crate::Ruleset {
            sets: vec![crate::SetDef {
                name: "feed".to_string(),
                entries: std::collections::BTreeSet::new(),
                dynamic: true,
                timeout_secs: None,
            }],
            ..crate::Ruleset::default()
        };
        backend.apply(&ruleset).await.unwrap();

        let fetcher = SetFetcher::new(backend.clone(), None, None);
        let good = IpSetConfig {
            name: "feed".to_string(),
            entries: vec!["203.0.113.0/24".parse().unwrap()],
            ..IpSetConfig::default()
        };
        fetcher.refresh(&good).await.unwrap();
        assert_eq!(backend.set_members("feed").len(), 1);

        // A bad file source fails; membership is untouched.
        let bad = IpSetConfig {
            name: "feed".to_string(),
            file: Some("/nonexistent/feed.txt".to_string()),
            ..IpSetConfig::default()
        };
        assert!(fetcher.refresh(&bad).await.is_err());
        assert_eq!(backend.set_members("feed").len(), 1);
    }
}
