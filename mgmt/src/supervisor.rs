// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! The supervisor singleton: state, service lifecycle, and the operations
//! behind every RPC method. The staged-apply orchestration itself lives in
//! `apply.rs`.

use crate::revision::ConfigDb;
use crate::MgmtError;
use base64::Engine as _;
use config::{Model, ValidModel};
use dhcp::HostEvent;
use firewall::{MemoryBackend, NftBackend, RulesetBackend};
use flow::{EngineConfig, FlowEngine, NullFastPath, PatternSet};
use interface_manager::LinkReconciler;
use parking_lot::Mutex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use store::{Bucket, Store};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};
use uplink::UplinkManager;
use wireguard::{FakeWg, KernelWg, WgReconciler};

/// Change events broadcast to RPC subscribers (and fanned out over the
/// API's websocket).
#[derive(Clone, Debug, serde::Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    ConfigStaged { revision: u64 },
    ConfigApplied { revision: u64 },
    ConfigFailed { revision: u64, reason: String },
    LeaseChange,
    BlockedIp { ip: IpAddr, reason: String },
    UplinkChange { group: String, interface: String, state: String },
    ScanResult { target: String, alive: bool },
    DeviceAnomaly { mac: String, z_score: f64 },
}

impl Event {
    /// Topic names match the websocket multiplexing contract.
    #[must_use]
    pub fn topic(&self) -> &'static str {
        match self {
            Event::ConfigStaged { .. } | Event::ConfigApplied { .. } | Event::ConfigFailed { .. } => {
                "config"
            }
            Event::LeaseChange => "leases",
            Event::BlockedIp { .. } => "health",
            Event::UplinkChange { .. } => "health",
            Event::ScanResult { .. } => "learning:scan",
            Event::DeviceAnomaly { .. } => "learning:anomaly",
        }
    }
}

pub struct SupervisorOptions {
    pub state_dir: PathBuf,
    pub run_dir: PathBuf,
    pub socket_path: PathBuf,
    pub config_path: Option<PathBuf>,
    /// Drive the real kernel (nft, netlink, wireguard). Off in tests.
    pub kernel: bool,
    /// Spawn service listeners (dhcp/dns/api sockets). Off in tests.
    pub services: bool,
    pub shutdown_grace: std::time::Duration,
}

impl SupervisorOptions {
    #[must_use]
    pub fn headless(state_dir: PathBuf) -> SupervisorOptions {
        SupervisorOptions {
            run_dir: state_dir.clone(),
            socket_path: state_dir.join("ctl.sock"),
            config_path: None,
            kernel: false,
            services: false,
            shutdown_grace: std::time::Duration::from_secs(5),
            state_dir,
        }
    }
}

pub struct Supervisor {
    pub(crate) options: SupervisorOptions,
    pub(crate) store: Arc<Store>,
    pub(crate) db: Mutex<ConfigDb>,
    /// The kernel packet filter; only this crate's apply path writes it.
    pub(crate) kernel: Arc<dyn RulesetBackend>,
    /// In-process mirror the flow engine classifies against.
    pub(crate) view: Arc<MemoryBackend>,
    pub(crate) links: Option<LinkReconciler>,
    pub(crate) wg: WgReconciler,
    pub(crate) engine: Mutex<Option<Arc<FlowEngine>>>,
    pub(crate) resolver: Mutex<Option<dns::ResolverHandle>>,
    pub(crate) uplinks: Mutex<Option<Arc<UplinkManager>>>,
    pub(crate) ha: Mutex<Option<Arc<ha::HaNode>>>,
    pub(crate) events: broadcast::Sender<Event>,
    pub(crate) apply_lock: tokio::sync::Mutex<()>,
    /// Root shutdown: flips once, on SIGTERM.
    pub(crate) root_shutdown: watch::Sender<bool>,
    /// Per-revision service shutdown; replaced on every apply.
    pub(crate) service_stop: Mutex<Option<watch::Sender<bool>>>,
}

impl Supervisor {
    pub fn new(options: SupervisorOptions) -> Result<Arc<Supervisor>, MgmtError> {
        std::fs::create_dir_all(&options.state_dir)?;
        std::fs::create_dir_all(&options.run_dir)?;
        let store = Arc::new(Store::open(&options.state_dir.join("state.db"))?);
        let db = ConfigDb::load(Arc::clone(&store))?;

        let kernel: Arc<dyn RulesetBackend> = if options.kernel {
            Arc::new(NftBackend::new())
        } else {
            Arc::new(MemoryBackend::new())
        };
        let links = if options.kernel {
            Some(LinkReconciler::connect()?)
        } else {
            None
        };
        let wg = if options.kernel {
            WgReconciler::new(Arc::new(KernelWg))
        } else {
            WgReconciler::new(Arc::new(FakeWg::new()))
        };

        let (events, _) = broadcast::channel(256);
        let (root_shutdown, _) = watch::channel(false);
        Ok(Arc::new(Supervisor {
            store,
            db: Mutex::new(db),
            kernel,
            view: Arc::new(MemoryBackend::new()),
            links,
            wg,
            engine: Mutex::new(None),
            resolver: Mutex::new(None),
            uplinks: Mutex::new(None),
            ha: Mutex::new(None),
            events,
            apply_lock: tokio::sync::Mutex::new(()),
            root_shutdown,
            service_stop: Mutex::new(None),
            options,
        }))
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.root_shutdown.subscribe()
    }

    pub(crate) fn broadcast(&self, event: Event) {
        let _ = self.events.send(event);
    }

    /// Validate and stage a model. Invalid models are rejected here, so a
    /// bad reload can never supersede the running configuration.
    pub fn stage_model(&self, model: Model, source: &str) -> Result<u64, MgmtError> {
        // Validation result is discarded: apply re-validates the stored
        // model so the staged bytes stay the source of truth.
        config::validate(model.clone())?;
        let id = self.db.lock().stage(model, source, unix_now())?;
        self.broadcast(Event::ConfigStaged { revision: id });
        Ok(id)
    }

    pub fn discard_staged(&self) -> Result<bool, MgmtError> {
        self.db.lock().discard_staged()
    }

    #[must_use]
    pub fn diff(&self) -> Value {
        self.db.lock().diff()
    }

    /// The applied model's `api` section, for the API server bring-up.
    #[must_use]
    pub fn applied_api_config(&self) -> config::ApiConfig {
        self.db
            .lock()
            .applied()
            .map(|r| r.model.api.clone())
            .unwrap_or_default()
    }

    /// The fail2ban path and any other ban source. Kernel and view both
    /// learn the address; an audit entry records why.
    pub async fn add_blocked_ip(&self, ip: IpAddr, reason: &str) -> Result<(), MgmtError> {
        self.kernel.add_set_member(firewall::BLOCKED_SET, ip).await?;
        let _ = self.view.add_set_member(firewall::BLOCKED_SET, ip).await;
        let mut txn = self.store.begin();
        txn.put_json(
            Bucket::Audit,
            &format!("ban/{}/{ip}", unix_now()),
            &json!({ "ip": ip, "reason": reason }),
        )?;
        txn.commit()?;
        info!(%ip, reason, "address banned");
        self.broadcast(Event::BlockedIp {
            ip,
            reason: reason.to_string(),
        });
        Ok(())
    }

    pub fn leases(&self) -> Result<Vec<dhcp::Lease>, MgmtError> {
        Ok(self
            .store
            .scan_json::<dhcp::Lease>(Bucket::DhcpLeases)?
            .into_iter()
            .map(|(_, lease)| lease)
            .collect())
    }

    #[must_use]
    pub fn flows(&self) -> Vec<flow::StoredFlow> {
        self.engine
            .lock()
            .as_ref()
            .map(|engine| engine.flows())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn uplink_status(&self) -> Value {
        match self.uplinks.lock().as_ref() {
            Some(manager) => serde_json::to_value(manager.status()).unwrap_or(Value::Null),
            None => Value::Array(Vec::new()),
        }
    }

    pub fn toggle_uplink(&self, group: &str, interface: &str, enabled: bool) -> bool {
        self.uplinks
            .lock()
            .as_ref()
            .is_some_and(|manager| manager.toggle(group, interface, enabled))
    }

    pub async fn test_uplinks(&self) -> Value {
        let manager = self.uplinks.lock().as_ref().map(Arc::clone);
        if let Some(manager) = manager {
            manager.check_round().await;
            serde_json::to_value(manager.status()).unwrap_or(Value::Null)
        } else {
            Value::Array(Vec::new())
        }
    }

    pub async fn dns_lookup(&self, name: &str) -> Value {
        let resolver = self.resolver.lock().as_ref().map(Arc::clone);
        match resolver {
            Some(resolver) => {
                let answers = resolver
                    .lookup(name, hickory_proto::rr::RecordType::A)
                    .await;
                json!({
                    "name": name,
                    "answers": answers
                        .iter()
                        .map(|(ip, ttl)| json!({ "ip": ip, "ttl": ttl }))
                        .collect::<Vec<_>>(),
                })
            }
            None => json!({ "name": name, "answers": [] }),
        }
    }

    #[must_use]
    pub fn dns_stats(&self) -> Value {
        match self.resolver.lock().as_ref() {
            Some(resolver) => serde_json::to_value(resolver.stats()).unwrap_or(Value::Null),
            None => Value::Null,
        }
    }

    /// Tunnel and peer status straight from the kernel snapshots.
    pub async fn vpn_status(&self) -> Value {
        let backend = self.wg.backend();
        tokio::task::spawn_blocking(move || {
            let mut tunnels = Vec::new();
            if let Ok(names) = backend.list() {
                for name in names {
                    if let Ok(Some(snapshot)) = backend.get(&name) {
                        let peers: Vec<Value> = snapshot
                            .peers
                            .iter()
                            .map(|peer| {
                                json!({
                                    "public_key": peer.public_key,
                                    "endpoint": peer.endpoint,
                                    "last_handshake_ago": peer
                                        .last_handshake
                                        .and_then(|t| t.elapsed().ok())
                                        .map(|d| d.as_secs()),
                                    "rx_bytes": peer.rx_bytes,
                                    "tx_bytes": peer.tx_bytes,
                                })
                            })
                            .collect();
                        tunnels.push(json!({
                            "name": snapshot.name,
                            "listen_port": snapshot.listen_port,
                            "peers": peers,
                        }));
                    }
                }
            }
            Value::Array(tunnels)
        })
        .await
        .unwrap_or(Value::Null)
    }

    #[must_use]
    pub fn status(&self) -> Value {
        let db = self.db.lock();
        json!({
            "applied_revision": db.applied().map(|r| r.id),
            "staged_revision": db.staged().map(|r| r.id),
            "flows": self.engine.lock().as_ref().map(|e| e.flow_count()).unwrap_or(0),
            "ha_role": self.ha.lock().as_ref().map(|n| format!("{:?}", n.role()).to_lowercase()),
            "vip_held": self.ha.lock().as_ref().map(|n| n.holding_vip()),
        })
    }

    /// Ping sweep over a CIDR; results stream out as `ScanResult` events.
    pub fn start_scan(self: &Arc<Self>, cidr: ipnet::IpNet) -> usize {
        let hosts: Vec<IpAddr> = cidr.hosts().take(1024).collect();
        let count = hosts.len();
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            for host in hosts {
                let probe = uplink::PingProbe::new(host);
                use uplink::Probe as _;
                let alive = probe.check().await;
                supervisor.broadcast(Event::ScanResult {
                    target: host.to_string(),
                    alive,
                });
            }
        });
        count
    }

    /// The device view: every lease plus any operator-assigned identity.
    pub fn devices(&self) -> Result<Vec<Value>, MgmtError> {
        let mut devices = Vec::new();
        for lease in self.leases()? {
            let mac = lease.mac.to_string();
            let meta: Option<Value> = self.store.get_json(Bucket::Devices, &mac)?;
            devices.push(json!({
                "mac": mac,
                "ip": lease.ip,
                "hostname": lease.hostname,
                "identity": meta.as_ref().and_then(|m| m.get("identity")).cloned(),
                "linked_to": meta.as_ref().and_then(|m| m.get("linked_to")).cloned(),
            }));
        }
        Ok(devices)
    }

    /// Operator-assigned identity (friendly name) for a device.
    pub fn set_device_identity(&self, mac: &str, identity: &str) -> Result<(), MgmtError> {
        self.update_device(mac, "identity", json!(identity))
    }

    /// Link two observed devices as one (a laptop's wired and wireless
    /// faces, typically).
    pub fn link_device(&self, mac: &str, peer_mac: &str) -> Result<(), MgmtError> {
        self.update_device(mac, "linked_to", json!(peer_mac))
    }

    fn update_device(&self, mac: &str, field: &str, value: Value) -> Result<(), MgmtError> {
        let mut meta: Value = self
            .store
            .get_json(Bucket::Devices, mac)?
            .unwrap_or_else(|| json!({}));
        if let Some(object) = meta.as_object_mut() {
            object.insert(field.to_string(), value);
        }
        let mut txn = self.store.begin();
        txn.put_json(Bucket::Devices, mac, &meta)?;
        txn.commit()?;
        Ok(())
    }

    /// Offline credential maintenance, shared by the CLI subcommand.
    pub fn reset_password(&self, user: &str, password: &str) -> Result<(), MgmtError> {
        let digest = format!("{:x}", Sha256::digest(password.as_bytes()));
        let mut txn = self.store.begin();
        txn.put_json(Bucket::Users, user, &json!({ "password_sha256": digest }))?;
        txn.commit()?;
        info!(user, "password reset");
        Ok(())
    }

    pub fn verify_user(&self, user: &str, password: &str) -> Result<bool, MgmtError> {
        let record: Option<Value> = self.store.get_json(Bucket::Users, user)?;
        let Some(record) = record else {
            return Ok(false);
        };
        let digest = format!("{:x}", Sha256::digest(password.as_bytes()));
        Ok(record["password_sha256"] == Value::String(digest))
    }

    /// Stage a binary image for self-upgrade; the digest gates the write.
    pub fn stage_binary(&self, bytes_b64: &str, sha256: &str) -> Result<PathBuf, MgmtError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(bytes_b64)
            .map_err(|_| MgmtError::DigestMismatch)?;
        let digest = format!("{:x}", Sha256::digest(&bytes));
        if digest != sha256.to_lowercase() {
            return Err(MgmtError::DigestMismatch);
        }
        let path = self.options.run_dir.join(format!("staged-{sha256}.bin"));
        std::fs::write(&path, &bytes)?;
        info!(path = %path.display(), "binary staged");
        Ok(path)
    }

    /// Finalize an upgrade: atomically swap the staged binary over the
    /// running image. The caller restarts the service afterwards.
    pub fn upgrade(&self, sha256: &str) -> Result<PathBuf, MgmtError> {
        let staged = self.options.run_dir.join(format!("staged-{sha256}.bin"));
        let bytes = std::fs::read(&staged)?;
        let digest = format!("{:x}", Sha256::digest(&bytes));
        if digest != sha256.to_lowercase() {
            return Err(MgmtError::DigestMismatch);
        }
        let target = std::env::current_exe()?;
        let staging = target.with_extension("new");
        std::fs::write(&staging, &bytes)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o755))?;
        }
        std::fs::rename(&staging, &target)?;
        info!(target = %target.display(), "binary upgraded in place");
        Ok(target)
    }

    pub fn reboot(&self, force: bool) -> Result<(), MgmtError> {
        warn!(force, "system reboot requested");
        if !force {
            // Graceful path: flip the root shutdown first so reconcilers
            // drain, then the service manager restarts us into a reboot.
            let _ = self.root_shutdown.send(true);
        }
        nix::sys::reboot::reboot(nix::sys::reboot::RebootMode::RB_AUTOBOOT)
            .map_err(|e| MgmtError::Io(std::io::Error::from(e)))?;
        Ok(())
    }

    /// SIGHUP: re-read the config file and run the same staged apply. A
    /// file that fails validation leaves the running configuration intact.
    pub async fn reload_from_file(self: &Arc<Self>) -> Result<(), MgmtError> {
        let Some(path) = self.options.config_path.clone() else {
            return Err(MgmtError::NothingStaged);
        };
        let model = config::from_yaml_file(&path)?;
        match self.stage_model(model, "signal") {
            Ok(_) => self.apply_staged().await.map(|_| ()),
            Err(error) => {
                warn!(%error, "config validation failed");
                Err(error)
            }
        }
    }

    /// SIGTERM: stop intake, drain, persist, exit.
    pub async fn graceful_shutdown(&self) {
        info!("shutting down");
        let _ = self.root_shutdown.send(true);
        if let Some(stop) = self.service_stop.lock().take() {
            let _ = stop.send(true);
        }
        tokio::time::sleep(self.options.shutdown_grace.min(std::time::Duration::from_secs(30)))
            .await;
        if let Err(error) = self.store.sync() {
            warn!(%error, "final store sync failed");
        }
    }

    /// Install signal handlers; returns after SIGTERM completes.
    pub async fn run_signals(self: Arc<Self>) -> Result<(), MgmtError> {
        use tokio::signal::unix::{signal, SignalKind};
        let mut hangup = signal(SignalKind::hangup())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    info!("SIGHUP: reloading configuration");
                    if let Err(error) = self.reload_from_file().await {
                        warn!(%error, "reload rejected, running config unchanged");
                    }
                }
                _ = terminate.recv() => {
                    self.graceful_shutdown().await;
                    return Ok(());
                }
                _ = interrupt.recv() => {
                    self.graceful_shutdown().await;
                    return Ok(());
                }
            }
        }
    }

    /// (Re)start the per-revision service tasks for a freshly applied
    /// model. Service bring-up problems are isolated per service, never an
    /// apply failure.
    pub(crate) fn start_services(self: &Arc<Self>, model: &ValidModel, ruleset: &firewall::Ruleset) {
        // Stop the previous generation.
        if let Some(stop) = self.service_stop.lock().take() {
            let _ = stop.send(true);
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        *self.service_stop.lock() = Some(stop_tx);

        // Flow engine follows the features section and the new ruleset view.
        let features = &model.model().features;
        let engine = FlowEngine::new(
            EngineConfig {
                learning_mode: features.learning_mode,
                packet_window: features.packet_window,
                flow_timeout: std::time::Duration::from_secs(features.flow_timeout.max(1)),
                cleanup_interval: std::time::Duration::from_secs(features.cleanup_interval.max(1)),
                ..EngineConfig::default()
            },
            Arc::clone(&self.view),
            PatternSet::default(),
            Arc::new(NullFastPath),
            Some(Arc::clone(&self.store)),
        );
        {
            let supervisor = Arc::clone(self);
            engine.sentinel().on_anomaly(move |mac, z_score| {
                supervisor.broadcast(Event::DeviceAnomaly {
                    mac: mac.to_string(),
                    z_score,
                });
            });
        }
        engine.start_persistence(stop_rx.clone());
        engine.start_reaper(stop_rx.clone());
        engine.start_event_drain(stop_rx.clone());
        engine.start_verdict_worker(stop_rx.clone());
        *self.engine.lock() = Some(engine);

        // Resolver, with the DHCP hostname bridge.
        let dns_config = model.model().dns.clone().unwrap_or_default();
        match dns::Resolver::new(dns_config) {
            Ok(resolver) => {
                if self.options.services {
                    tokio::spawn(Arc::clone(&resolver).run(stop_rx.clone()));
                }
                *self.resolver.lock() = Some(resolver);
            }
            Err(error) => warn!(%error, "resolver start failed"),
        }

        // DHCP.
        let (host_tx, mut host_rx) = mpsc::channel::<HostEvent>(128);
        if self.options.services {
            match dhcp::DhcpServer::from_model(model, Arc::clone(&self.store), host_tx) {
                Ok(server) => {
                    tokio::spawn(server.run(stop_rx.clone()));
                }
                Err(error) => warn!(%error, "dhcp start failed"),
            }
        }
        {
            let supervisor = Arc::clone(self);
            let mut bridge_stop = stop_rx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = host_rx.recv() => {
                            let Some(event) = event else { return };
                            let resolver = supervisor.resolver.lock().as_ref().map(Arc::clone);
                            if let Some(resolver) = resolver {
                                match &event {
                                    HostEvent::Bind { hostname, ip, .. } => {
                                        resolver.learn_host(hostname, *ip);
                                    }
                                    HostEvent::Release { hostname, .. } => {
                                        resolver.forget_host(hostname);
                                    }
                                }
                            }
                            supervisor.broadcast(Event::LeaseChange);
                        }
                        _ = bridge_stop.changed() => {
                            if *bridge_stop.borrow() {
                                return;
                            }
                        }
                    }
                }
            });
        }

        // Uplink groups.
        let uplinks = UplinkManager::from_model(model);
        {
            let supervisor = Arc::clone(self);
            let mut events = uplinks.subscribe();
            let mut uplink_stop = stop_rx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = events.recv() => {
                            let Ok(event) = event else { return };
                            supervisor.broadcast(Event::UplinkChange {
                                group: event.group,
                                interface: event.interface,
                                state: format!("{:?}", event.state).to_lowercase(),
                            });
                        }
                        _ = uplink_stop.changed() => {
                            if *uplink_stop.borrow() {
                                return;
                            }
                        }
                    }
                }
            });
        }
        if self.options.services {
            tokio::spawn(Arc::clone(&uplinks).run(stop_rx.clone()));
        }
        *self.uplinks.lock() = Some(uplinks);

        // Scheduler: one immediate reconcile, then the minute loop.
        match schedule::Scheduler::new(
            &model.model().schedules,
            &model.model().system.timezone,
            Arc::clone(&self.kernel),
        ) {
            Ok(scheduler) => {
                let scheduler = Arc::new(scheduler);
                let immediate = Arc::clone(&scheduler);
                tokio::spawn(async move { immediate.tick(chrono::Utc::now()).await });
                let mut sched_stop = stop_rx.clone();
                tokio::spawn(async move {
                    let mut ticker =
                        tokio::time::interval(std::time::Duration::from_secs(60));
                    loop {
                        tokio::select! {
                            _ = ticker.tick() => scheduler.tick(chrono::Utc::now()).await,
                            _ = sched_stop.changed() => {
                                if *sched_stop.borrow() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
            Err(error) => warn!(%error, "scheduler start failed"),
        }

        // IPSet fetcher for url/file/domain sources and country sets.
        let resolver_for_sets = self
            .resolver
            .lock()
            .as_ref()
            .map(|r| Arc::clone(r) as Arc<dyn firewall::fetcher::DomainResolver>);
        let fetcher = Arc::new(firewall::fetcher::SetFetcher::new(
            Arc::clone(&self.kernel),
            Some(Arc::clone(&self.store)),
            resolver_for_sets,
        ));
        let countries: Vec<String> = ruleset
            .sets
            .iter()
            .filter_map(|set| set.name.strip_prefix("country_").map(str::to_string))
            .collect();
        if self.options.services {
            fetcher.spawn_all(
                &model.model().ipsets,
                model.model().protection.geoip_url.clone(),
                countries,
                stop_rx.clone(),
            );
        }

        // HA, when replication is configured.
        if let Some(replication) = &model.model().replication {
            match self.build_ha(replication) {
                Ok(node) => {
                    if self.options.services {
                        tokio::spawn(Arc::clone(&node).run(stop_rx.clone()));
                        let sync_rx = stop_rx.clone();
                        match replication.role {
                            config::HaRole::Primary => {
                                if let Some(peer) = replication.sync_peer {
                                    let client = ha::SyncClient::new(
                                        Arc::clone(&self.store),
                                        &replication.secret,
                                        peer,
                                    );
                                    tokio::spawn(client.run(sync_rx));
                                }
                            }
                            config::HaRole::Replica => {
                                if let Some(listen) = replication.sync_listen {
                                    let server = ha::SyncServer::new(
                                        Arc::clone(&self.store),
                                        &replication.secret,
                                        listen,
                                    );
                                    tokio::spawn(server.run(sync_rx));
                                }
                            }
                        }
                    }
                    *self.ha.lock() = Some(node);
                }
                Err(error) => warn!(%error, "ha start failed"),
            }
        } else {
            *self.ha.lock() = None;
        }

        debug!("service generation started");
    }

    fn build_ha(&self, replication: &config::ReplicationConfig) -> Result<Arc<ha::HaNode>, MgmtError> {
        let vip: Arc<dyn ha::VipHandler> = if self.options.kernel {
            Arc::new(ha::NetlinkVip::new(
                &replication.vip_interface,
                replication.virtual_ip,
            )?)
        } else {
            Arc::new(ha::FakeVip::new())
        };
        Ok(ha::HaNode::new(replication, vip))
    }
}

impl From<ha::HaError> for MgmtError {
    fn from(error: ha::HaError) -> Self {
        MgmtError::Io(std::io::Error::other(error.to_string()))
    }
}

impl From<interface_manager::spec::SpecError> for MgmtError {
    fn from(error: interface_manager::spec::SpecError) -> Self {
        MgmtError::Validation(config::ValidationErrors(vec![
            config::ValidationError::new("interface", error.to_string()),
        ]))
    }
}

pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
