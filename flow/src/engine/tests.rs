// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

use super::*;
use crate::pattern::Signature;
use firewall::eval::PacketView;
use firewall::RulesetBackend;
use net::Protocol;
use pretty_assertions::assert_eq;

fn lan_wan_ruleset(accept_all: bool) -> firewall::Ruleset {
    let rules = if accept_all {
        "      - name: out\n        action: accept\n"
    } else {
        "      - name: out\n        action: drop\n"
    };
    let text = format!(
        r"
interface:
  - name: eth0
    kind: physical
    zone: lan
  - name: eth1
    kind: physical
    zone: wan
policy:
  - from: lan
    to: wan
    rules:
{rules}"
    );
    let model = config::validate(config::from_yaml_str(&text).unwrap()).unwrap();
    firewall::compile(&model).unwrap()
}

fn classifier(accept_all: bool) -> Arc<MemoryBackend> {
    let backend = Arc::new(MemoryBackend::new());
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
        .block_on(backend.apply(&lan_wan_ruleset(accept_all)))
        .unwrap();
    backend
}

fn pkt() -> PacketView {
    PacketView::forward(
        FlowKey::new(
            "192.168.1.100".parse().unwrap(),
            "8.8.8.8".parse().unwrap(),
            34567,
            443,
            Protocol::Tcp,
        ),
        "eth0",
        "eth1",
    )
}

fn learning_engine(window: u32, fastpath: Arc<MemoryFastPath>) -> Arc<FlowEngine> {
    FlowEngine::new(
        EngineConfig {
            learning_mode: true,
            packet_window: window,
            ..EngineConfig::default()
        },
        classifier(true),
        PatternSet::default(),
        fastpath,
        None,
    )
}

#[test]
fn learning_promotes_after_window() {
    let fastpath = Arc::new(MemoryFastPath::new());
    let engine = learning_engine(3, Arc::clone(&fastpath));
    let pkt = pkt();

    for _ in 0..3 {
        assert_eq!(engine.process_packet(&pkt, 100, None, None), Verdict::Allow);
    }
    let flow = engine.flows().pop().unwrap();
    assert_eq!(flow.verdict, Verdict::Allow);
    assert!(!flow.flags.contains(FlowFlags::OFFLOADED));

    // Packet four crosses the window: offloaded and fast-pathed.
    assert_eq!(engine.process_packet(&pkt, 100, None, None), Verdict::Offload);
    let flow = engine.flows().pop().unwrap();
    assert!(flow.flags.contains(FlowFlags::OFFLOADED));
    assert!(fastpath.contains(&pkt.key));

    // And it stays there.
    assert_eq!(engine.process_packet(&pkt, 100, None, None), Verdict::Offload);
}

#[test]
fn enforcement_consults_ruleset() {
    let engine = FlowEngine::new(
        EngineConfig {
            learning_mode: false,
            ..EngineConfig::default()
        },
        classifier(false),
        PatternSet::default(),
        Arc::new(NullFastPath),
        None,
    );
    let pkt = pkt();
    assert_eq!(engine.process_packet(&pkt, 100, None, None), Verdict::Drop);
    // The denied flow is sticky in memory too.
    assert_eq!(engine.process_packet(&pkt, 100, None, None), Verdict::Drop);
    let flow = engine.flows().pop().unwrap();
    assert!(flow.flags.contains(FlowFlags::BLOCKED));
}

#[test]
fn denied_flow_is_sticky_across_cache_clear() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(&dir.path().join("state.db")).unwrap());
    let engine = FlowEngine::new(
        EngineConfig {
            learning_mode: false,
            ..EngineConfig::default()
        },
        classifier(true),
        PatternSet::default(),
        Arc::new(NullFastPath),
        Some(Arc::clone(&store)),
    );
    let pkt = pkt();

    // The ruleset allows it, but an operator denied the flow in the store.
    let denied = StoredFlow {
        key: pkt.key,
        verdict: Verdict::Drop,
        packets: 0,
        bytes: 0,
        flags: FlowFlags::BLOCKED,
        updated_at: 0,
    };
    let mut txn = store.begin();
    txn.put_json(Bucket::Flows, &denied.digest_key(), &denied)
        .unwrap();
    txn.commit().unwrap();

    engine.clear_caches();
    assert_eq!(engine.flow_count(), 0);

    // First packet consults the slow path once...
    assert_eq!(engine.process_packet(&pkt, 100, None, None), Verdict::Drop);
    assert_eq!(engine.counters.slow_path_lookups.load(Ordering::Relaxed), 1);

    // ...drop the flow table entry again: the verdict cache answers now,
    // with no second store consult.
    engine.table.remove(&pkt.key);
    assert_eq!(engine.process_packet(&pkt, 100, None, None), Verdict::Drop);
    assert_eq!(engine.counters.slow_path_lookups.load(Ordering::Relaxed), 1);
}

#[test]
fn signature_drop_overrides_accepting_ruleset() {
    let patterns = PatternSet::with_default_budget(vec![Signature::literal(
        "exe-magic",
        b"MZ",
        crate::PatternAction::Drop,
    )]);
    let engine = FlowEngine::new(
        EngineConfig {
            learning_mode: false,
            ..EngineConfig::default()
        },
        classifier(true),
        patterns,
        Arc::new(NullFastPath),
        None,
    );
    let pkt = pkt();
    assert_eq!(
        engine.process_packet(&pkt, 100, Some(b"xxMZxx"), None),
        Verdict::Drop
    );
    let flow = engine.flows().pop().unwrap();
    assert!(flow.flags.contains(FlowFlags::BLOCKED));
}

#[test]
fn monitor_signature_flags_without_blocking() {
    let patterns = PatternSet::with_default_budget(vec![Signature::literal(
        "probe",
        b"probe",
        crate::PatternAction::Monitor,
    )]);
    let engine = FlowEngine::new(
        EngineConfig {
            learning_mode: false,
            ..EngineConfig::default()
        },
        classifier(true),
        patterns,
        Arc::new(NullFastPath),
        None,
    );
    let verdict = engine.process_packet(&pkt(), 100, Some(b"a probe b"), None);
    assert_eq!(verdict, Verdict::Allow);
    let flow = engine.flows().pop().unwrap();
    assert!(flow.flags.contains(FlowFlags::MONITORED));
    // Monitored flows keep riding the userspace path.
    assert_eq!(engine.process_packet(&pkt(), 100, None, None), Verdict::Inspect);
}

#[test]
fn one_persisted_record_per_flow_key() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(&dir.path().join("state.db")).unwrap());
    let engine = FlowEngine::new(
        EngineConfig {
            learning_mode: false,
            ..EngineConfig::default()
        },
        classifier(false),
        PatternSet::default(),
        Arc::new(NullFastPath),
        Some(Arc::clone(&store)),
    );
    let pkt = pkt();
    for _ in 0..5 {
        engine.process_packet(&pkt, 100, None, None);
        engine.table.remove(&pkt.key);
        engine.verdict_cache.invalidate_all();
    }
    assert_eq!(store.count(Bucket::Flows), 1);
}

#[test]
fn reap_drops_fastpath_entries() {
    let fastpath = Arc::new(MemoryFastPath::new());
    let engine = FlowEngine::new(
        EngineConfig {
            learning_mode: true,
            packet_window: 1,
            flow_timeout: Duration::from_millis(1),
            ..EngineConfig::default()
        },
        classifier(true),
        PatternSet::default(),
        Arc::clone(&fastpath) as Arc<dyn FastPath>,
        None,
    );
    let pkt = pkt();
    engine.process_packet(&pkt, 100, None, None);
    engine.process_packet(&pkt, 100, None, None);
    assert!(fastpath.contains(&pkt.key));

    std::thread::sleep(Duration::from_millis(5));
    engine.reap(Duration::from_secs(60));
    assert!(!fastpath.contains(&pkt.key));
    assert_eq!(engine.flow_count(), 0);
}

#[test]
fn event_overflow_counts_instead_of_blocking() {
    let engine = learning_engine(3, Arc::new(MemoryFastPath::new()));
    // No drain task started: every submit overflows.
    engine.submit_event(FastPathEvent {
        key: pkt().key,
        packets: 1,
        bytes: 64,
    });
    assert_eq!(engine.counters.dropped_events.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn verdict_channel_answers_through_the_worker() {
    let backend = Arc::new(MemoryBackend::new());
    backend.apply(&lan_wan_ruleset(false)).await.unwrap();
    let engine = FlowEngine::new(
        EngineConfig {
            learning_mode: false,
            ..EngineConfig::default()
        },
        backend,
        PatternSet::default(),
        Arc::new(NullFastPath),
        None,
    );
    let (_stop, stop_rx) = watch::channel(false);
    engine.start_verdict_worker(stop_rx);
    let verdict = engine.request_verdict(pkt(), 100, None, None).await;
    assert_eq!(verdict, Verdict::Drop);
    assert_eq!(engine.counters.fail_open.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn verdict_channel_fails_open_without_a_worker() {
    // No worker started; the classifier never runs, so an empty view does.
    let engine = FlowEngine::new(
        EngineConfig::default(),
        Arc::new(MemoryBackend::new()),
        PatternSet::default(),
        Arc::new(NullFastPath),
        None,
    );
    let verdict = engine.request_verdict(pkt(), 100, None, None).await;
    assert_eq!(verdict, Verdict::Allow);
    assert_eq!(engine.counters.fail_open.load(Ordering::Relaxed), 1);
    // Nothing was classified: no flow entered the table.
    assert_eq!(engine.flow_count(), 0);
}
