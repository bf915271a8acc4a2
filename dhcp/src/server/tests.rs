// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

use super::*;
use crate::lease::LeaseState;
use pretty_assertions::assert_eq;

const MAC1: MacAddr = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);

fn harness() -> (tempfile::TempDir, DhcpServer, mpsc::Receiver<HostEvent>) {
    let model = config::validate(
        config::from_yaml_str(
            r"
interface:
  - name: eth0
    kind: physical
    zone: lan
    addresses: [192.168.1.1/24]
dhcp:
  - interface: eth0
    range_start: 192.168.1.100
    range_end: 192.168.1.102
    lease_time: 5
    dns: [192.168.1.1]
    domain: lan.example.com
    vendor_classes:
      - identifier: Polycom
        options:
          tftp_server: tftp-voip.example.com
",
        )
        .unwrap(),
    )
    .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(&dir.path().join("state.db")).unwrap());
    let (tx, rx) = mpsc::channel(16);
    let server = DhcpServer::from_model(&model, store, tx).unwrap();
    (dir, server, rx)
}

fn client_message(mac: MacAddr, message_type: MessageType) -> Message {
    let mut message = Message::default();
    message
        .set_opcode(Opcode::BootRequest)
        .set_xid(0x1a2b)
        .set_chaddr(&mac.octets());
    message
        .opts_mut()
        .insert(DhcpOption::MessageType(message_type));
    message
}

fn request_for(mac: MacAddr, ip: Ipv4Addr, hostname: &str) -> Message {
    let mut message = client_message(mac, MessageType::Request);
    message
        .opts_mut()
        .insert(DhcpOption::RequestedIpAddress(ip));
    message
        .opts_mut()
        .insert(DhcpOption::Hostname(hostname.to_string()));
    message
}

fn reply_type(reply: &Message) -> MessageType {
    reply.opts().msg_type().unwrap()
}

#[test]
fn lease_lifecycle_with_sticky_reoffer() {
    let (_dir, mut server, mut events) = harness();
    let discover = client_message(MAC1, MessageType::Discover);

    // DISCOVER -> OFFER of the first free address.
    let offer = server.handle_message("eth0", &discover, 0).unwrap().unwrap();
    assert_eq!(reply_type(&offer), MessageType::Offer);
    assert_eq!(offer.yiaddr(), Ipv4Addr::new(192, 168, 1, 100));

    // REQUEST -> ACK, lease bound and persisted.
    let request = request_for(MAC1, offer.yiaddr(), "printer");
    let ack = server.handle_message("eth0", &request, 1).unwrap().unwrap();
    assert_eq!(reply_type(&ack), MessageType::Ack);
    let leases = server.leases();
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].ip, Ipv4Addr::new(192, 168, 1, 100));
    assert_eq!(leases[0].state, LeaseState::Bound);
    assert_eq!(leases[0].expires_at, 6);
    assert!(matches!(
        events.try_recv().unwrap(),
        HostEvent::Bind { ip: IpAddr::V4(ip), .. } if ip == Ipv4Addr::new(192, 168, 1, 100)
    ));

    // 8 s of silence: expiry (5 s) + grace (2 s) passed, lease reaped.
    let reaped = server.reap(9).unwrap();
    assert_eq!(reaped, 1);
    assert!(server.leases().is_empty());

    // Same MAC discovers again and the walk hands back .100.
    let offer = server
        .handle_message("eth0", &discover, 10)
        .unwrap()
        .unwrap();
    assert_eq!(offer.yiaddr(), Ipv4Addr::new(192, 168, 1, 100));
}

#[test]
fn expired_lease_survives_grace_as_sticky() {
    let (_dir, mut server, _events) = harness();
    let offer = server
        .handle_message("eth0", &client_message(MAC1, MessageType::Discover), 0)
        .unwrap()
        .unwrap();
    server
        .handle_message("eth0", &request_for(MAC1, offer.yiaddr(), "h"), 0)
        .unwrap();

    // Expired but inside grace: record marked, not removed.
    assert_eq!(server.reap(6).unwrap(), 0);
    assert_eq!(server.leases()[0].state, LeaseState::Expired);
}

#[test]
fn vendor_class_injection_is_selective() {
    let (_dir, mut server, _events) = harness();

    let mut phone = client_message(MAC1, MessageType::Discover);
    phone
        .opts_mut()
        .insert(DhcpOption::ClassIdentifier(b"Polycom-VVX400".to_vec()));
    let offer = server.handle_message("eth0", &phone, 0).unwrap().unwrap();
    let tftp = offer.opts().get(OptionCode::from(66));
    match tftp {
        Some(DhcpOption::Unknown(option)) => {
            assert_eq!(option.data(), b"tftp-voip.example.com");
        }
        other => panic!("expected tftp option, got {other:?}"),
    }

    let mac2 = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x02]);
    let mut generic = client_message(mac2, MessageType::Discover);
    generic
        .opts_mut()
        .insert(DhcpOption::ClassIdentifier(b"Generic-Device".to_vec()));
    let offer = server.handle_message("eth0", &generic, 0).unwrap().unwrap();
    assert!(offer.opts().get(OptionCode::from(66)).is_none());
    // Scope defaults still present.
    assert!(offer.opts().get(OptionCode::DomainName).is_some());
}

#[test]
fn foreign_request_gets_nak() {
    let (_dir, mut server, _events) = harness();
    let request = request_for(MAC1, Ipv4Addr::new(10, 0, 0, 5), "h");
    let reply = server.handle_message("eth0", &request, 0).unwrap().unwrap();
    assert_eq!(reply_type(&reply), MessageType::Nak);
}

#[test]
fn request_for_anothers_lease_gets_nak() {
    let (_dir, mut server, _events) = harness();
    let offer = server
        .handle_message("eth0", &client_message(MAC1, MessageType::Discover), 0)
        .unwrap()
        .unwrap();
    server
        .handle_message("eth0", &request_for(MAC1, offer.yiaddr(), "h1"), 0)
        .unwrap();

    let mac2 = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x02]);
    let steal = request_for(mac2, offer.yiaddr(), "h2");
    let reply = server.handle_message("eth0", &steal, 1).unwrap().unwrap();
    assert_eq!(reply_type(&reply), MessageType::Nak);
}

#[test]
fn release_frees_address_and_notifies() {
    let (_dir, mut server, mut events) = harness();
    let offer = server
        .handle_message("eth0", &client_message(MAC1, MessageType::Discover), 0)
        .unwrap()
        .unwrap();
    server
        .handle_message("eth0", &request_for(MAC1, offer.yiaddr(), "printer"), 0)
        .unwrap();
    let _bind = events.try_recv().unwrap();

    let release = client_message(MAC1, MessageType::Release);
    assert!(server.handle_message("eth0", &release, 1).unwrap().is_none());
    assert!(server.leases().is_empty());
    assert!(matches!(
        events.try_recv().unwrap(),
        HostEvent::Release { mac, .. } if mac == MAC1
    ));
}

#[test]
fn unknown_interface_is_ignored() {
    let (_dir, mut server, _events) = harness();
    let discover = client_message(MAC1, MessageType::Discover);
    assert!(server.handle_message("eth9", &discover, 0).unwrap().is_none());
}

#[test]
fn renewal_extends_existing_lease() {
    let (_dir, mut server, _events) = harness();
    let offer = server
        .handle_message("eth0", &client_message(MAC1, MessageType::Discover), 0)
        .unwrap()
        .unwrap();
    server
        .handle_message("eth0", &request_for(MAC1, offer.yiaddr(), "h"), 0)
        .unwrap();

    // Renew at t=3: new expiry 3 + 5.
    let renew = request_for(MAC1, offer.yiaddr(), "h");
    let ack = server.handle_message("eth0", &renew, 3).unwrap().unwrap();
    assert_eq!(reply_type(&ack), MessageType::Ack);
    assert_eq!(server.leases()[0].expires_at, 8);
}
