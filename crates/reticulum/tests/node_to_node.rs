//! Two- and three-node scenarios over in-process pair interfaces.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand_core::OsRng;
use tokio::time::sleep;

use reticulum::destination::link::LinkStatus;
use reticulum::destination::single_in;
use reticulum::iface::pair::PairInterface;
use reticulum::iface::{IfacContext, InterfaceProperties};
use reticulum::identity::PrivateIdentity;
use reticulum::resource::ResourceEventKind;
use reticulum::transport::{Transport, TransportConfig};

async fn wire(
    a: &Transport,
    b: &Transport,
    ifac_a: Option<Arc<IfacContext>>,
    ifac_b: Option<Arc<IfacContext>>,
) {
    let (pair_a, pair_b) = PairInterface::new_pair();
    a.iface_manager().lock().await.spawn_with(
        pair_a,
        InterfaceProperties::named(format!("{}-pair", a.name())),
        ifac_a,
        PairInterface::spawn,
    );
    b.iface_manager().lock().await.spawn_with(
        pair_b,
        InterfaceProperties::named(format!("{}-pair", b.name())),
        ifac_b,
        PairInterface::spawn,
    );
}

async fn wait_for<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn node(name: &str, retransmit: bool) -> (Transport, PrivateIdentity) {
    let identity = PrivateIdentity::new_from_rand(OsRng);
    let transport = Transport::new(TransportConfig::new(name, &identity, retransmit));
    (transport, identity)
}

#[tokio::test]
async fn announce_builds_path_and_recalls_identity() {
    let (node_a, identity_a) = node("a", false);
    let (node_b, _) = node("b", false);
    wire(&node_a, &node_b, None, None).await;

    let destination = single_in(identity_a.clone(), "example_utilities", &["announcesample"])
        .expect("destination");
    let destination_hash = *destination.address_hash();
    let destination = node_a.register_in_destination(destination).await;

    let mut announces = node_b.announce_events();
    node_a.send_announce(&destination, Some(b"node a")).await.expect("announce");

    wait_for("path to announced destination", || async {
        node_b.has_path(&destination_hash).await
    })
    .await;

    assert_eq!(node_b.hops_to(&destination_hash).await, Some(1));
    assert!(node_b.recall_out_destination(&destination_hash).await.is_some());
    assert_eq!(
        node_b.identity_store().recall(&destination_hash).map(|i| i.address_hash),
        Some(*identity_a.address_hash())
    );

    let event = announces.recv().await.expect("announce event");
    assert_eq!(event.destination_hash, destination_hash);
    assert_eq!(event.app_data, b"node a");
    assert_eq!(event.hops, 0, "locally originated announce leaves with zero hops");

    node_a.stop().await;
    node_b.stop().await;
}

#[tokio::test]
async fn opportunistic_data_is_delivered_and_proved() {
    let (node_a, identity_a) = node("a", false);
    let (node_b, _) = node("b", false);
    wire(&node_a, &node_b, None, None).await;

    let destination =
        single_in(identity_a, "example_utilities", &["datasample"]).expect("destination");
    let destination_hash = *destination.address_hash();
    let destination = node_a.register_in_destination(destination).await;
    node_a.send_announce(&destination, None).await.expect("announce");

    wait_for("path", || async { node_b.has_path(&destination_hash).await }).await;

    let mut received = node_a.received_data_events();
    let mut proofs = node_b.proof_events();

    let packet_hash = node_b
        .send_to_single(&destination_hash, b"over the mesh")
        .await
        .expect("send");

    let event = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .expect("delivery timeout")
        .expect("delivery event");
    assert_eq!(event.destination, destination_hash);
    assert_eq!(event.data, b"over the mesh");
    assert!(!event.via_ratchet);

    let proof = tokio::time::timeout(Duration::from_secs(5), proofs.recv())
        .await
        .expect("proof timeout")
        .expect("proof event");
    assert_eq!(proof.packet_hash, packet_hash);
    assert_eq!(proof.destination, destination_hash);

    node_a.stop().await;
    node_b.stop().await;
}

#[tokio::test]
async fn ratchetted_announce_enables_forward_secret_delivery() {
    let ratchet_dir = tempfile::tempdir().expect("tempdir");
    let store_dir = tempfile::tempdir().expect("tempdir");

    let (node_a, identity_a) = node("a", false);
    let identity_b = PrivateIdentity::new_from_rand(OsRng);
    let mut config_b = TransportConfig::new("b", &identity_b, false);
    config_b.ratchet_store_path = Some(store_dir.path().to_path_buf());
    let node_b = Transport::new(config_b);

    wire(&node_a, &node_b, None, None).await;

    let mut destination =
        single_in(identity_a, "example_utilities", &["ratchetsample"]).expect("destination");
    destination.enable_ratchets(ratchet_dir.path().join("ratchets")).expect("ratchets");
    let destination_hash = *destination.address_hash();
    let destination = node_a.register_in_destination(destination).await;

    let mut announces = node_b.announce_events();
    node_a.send_announce(&destination, None).await.expect("announce");

    let event = tokio::time::timeout(Duration::from_secs(5), announces.recv())
        .await
        .expect("announce timeout")
        .expect("announce event");
    assert!(event.ratchet.is_some(), "ratchetted announce must carry the ratchet key");

    let mut received = node_a.received_data_events();
    node_b.send_to_single(&destination_hash, b"forward secret").await.expect("send");

    let event = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .expect("delivery timeout")
        .expect("delivery event");
    assert_eq!(event.data, b"forward secret");
    assert!(event.via_ratchet, "delivery must use the announced ratchet");

    node_a.stop().await;
    node_b.stop().await;
}

#[tokio::test]
async fn link_establishes_and_transfers_resource() {
    let (node_a, identity_a) = node("a", false);
    let (node_b, _) = node("b", false);
    wire(&node_a, &node_b, None, None).await;

    let destination =
        single_in(identity_a, "example_utilities", &["linksample"]).expect("destination");
    let destination_hash = *destination.address_hash();
    let destination = node_a.register_in_destination(destination).await;
    node_a.send_announce(&destination, None).await.expect("announce");

    wait_for("path", || async { node_b.has_path(&destination_hash).await }).await;

    let link = node_b.open_link(&destination_hash).await.expect("link");
    wait_for("link activation", || async {
        link.lock().await.status() == LinkStatus::Active
    })
    .await;
    let link_id = *link.lock().await.id();

    // Small payload: one encrypted link packet, proved by the peer.
    let mut link_events = node_a.link_events();
    let mut proofs = node_b.proof_events();
    let packet_hash = node_b.send_on_link(&link_id, b"link payload").await.expect("send");

    let mut data_arrived = false;
    for _ in 0..100 {
        match tokio::time::timeout(Duration::from_millis(100), link_events.recv()).await {
            Ok(Ok(event)) => {
                if let reticulum::destination::link::LinkEvent::Data(payload) = event.event {
                    if payload.as_slice() == b"link payload" {
                        data_arrived = true;
                        break;
                    }
                }
            }
            _ => {}
        }
    }
    assert!(data_arrived, "link payload never reached the responder");

    let proof = tokio::time::timeout(Duration::from_secs(5), proofs.recv())
        .await
        .expect("proof timeout")
        .expect("proof event");
    assert_eq!(proof.packet_hash, packet_hash);

    // Large payload: a windowed resource with completion on both sides.
    let payload: Vec<u8> = (0..10_000usize).map(|i| (i * 7 % 251) as u8).collect();
    let mut resources_a = node_a.resource_events();
    let mut resources_b = node_b.resource_events();

    node_b.send_resource(&link_id, payload.clone(), None).await.expect("resource");

    let mut received_payload = None;
    for _ in 0..200 {
        match tokio::time::timeout(Duration::from_millis(100), resources_a.recv()).await {
            Ok(Ok(event)) => {
                if let ResourceEventKind::Complete(complete) = event.kind {
                    received_payload = Some(complete.data);
                    break;
                }
            }
            _ => {}
        }
    }
    assert_eq!(received_payload.expect("resource completion"), payload);

    let mut outbound_complete = false;
    for _ in 0..100 {
        match tokio::time::timeout(Duration::from_millis(100), resources_b.recv()).await {
            Ok(Ok(event)) => {
                if matches!(event.kind, ResourceEventKind::OutboundComplete) {
                    outbound_complete = true;
                    break;
                }
            }
            _ => {}
        }
    }
    assert!(outbound_complete, "sender never observed resource completion");

    assert_eq!(link.lock().await.status(), LinkStatus::Active);

    node_a.stop().await;
    node_b.stop().await;
}

#[tokio::test]
async fn mismatched_ifac_passphrases_isolate_networks() {
    let (node_a, identity_a) = node("a", false);
    let (node_b, _) = node("b", false);

    let ifac_a = Arc::new(IfacContext::new("test_network", "passphrase one"));
    let ifac_b = Arc::new(IfacContext::new("test_network", "passphrase two"));
    wire(&node_a, &node_b, Some(ifac_a), Some(ifac_b)).await;

    let destination =
        single_in(identity_a, "example_utilities", &["ifacsample"]).expect("destination");
    let destination_hash = *destination.address_hash();
    let destination = node_a.register_in_destination(destination).await;

    for _ in 0..3 {
        node_a.send_announce(&destination, None).await.expect("announce");
        sleep(Duration::from_millis(200)).await;
    }

    assert!(
        !node_b.has_path(&destination_hash).await,
        "announce crossed mismatched access codes"
    );

    node_a.stop().await;
    node_b.stop().await;
}

#[tokio::test]
async fn transport_node_relays_between_edges() {
    let (node_a, identity_a) = node("a", false);
    let (node_c, _) = node("c", true);
    let (node_b, _) = node("b", false);

    wire(&node_a, &node_c, None, None).await;
    wire(&node_c, &node_b, None, None).await;

    let destination =
        single_in(identity_a, "example_utilities", &["relaysample"]).expect("destination");
    let destination_hash = *destination.address_hash();
    let destination = node_a.register_in_destination(destination).await;

    let mut announces_b = node_b.announce_events();
    node_a.send_announce(&destination, None).await.expect("announce");

    wait_for("relayed path at edge", || async { node_b.has_path(&destination_hash).await })
        .await;

    // The relayed copy is HEADER_2 with one accumulated hop.
    let event = announces_b.recv().await.expect("announce event");
    assert_eq!(event.hops, 1);
    assert_eq!(node_b.hops_to(&destination_hash).await, Some(2));

    let mut received = node_a.received_data_events();
    let mut proofs = node_b.proof_events();
    let packet_hash =
        node_b.send_to_single(&destination_hash, b"across the relay").await.expect("send");

    let delivery = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .expect("delivery timeout")
        .expect("delivery event");
    assert_eq!(delivery.data, b"across the relay");

    let proof = tokio::time::timeout(Duration::from_secs(5), proofs.recv())
        .await
        .expect("proof timeout")
        .expect("proof event");
    assert_eq!(proof.packet_hash, packet_hash);

    node_a.stop().await;
    node_b.stop().await;
    node_c.stop().await;
}

