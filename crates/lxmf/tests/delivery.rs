//! End-to-end message delivery between two routers over an in-process
//! wire.

use std::sync::Arc;
use std::time::Duration;

use rand_core::OsRng;
use tokio::time::sleep;

use reticulum::hash::AddressHash;
use reticulum::iface::pair::PairInterface;
use reticulum::iface::InterfaceProperties;
use reticulum::identity::PrivateIdentity;
use reticulum::transport::{Transport, TransportConfig};

use lxmf::message::DeliveryMethod;
use lxmf::{LxmMessage, LxmRouter, LxmRouterConfig, LxmfEvent, MessageState};

struct Node {
    router: Arc<LxmRouter>,
    transport: Arc<Transport>,
    delivery_hash: AddressHash,
}

async fn start_node(name: &str, display_name: &str) -> Node {
    let identity = PrivateIdentity::new_from_rand(OsRng);
    let transport = Arc::new(Transport::new(TransportConfig::new(name, &identity, false)));
    let router = Arc::new(LxmRouter::new(
        identity,
        transport.clone(),
        LxmRouterConfig {
            display_name: Some(display_name.into()),
            process_interval: Duration::from_millis(100),
            ..Default::default()
        },
    ));
    let delivery_hash = router.register_delivery_identity().await.expect("delivery identity");
    router.start();

    Node { router, transport, delivery_hash }
}

async fn connect(a: &Node, b: &Node) {
    let (pair_a, pair_b) = PairInterface::new_pair();
    a.transport.iface_manager().lock().await.spawn_with(
        pair_a,
        InterfaceProperties::named("pair"),
        None,
        PairInterface::spawn,
    );
    b.transport.iface_manager().lock().await.spawn_with(
        pair_b,
        InterfaceProperties::named("pair"),
        None,
        PairInterface::spawn,
    );

    a.router.announce().await.expect("announce");
    b.router.announce().await.expect("announce");

    for _ in 0..100 {
        if a.transport.has_path(&b.delivery_hash).await
            && b.transport.has_path(&a.delivery_hash).await
        {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("nodes never learned each other's paths");
}

async fn next_inbound(
    events: &mut tokio::sync::broadcast::Receiver<LxmfEvent>,
    within: Duration,
) -> (Arc<LxmMessage>, bool) {
    let rounds = (within.as_millis() / 100).max(1);
    for _ in 0..rounds {
        match tokio::time::timeout(Duration::from_millis(100), events.recv()).await {
            Ok(Ok(LxmfEvent::InboundMessage { message, verified })) => {
                return (message, verified)
            }
            Ok(Ok(_)) => continue,
            Ok(Err(_)) => panic!("event stream closed"),
            Err(_) => continue,
        }
    }
    panic!("no inbound message within {:?}", within);
}

async fn wait_for_state(
    router: &LxmRouter,
    message_id: &lxmf::router::MessageId,
    state: MessageState,
    within: Duration,
) {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if router.message_state(message_id).await == Some(state) {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "message never reached {:?}, stuck at {:?}",
        state,
        router.message_state(message_id).await
    );
}

#[tokio::test]
async fn opportunistic_echo_roundtrip() {
    let node_a = start_node("a", "Echo Bot").await;
    let node_b = start_node("b", "Client").await;
    connect(&node_a, &node_b).await;

    let mut events_a = node_a.router.events();
    let mut events_b = node_b.router.events();

    let message = LxmMessage::new(
        node_a.delivery_hash,
        node_b.delivery_hash,
        b"hi".as_slice(),
        b"".as_slice(),
        DeliveryMethod::Opportunistic,
    );
    let message_id = node_b.router.handle_outbound(message).await.expect("outbound");

    // The bot hears the message, verified against the announced identity.
    let (inbound, verified) = next_inbound(&mut events_a, Duration::from_secs(10)).await;
    assert_eq!(inbound.content, b"hi");
    assert_eq!(inbound.source, node_b.delivery_hash);
    assert!(verified);

    // Echo it back.
    let echo = LxmMessage::new(
        inbound.source,
        node_a.delivery_hash,
        inbound.content.clone(),
        b"".as_slice(),
        DeliveryMethod::Opportunistic,
    );
    node_a.router.handle_outbound(echo).await.expect("echo outbound");

    let (echoed, _) = next_inbound(&mut events_b, Duration::from_secs(10)).await;
    assert_eq!(echoed.content, b"hi");

    // The original transitions to DELIVERED on the data-level proof.
    wait_for_state(&node_b.router, &message_id, MessageState::Delivered, Duration::from_secs(10))
        .await;

    node_a.router.stop().await;
    node_b.router.stop().await;
    node_a.transport.stop().await;
    node_b.transport.stop().await;
}

#[tokio::test]
async fn direct_delivery_uses_link_and_resource() {
    let node_a = start_node("a", "Receiver").await;
    let node_b = start_node("b", "Sender").await;
    connect(&node_a, &node_b).await;

    let mut events_a = node_a.router.events();

    // 800 bytes exceeds the single-packet limit, forcing a resource
    // transfer over the link.
    let payload: Vec<u8> = (0..800usize).map(|i| (i % 251) as u8).collect();
    let message = LxmMessage::new(
        node_a.delivery_hash,
        node_b.delivery_hash,
        payload.clone(),
        b"large".as_slice(),
        DeliveryMethod::Direct,
    );
    let message_id = node_b.router.handle_outbound(message).await.expect("outbound");

    let (inbound, verified) = next_inbound(&mut events_a, Duration::from_secs(15)).await;
    assert_eq!(inbound.content, payload);
    assert!(verified);

    wait_for_state(&node_b.router, &message_id, MessageState::Delivered, Duration::from_secs(15))
        .await;

    node_a.router.stop().await;
    node_b.router.stop().await;
    node_a.transport.stop().await;
    node_b.transport.stop().await;
}

#[tokio::test]
async fn failed_delivery_invokes_failure_path() {
    // No peer, no wire: the message can never leave. Short retry base so
    // the bounded backoff runs out quickly.
    let identity = PrivateIdentity::new_from_rand(OsRng);
    let transport = Arc::new(Transport::new(TransportConfig::new("solo", &identity, false)));
    let router = Arc::new(LxmRouter::new(
        identity,
        transport.clone(),
        LxmRouterConfig {
            retry_base: Duration::from_millis(100),
            process_interval: Duration::from_millis(50),
            ..Default::default()
        },
    ));
    let delivery_hash = router.register_delivery_identity().await.expect("delivery identity");
    router.start();

    let mut events = router.events();
    let unreachable = {
        let identity = PrivateIdentity::new_from_rand(OsRng);
        *identity.address_hash()
    };

    let message = LxmMessage::new(
        unreachable,
        delivery_hash,
        b"into the void".as_slice(),
        b"".as_slice(),
        DeliveryMethod::Opportunistic,
    );
    let message_id = router.handle_outbound(message).await.expect("outbound");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    let mut failed = false;
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Ok(LxmfEvent::MessageStateChanged { message_id: id, state })) => {
                if id == message_id && state == MessageState::Failed {
                    failed = true;
                    break;
                }
            }
            Ok(Ok(_)) => {}
            Ok(Err(_)) => break,
            Err(_) => {}
        }
    }
    assert!(failed, "unreachable message never failed");

    router.stop().await;
    transport.stop().await;
}
