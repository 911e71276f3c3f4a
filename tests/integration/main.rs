//! cairn integration harness.
//!
//! Tests drive real components over loopback TCP: a listener stands in for
//! the downstream node, senders dial it, and the forwarding engine runs in
//! between. Everything stays inside the test process, so no external
//! environment is needed:
//!
//!   cargo test --test integration

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::time::timeout;

use cairn_core::bundle::{block_type, BlockData, Bundle, CanonicalBlock};
use cairn_core::eid::EndpointId;

use cairn_node::cla::mtcp::{MtcpListener, MtcpSender};
use cairn_node::cla::NullNotifier;
use cairn_node::{
    BundleStore, ConvergenceSender, EpidemicRouting, ForwardingEngine, MemoryStore, PeerRegistry,
};

// ── Harness ───────────────────────────────────────────────────────────────────

const KEEPALIVE: Duration = Duration::from_secs(30);
const RECV_DEADLINE: Duration = Duration::from_secs(5);

fn node(name: &str) -> EndpointId {
    EndpointId::node(name).expect("valid node name")
}

fn test_bundle(source: &str, destination: &str, payload: &[u8]) -> Bundle {
    Bundle::new(node(source), node(destination), payload.to_vec())
}

/// Spins up a listener standing in for a neighboring node. Returns its
/// address and the channel its decoded bundles arrive on.
async fn downstream_node() -> Result<(SocketAddr, mpsc::Receiver<Bundle>)> {
    let (tx, rx) = mpsc::channel(16);
    let listener = MtcpListener::bind("127.0.0.1:0", tx)
        .await
        .context("binding downstream listener")?;
    let addr = listener.local_addr();
    tokio::spawn(listener.run());
    Ok((addr, rx))
}

async fn recv_bundle(rx: &mut mpsc::Receiver<Bundle>) -> Result<Bundle> {
    timeout(RECV_DEADLINE, rx.recv())
        .await
        .context("timed out waiting for a bundle")?
        .context("ingest channel closed")
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// One hop: relay node forwards a stored bundle to its single peer.
#[tokio::test]
async fn bundle_reaches_the_downstream_node() -> Result<()> {
    let (addr, mut rx) = downstream_node().await?;

    let registry = PeerRegistry::new();
    let sender = MtcpSender::connect(
        addr.to_string(),
        node("downstream"),
        false,
        KEEPALIVE,
        Arc::new(NullNotifier),
    )
    .await?;
    registry.register(sender);

    let store: Arc<dyn BundleStore> = Arc::new(MemoryStore::new());
    let engine = ForwardingEngine::new(
        node("relay"),
        store.clone(),
        Arc::new(EpidemicRouting::new(registry)),
    );

    let bundle = test_bundle("alpha", "omega", b"across the gap");
    store.insert(bundle.clone())?;

    engine.dispatch_pending().await;
    engine.drain().await;

    let received = recv_bundle(&mut rx).await?;
    assert_eq!(received.id(), bundle.id());
    assert_eq!(received.payload(), Some(b"across the gap".as_slice()));

    // The relay stamped itself as the previous node.
    let previous = received
        .extension_block(block_type::PREVIOUS_NODE)
        .context("previous-node block missing")?;
    assert_eq!(previous.data, BlockData::PreviousNode(node("relay")));

    // Bookkeeping settled: nothing retained, the delivery recorded.
    let descriptor = store.descriptor(&bundle.id())?;
    assert!(!descriptor.retained());
    assert_eq!(descriptor.already_sent, vec![node("downstream")]);
    Ok(())
}

/// Two hops: A hands the bundle to relay B over the wire, B stores it and
/// forwards to C. The previous-node block A stamped is replaced with B's.
#[tokio::test]
async fn bundle_relays_across_two_hops() -> Result<()> {
    // Node C, the final hop.
    let (c_addr, mut c_rx) = downstream_node().await?;

    // Node B, a full relay: listener, store, engine, link to C.
    let registry = PeerRegistry::new();
    let to_c = MtcpSender::connect(
        c_addr.to_string(),
        node("gamma"),
        false,
        KEEPALIVE,
        registry.clone(),
    )
    .await?;
    registry.register(to_c);

    let store: Arc<dyn BundleStore> = Arc::new(MemoryStore::new());
    let engine = ForwardingEngine::new(
        node("beta"),
        store.clone(),
        Arc::new(EpidemicRouting::new(registry)),
    );

    let (b_tx, mut b_rx) = mpsc::channel(16);
    let b_listener = MtcpListener::bind("127.0.0.1:0", b_tx).await?;
    let b_addr = b_listener.local_addr();
    tokio::spawn(b_listener.run());
    {
        let store = store.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            while let Some(bundle) = b_rx.recv().await {
                if let Ok(descriptor) = store.insert(bundle) {
                    engine.forward(descriptor).await;
                }
            }
        });
    }

    // Node A dials B and sends a bundle that already names A as the
    // previous hop.
    let to_b = MtcpSender::connect(
        b_addr.to_string(),
        node("beta"),
        false,
        KEEPALIVE,
        Arc::new(NullNotifier),
    )
    .await?;
    let mut bundle = test_bundle("alpha", "omega", b"two hops out");
    bundle.add_extension_block(CanonicalBlock::previous_node(node("alpha")));
    to_b.send(&bundle).await?;

    let relayed = recv_bundle(&mut c_rx).await?;
    assert_eq!(relayed.id(), bundle.id());
    assert_eq!(relayed.payload(), Some(b"two hops out".as_slice()));

    let hops: Vec<_> = relayed
        .blocks
        .iter()
        .filter(|block| block.block_type == block_type::PREVIOUS_NODE)
        .collect();
    assert_eq!(hops.len(), 1, "exactly one previous-node block expected");
    assert_eq!(hops[0].data, BlockData::PreviousNode(node("beta")));
    Ok(())
}

/// A peer that resets its connection fails its send, closes itself, and
/// falls out of the registry; the other peer still gets the bundle.
#[tokio::test]
async fn dead_peer_is_dropped_and_the_rest_still_deliver() -> Result<()> {
    let (live_addr, mut live_rx) = downstream_node().await?;

    let dead_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let dead_addr = dead_listener.local_addr()?;

    let registry = PeerRegistry::new();
    let live = MtcpSender::connect(
        live_addr.to_string(),
        node("downstream"),
        false,
        KEEPALIVE,
        registry.clone(),
    )
    .await?;
    registry.register(live);
    let dead = MtcpSender::connect(
        dead_addr.to_string(),
        node("doomed"),
        false,
        KEEPALIVE,
        registry.clone(),
    )
    .await?;
    registry.register(dead);
    assert_eq!(registry.len(), 2);

    // Reset the doomed connection so its next write fails outright.
    let (socket, _) = dead_listener.accept().await?;
    socket.set_linger(Some(Duration::ZERO))?;
    drop(socket);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let store: Arc<dyn BundleStore> = Arc::new(MemoryStore::new());
    let engine = ForwardingEngine::new(
        node("relay"),
        store.clone(),
        Arc::new(EpidemicRouting::new(registry.clone())),
    );

    let bundle = test_bundle("alpha", "omega", b"survivor");
    store.insert(bundle.clone())?;
    engine.dispatch_pending().await;
    engine.drain().await;

    let received = recv_bundle(&mut live_rx).await?;
    assert_eq!(received.id(), bundle.id());

    // The dead link took itself out of the registry on failure.
    assert_eq!(registry.len(), 1);
    let descriptor = store.descriptor(&bundle.id())?;
    assert_eq!(descriptor.already_sent, vec![node("downstream")]);
    assert!(!descriptor.retained());
    Ok(())
}

/// Keepalive probes keep flowing on an idle link without confusing the
/// listener, and the link still delivers afterwards.
#[tokio::test]
async fn idle_link_stays_usable_across_probes() -> Result<()> {
    let (addr, mut rx) = downstream_node().await?;
    let sender = MtcpSender::connect(
        addr.to_string(),
        node("downstream"),
        false,
        Duration::from_millis(20),
        Arc::new(NullNotifier),
    )
    .await?;

    // Long enough for several probes to cross the wire.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(sender.active());

    let bundle = test_bundle("alpha", "omega", b"after the silence");
    sender.send(&bundle).await?;
    let received = recv_bundle(&mut rx).await?;
    assert_eq!(received.id(), bundle.id());
    Ok(())
}
