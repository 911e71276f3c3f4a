//! cairnd — store-and-forward bundle daemon.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use cairn_core::config::NodeConfig;
use cairn_core::eid::EndpointId;

use cairn_node::cla::mtcp::{MtcpListener, MtcpSender};
use cairn_node::{BundleStore, Constraint, EpidemicRouting, ForwardingEngine, MemoryStore, PeerRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config: explicit path wins, otherwise the default lookup.
    let config = match std::env::args().nth(1) {
        Some(path) => {
            NodeConfig::load(Path::new(&path)).with_context(|| format!("loading {path}"))?
        }
        None => NodeConfig::load_default().unwrap_or_else(|error| {
            tracing::warn!(%error, "failed to load config, using defaults");
            NodeConfig::default()
        }),
    };

    let node_id = config.node.endpoint_id.clone();
    tracing::info!(node = %node_id, listen = %config.mtcp.listen_addr, "cairnd starting");

    // Store
    let store: Arc<dyn BundleStore> = match &config.store.snapshot_path {
        Some(path) => Arc::new(MemoryStore::with_persistence(path.clone())),
        None => Arc::new(MemoryStore::new()),
    };

    // The peer registry doubles as the connection notifier, so dropped
    // links take themselves out of routing.
    let registry = PeerRegistry::new();
    let keepalive = Duration::from_secs(config.mtcp.keepalive_secs);

    // Dial the configured peers. An unreachable peer is not fatal.
    for peer in &config.peers {
        let peer_id = peer.endpoint_id.clone().unwrap_or_else(EndpointId::none);
        match MtcpSender::connect(
            peer.address.clone(),
            peer_id,
            peer.permanent,
            keepalive,
            registry.clone(),
        )
        .await
        {
            Ok(sender) => registry.register(sender),
            Err(error) => {
                tracing::warn!(address = %peer.address, %error, "could not reach configured peer");
            }
        }
    }
    tracing::info!(peers = registry.len(), "peer links established");

    let routing = Arc::new(EpidemicRouting::new(registry.clone()));
    let engine = ForwardingEngine::new(node_id, store.clone(), routing);

    // Inbound path: listener decodes frames, the ingest task stores the
    // bundle and starts a forwarding pass right away. The periodic sweep
    // below catches anything that slips through.
    let (ingest_tx, mut ingest_rx) = mpsc::channel(64);
    let listener = MtcpListener::bind(&config.mtcp.listen_addr, ingest_tx)
        .await
        .context("binding mtcp listener")?;
    let listener_task = tokio::spawn(listener.run());

    let ingest_task = {
        let store = store.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            while let Some(bundle) = ingest_rx.recv().await {
                let id = bundle.id();
                match store.insert(bundle) {
                    Ok(descriptor) => {
                        // A re-received bundle that was already dispatched
                        // comes back without the constraint; leave it be.
                        if descriptor.has_constraint(Constraint::DispatchPending) {
                            engine.forward(descriptor).await;
                        }
                    }
                    Err(error) => {
                        tracing::warn!(bundle = %id, %error, "failed to store inbound bundle");
                    }
                }
            }
        })
    };

    let sweep_task = {
        let engine = engine.clone();
        let interval = Duration::from_secs(config.dispatch.interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                engine.dispatch_pending().await;
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("shutdown signal received"),
        r = listener_task => tracing::error!("mtcp listener exited: {:?}", r),
        r = ingest_task   => tracing::error!("ingest task exited: {:?}", r),
        r = sweep_task    => tracing::error!("dispatch sweep exited: {:?}", r),
    }

    // Let in-flight forwarding settle, then close every link.
    engine.drain().await;
    registry.close_all().await;
    tracing::info!("cairnd stopped");

    Ok(())
}
