//! Forwarding engine — drives bundles from dispatch to transmission.
//!
//! Each forwarded bundle runs as its own task inside a supervised set, so a
//! slow peer never blocks the rest of the node and shutdown can wait for
//! in-flight work. Constraint transitions go through the store before and
//! after transmission; a failed transition aborts the attempt rather than
//! transmitting with stale bookkeeping.

use std::sync::Arc;

use tokio::task::JoinSet;

use cairn_core::bundle::{block_type, Bundle, BundleId, CanonicalBlock};
use cairn_core::eid::EndpointId;

use crate::cla::ConvergenceSender;
use crate::routing::RoutingAgent;
use crate::store::{BundleDescriptor, BundleStore, Constraint};

/// Bundle processing pipeline of one node.
pub struct ForwardingEngine {
    node_id: EndpointId,
    store: Arc<dyn BundleStore>,
    routing: Arc<dyn RoutingAgent>,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
}

impl ForwardingEngine {
    pub fn new(
        node_id: EndpointId,
        store: Arc<dyn BundleStore>,
        routing: Arc<dyn RoutingAgent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            store,
            routing,
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
        })
    }

    /// Starts one forwarding pass for `descriptor` and returns without
    /// waiting for it. Progress and failures are reported through the store
    /// and the log.
    pub async fn forward(&self, descriptor: BundleDescriptor) {
        let node_id = self.node_id.clone();
        let store = self.store.clone();
        let routing = self.routing.clone();
        let mut tasks = self.tasks.lock().await;
        // Reap tasks that already finished so the set does not grow without
        // bound between drains.
        while let Some(result) = tasks.try_join_next() {
            if let Err(error) = result {
                tracing::error!(%error, "forwarding task panicked");
            }
        }
        tasks.spawn(forwarding_task(node_id, store, routing, descriptor));
    }

    /// One dispatch sweep: every bundle the store reports as dispatch
    /// pending gets a forwarding pass. Safe to run repeatedly; a bundle
    /// already picked up has lost its dispatch-pending constraint and is
    /// not selected again.
    pub async fn dispatch_pending(&self) {
        let descriptors = match self.store.get_dispatchable() {
            Ok(descriptors) => descriptors,
            Err(error) => {
                tracing::error!(%error, "dispatch sweep could not query the store");
                return;
            }
        };
        tracing::debug!(count = descriptors.len(), "dispatching pending bundles");
        for descriptor in descriptors {
            self.forward(descriptor).await;
        }
    }

    /// Waits for every in-flight forwarding pass to settle. Used by tests
    /// and by daemon shutdown.
    pub async fn drain(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(result) = tasks.join_next().await {
            if let Err(error) = result {
                tracing::error!(%error, "forwarding task panicked");
            }
        }
    }
}

/// One full forwarding pass for one bundle.
async fn forwarding_task(
    node_id: EndpointId,
    store: Arc<dyn BundleStore>,
    routing: Arc<dyn RoutingAgent>,
    descriptor: BundleDescriptor,
) {
    let id = descriptor.id.clone();
    tracing::debug!(bundle = %id, "processing bundle");

    if let Err(error) = store.add_constraint(&id, Constraint::ForwardPending) {
        tracing::error!(bundle = %id, %error, "could not mark bundle forwarding pending");
        return;
    }
    if let Err(error) = store.remove_constraint(&id, Constraint::DispatchPending) {
        tracing::error!(bundle = %id, %error, "could not clear dispatch pending");
        return;
    }

    let peers = routing.select_peers_for_forwarding(&descriptor);
    if peers.is_empty() {
        contraindicate(&store, &id);
        return;
    }

    let mut bundle = match store.load(&id) {
        Ok(bundle) => bundle,
        Err(error) => {
            // Dispatch pending is already gone and forwarding pending stays
            // set, so no later sweep will pick this bundle up again. Left
            // as is until an operator intervenes.
            tracing::error!(
                bundle = %id,
                %error,
                "bundle content unavailable after constraint transition, bundle is wedged"
            );
            return;
        }
    };

    // Swap in ourselves as the previous node.
    if let Some(previous) = bundle.extension_block(block_type::PREVIOUS_NODE) {
        let number = previous.block_number;
        bundle.remove_block_by_number(number);
    }
    bundle.add_extension_block(CanonicalBlock::previous_node(node_id));

    transmit_to_peers(&store, &id, bundle, peers).await;

    if let Err(error) = store.remove_constraint(&id, Constraint::ForwardPending) {
        tracing::error!(bundle = %id, %error, "could not clear forwarding pending");
    }
}

/// The bundle cannot be forwarded right now. All constraints come off so
/// storage may reclaim it; a copy that arrives again later starts over.
fn contraindicate(store: &Arc<dyn BundleStore>, id: &BundleId) {
    tracing::debug!(bundle = %id, "no viable peers, bundle contraindicated");
    if let Err(error) = store.reset_constraints(id) {
        tracing::error!(bundle = %id, %error, "could not reset constraints");
    }
}

/// Fans one bundle out to every candidate peer at once. Attempts are
/// isolated: one peer failing or stalling never stops the others. Successes
/// are recorded into the already-sent set only after every attempt has
/// settled.
async fn transmit_to_peers(
    store: &Arc<dyn BundleStore>,
    id: &BundleId,
    bundle: Bundle,
    peers: Vec<Arc<dyn ConvergenceSender>>,
) {
    tracing::debug!(bundle = %id, peers = peers.len(), "starting transmission fan-out");
    let bundle = Arc::new(bundle);
    let mut attempts = Vec::with_capacity(peers.len());
    for peer in &peers {
        let peer = peer.clone();
        let bundle = bundle.clone();
        let id = id.clone();
        attempts.push(tokio::spawn(async move {
            tracing::info!(bundle = %id, peer = %peer, "sending bundle");
            match peer.send(&bundle).await {
                Ok(()) => true,
                Err(error) => {
                    tracing::warn!(bundle = %id, peer = %peer, %error, "sending bundle failed");
                    false
                }
            }
        }));
    }

    let results = futures::future::join_all(attempts).await;
    for (peer, result) in peers.iter().zip(results) {
        match result {
            Ok(true) => {
                tracing::debug!(bundle = %id, peer = %peer, "bundle sent");
                if let Err(error) = store.add_already_sent(id, peer.peer_endpoint_id()) {
                    tracing::warn!(bundle = %id, peer = %peer, %error, "could not record delivery");
                }
            }
            Ok(false) => {}
            Err(error) => {
                tracing::warn!(bundle = %id, %error, "send attempt panicked");
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
