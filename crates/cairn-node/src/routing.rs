//! Routing — peer selection for the forwarding engine.

use std::sync::Arc;

use crate::cla::{ConvergenceSender, PeerRegistry};
use crate::store::BundleDescriptor;

/// Chooses which peers a bundle should be transmitted to.
pub trait RoutingAgent: Send + Sync {
    /// Candidate peers for one forwarding pass. An empty result means the
    /// bundle is contraindicated for now.
    fn select_peers_for_forwarding(
        &self,
        descriptor: &BundleDescriptor,
    ) -> Vec<Arc<dyn ConvergenceSender>>;
}

/// Flooding strategy: every reachable peer gets every bundle once.
///
/// A peer is skipped when it already received the bundle from us, when it is
/// the bundle's own source node, or when it never announced an endpoint
/// identity, since an anonymous peer cannot be deduplicated against the
/// already-sent set.
pub struct EpidemicRouting {
    registry: Arc<PeerRegistry>,
}

impl EpidemicRouting {
    pub fn new(registry: Arc<PeerRegistry>) -> Self {
        Self { registry }
    }
}

impl RoutingAgent for EpidemicRouting {
    fn select_peers_for_forwarding(
        &self,
        descriptor: &BundleDescriptor,
    ) -> Vec<Arc<dyn ConvergenceSender>> {
        let mut selected = Vec::new();
        for sender in self.registry.senders() {
            if !sender.active() {
                continue;
            }
            let peer = sender.peer_endpoint_id();
            if peer.is_none() {
                tracing::trace!(link = %sender, "skipping anonymous peer");
                continue;
            }
            if peer.same_node(&descriptor.id.source) {
                continue;
            }
            if descriptor
                .already_sent
                .iter()
                .any(|sent| sent.same_node(&peer))
            {
                tracing::trace!(link = %sender, bundle = %descriptor.id, "peer already has this bundle");
                continue;
            }
            selected.push(sender);
        }
        selected
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
