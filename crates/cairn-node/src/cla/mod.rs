//! Convergence layer — the sender contract and the peer registry.
//!
//! A convergence sender wraps one outbound link to one peer. The forwarding
//! engine only ever talks to the [`ConvergenceSender`] trait; the mtcp
//! implementation lives in [`mtcp`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use cairn_core::bundle::Bundle;
use cairn_core::eid::EndpointId;
use cairn_core::wire::WireError;

pub mod mtcp;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ClaError {
    #[error("link i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("link is not active")]
    Inactive,
}

// ── Sender contract ──────────────────────────────────────────────────────────

/// One outbound link to one peer.
///
/// Transmission failures are reported through the returned `Result`; a failed
/// send must leave the sender in a state where the caller can simply drop it.
/// `Display` renders the link for log lines.
#[async_trait]
pub trait ConvergenceSender: fmt::Display + Send + Sync {
    /// Transmits one bundle over the link. Concurrent calls are serialized
    /// by the implementation so wire bytes never interleave. Any failure,
    /// encoding included, closes the link and is returned to the caller.
    async fn send(&self, bundle: &Bundle) -> Result<(), ClaError>;

    /// Shuts the link down and releases its resources. Closing an already
    /// closed sender is a no-op.
    async fn close(&self) -> Result<(), ClaError>;

    /// Endpoint identity of the peer behind this link, or the null endpoint
    /// when the peer never announced one.
    fn peer_endpoint_id(&self) -> EndpointId;

    /// Whether the link believes it can currently deliver bundles.
    fn active(&self) -> bool;

    /// Permanent links are re-dialed by the daemon when they drop.
    fn is_permanent(&self) -> bool;

    /// Dial address of the peer, used as the registry key.
    fn address(&self) -> &str;
}

// ── Connection notifications ─────────────────────────────────────────────────

/// Callbacks a sender fires on link lifecycle changes. Notifications are
/// fire-and-forget; the sender does not wait on any reaction.
pub trait ConnectionNotifier: Send + Sync {
    fn notify_connect(&self, peer: EndpointId);
    fn notify_disconnect(&self, address: &str);
}

/// Notifier for senders whose lifecycle nobody tracks, mostly in tests.
pub struct NullNotifier;

impl ConnectionNotifier for NullNotifier {
    fn notify_connect(&self, _peer: EndpointId) {}
    fn notify_disconnect(&self, _address: &str) {}
}

// ── Peer registry ────────────────────────────────────────────────────────────

/// Live senders keyed by dial address.
///
/// The registry doubles as the [`ConnectionNotifier`] for its senders: a
/// disconnect notification drops the sender from the registry, so routing
/// stops selecting it.
pub struct PeerRegistry {
    senders: DashMap<String, Arc<dyn ConvergenceSender>>,
}

impl PeerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            senders: DashMap::new(),
        })
    }

    pub fn register(&self, sender: Arc<dyn ConvergenceSender>) {
        tracing::info!(link = %sender, peer = %sender.peer_endpoint_id(), "registering peer link");
        self.senders.insert(sender.address().to_owned(), sender);
    }

    pub fn senders(&self) -> Vec<Arc<dyn ConvergenceSender>> {
        self.senders
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Closes every registered sender. Used on daemon shutdown.
    pub async fn close_all(&self) {
        for sender in self.senders() {
            if let Err(error) = sender.close().await {
                tracing::warn!(link = %sender, %error, "closing link failed");
            }
        }
        self.senders.clear();
    }
}

impl ConnectionNotifier for PeerRegistry {
    fn notify_connect(&self, peer: EndpointId) {
        tracing::info!(%peer, "peer link is up");
    }

    fn notify_disconnect(&self, address: &str) {
        if self.senders.remove(address).is_some() {
            tracing::info!(%address, "peer link is down, dropped from registry");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
