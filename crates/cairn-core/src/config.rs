//! Configuration for a cairn node.
//!
//! Resolution order: explicit path argument → $CAIRN_CONFIG → defaults.
//! Every section tolerates being absent from the file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::eid::EndpointId;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub store: StoreSection,
    pub mtcp: MtcpSection,
    pub dispatch: DispatchSection,
    pub peers: Vec<PeerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// This node's own endpoint identity, stamped into previous-node blocks.
    pub endpoint_id: EndpointId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Descriptor snapshot file. None = in-memory only.
    pub snapshot_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MtcpSection {
    /// Listen address for inbound bundle connections.
    pub listen_addr: String,
    /// Seconds between keepalive probes on outbound connections.
    pub keepalive_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    /// Seconds between dispatch sweeps over the store.
    pub interval_secs: u64,
}

/// A statically configured outbound peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerEntry {
    /// host:port of the peer's mtcp listener.
    pub address: String,
    /// The peer's endpoint identity, if known. None = anonymous peer.
    pub endpoint_id: Option<EndpointId>,
    /// Permanent peers are reconnection candidates and never pruned.
    pub permanent: bool,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            endpoint_id: EndpointId::node("cairn").expect("default node name is valid"),
        }
    }
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            snapshot_path: None,
        }
    }
}

impl Default for MtcpSection {
    fn default() -> Self {
        Self {
            // 4556 is the registered DTN convergence-layer port.
            listen_addr: "0.0.0.0:4556".to_string(),
            keepalive_secs: 5,
        }
    }
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self { interval_secs: 10 }
    }
}

impl Default for PeerEntry {
    fn default() -> Self {
        Self {
            address: String::new(),
            endpoint_id: None,
            permanent: false,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl NodeConfig {
    /// Load from an explicit TOML file path.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Load from $CAIRN_CONFIG if set and present, else defaults.
    pub fn load_default() -> Result<Self, ConfigError> {
        match std::env::var("CAIRN_CONFIG") {
            Ok(path) => Self::load(Path::new(&path)),
            Err(_) => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = NodeConfig::default();
        assert_eq!(config.node.endpoint_id.to_string(), "dtn://cairn/");
        assert_eq!(config.mtcp.listen_addr, "0.0.0.0:4556");
        assert_eq!(config.mtcp.keepalive_secs, 5);
        assert_eq!(config.dispatch.interval_secs, 10);
        assert!(config.peers.is_empty());
        assert!(config.store.snapshot_path.is_none());
    }

    #[test]
    fn parses_partial_file() {
        let text = r#"
            [node]
            endpoint_id = "dtn://ridge/"

            [[peers]]
            address = "10.1.0.2:4556"
            endpoint_id = "dtn://saddle/"
            permanent = true
        "#;
        let config: NodeConfig = toml::from_str(text).unwrap();
        assert_eq!(config.node.endpoint_id.to_string(), "dtn://ridge/");
        // Unspecified sections fall back to defaults.
        assert_eq!(config.dispatch.interval_secs, 10);
        assert_eq!(config.peers.len(), 1);
        assert!(config.peers[0].permanent);
        assert_eq!(
            config.peers[0].endpoint_id.as_ref().unwrap().to_string(),
            "dtn://saddle/"
        );
    }

    #[test]
    fn load_reports_missing_file() {
        let err = NodeConfig::load(Path::new("/nonexistent/cairn.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFailed(_, _)));
    }
}
