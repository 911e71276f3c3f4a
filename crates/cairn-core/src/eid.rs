//! Endpoint identifiers — the addressing values naming bundle sources,
//! destinations, and nodes.
//!
//! Two forms exist on the wire: the null endpoint `dtn:none`, and node
//! endpoints of the shape `dtn://node-name/demux`. An endpoint ID always
//! serializes as its string form, so descriptors and bundles embed it
//! without a second encoding.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An endpoint identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EndpointId {
    /// The null endpoint, `dtn:none`. Bundles from nowhere, reports to no one.
    None,
    /// A `dtn://node/demux` endpoint. `demux` may be empty for a bare node ID.
    Dtn { node: String, demux: String },
}

impl EndpointId {
    /// The null endpoint.
    pub fn none() -> Self {
        EndpointId::None
    }

    /// A node endpoint with an empty demux part, e.g. `dtn://alpha/`.
    pub fn node(name: &str) -> Result<Self, EidError> {
        if name.is_empty() {
            return Err(EidError::MissingNodeName);
        }
        if name.contains('/') {
            return Err(EidError::InvalidNodeName(name.to_string()));
        }
        Ok(EndpointId::Dtn {
            node: name.to_string(),
            demux: String::new(),
        })
    }

    /// Is this the null endpoint?
    pub fn is_none(&self) -> bool {
        matches!(self, EndpointId::None)
    }

    /// The node-name part, if any.
    pub fn node_name(&self) -> Option<&str> {
        match self {
            EndpointId::None => None,
            EndpointId::Dtn { node, .. } => Some(node),
        }
    }

    /// True when both endpoints name the same node, ignoring the demux part.
    pub fn same_node(&self, other: &EndpointId) -> bool {
        match (self.node_name(), other.node_name()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointId::None => write!(f, "dtn:none"),
            EndpointId::Dtn { node, demux } => write!(f, "dtn://{node}/{demux}"),
        }
    }
}

impl FromStr for EndpointId {
    type Err = EidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "dtn:none" {
            return Ok(EndpointId::None);
        }
        let rest = s
            .strip_prefix("dtn://")
            .ok_or_else(|| EidError::UnsupportedScheme(s.to_string()))?;
        let (node, demux) = match rest.split_once('/') {
            Some((node, demux)) => (node, demux),
            None => (rest, ""),
        };
        if node.is_empty() {
            return Err(EidError::MissingNodeName);
        }
        Ok(EndpointId::Dtn {
            node: node.to_string(),
            demux: demux.to_string(),
        })
    }
}

impl Serialize for EndpointId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EndpointId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EidError {
    #[error("unsupported endpoint scheme in {0:?}, expected dtn:none or dtn://")]
    UnsupportedScheme(String),

    #[error("endpoint has no node name")]
    MissingNodeName,

    #[error("invalid node name {0:?}")]
    InvalidNodeName(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
