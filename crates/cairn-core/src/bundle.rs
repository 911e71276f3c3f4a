//! The bundle model — primary block, canonical (extension) blocks, and the
//! small mutation surface the forwarding machinery needs.
//!
//! A bundle is treated as opaque cargo: the node reads and replaces a handful
//! of named extension blocks and otherwise never looks inside the payload.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::eid::EndpointId;

/// Bundle protocol version carried in every primary block.
pub const BP_VERSION: u64 = 7;

/// Default bundle lifetime: 24 hours, in milliseconds.
pub const DEFAULT_LIFETIME_MS: u64 = 24 * 60 * 60 * 1000;

/// Seconds between the Unix epoch and the DTN epoch (2000-01-01 00:00:00 UTC).
const DTN_EPOCH_OFFSET_SECS: u64 = 946_684_800;

/// Well-known block type tags.
pub mod block_type {
    /// The payload block. Always block number 1.
    pub const PAYLOAD: u64 = 1;
    /// Previous-node block: the endpoint ID of the forwarding node.
    pub const PREVIOUS_NODE: u64 = 6;
    /// Bundle-age block: milliseconds the bundle has existed.
    pub const BUNDLE_AGE: u64 = 7;
    /// Hop-count block: limit and current count.
    pub const HOP_COUNT: u64 = 10;
}

// ── Timestamps and IDs ────────────────────────────────────────────────────────

/// Milliseconds since the DTN epoch.
pub fn dtn_time_now() -> u64 {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    dtn_time_from_unix_ms(unix.as_millis() as u64)
}

/// Unix milliseconds to DTN milliseconds. A host clock reading before
/// 2000-01-01 clamps to zero instead of underflowing.
fn dtn_time_from_unix_ms(unix_ms: u64) -> u64 {
    unix_ms.saturating_sub(DTN_EPOCH_OFFSET_SECS * 1000)
}

/// Creation timestamp: DTN time plus a sequence number disambiguating
/// bundles created within the same millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CreationTimestamp {
    pub dtn_time_ms: u64,
    pub sequence: u64,
}

impl CreationTimestamp {
    pub fn now(sequence: u64) -> Self {
        Self {
            dtn_time_ms: dtn_time_now(),
            sequence,
        }
    }
}

/// The globally unique bundle identifier: source endpoint, creation
/// timestamp, and (for fragments, which this node never produces) the
/// fragment offset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BundleId {
    pub source: EndpointId,
    pub timestamp: CreationTimestamp,
    pub fragment_offset: Option<u64>,
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}-{}",
            self.source, self.timestamp.dtn_time_ms, self.timestamp.sequence
        )?;
        if let Some(offset) = self.fragment_offset {
            write!(f, "+{offset}")?;
        }
        Ok(())
    }
}

// ── Blocks ────────────────────────────────────────────────────────────────────

/// Typed contents of a canonical block. Anything the node does not interpret
/// stays byte-opaque in `Unrecognized` and survives re-encoding untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BlockData {
    Payload(Vec<u8>),
    PreviousNode(EndpointId),
    BundleAge(u64),
    HopCount { limit: u64, count: u64 },
    Unrecognized(Vec<u8>),
}

/// A canonical (extension) block: type tag, per-bundle block number, flags,
/// and the block data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalBlock {
    pub block_type: u64,
    pub block_number: u64,
    pub flags: u64,
    pub data: BlockData,
}

impl CanonicalBlock {
    /// The payload block. Always block number 1.
    pub fn payload(data: Vec<u8>) -> Self {
        Self {
            block_type: block_type::PAYLOAD,
            block_number: 1,
            flags: 0,
            data: BlockData::Payload(data),
        }
    }

    /// A previous-node block naming the forwarding node. Block number is
    /// assigned on insertion.
    pub fn previous_node(node: EndpointId) -> Self {
        Self {
            block_type: block_type::PREVIOUS_NODE,
            block_number: 0,
            flags: 0,
            data: BlockData::PreviousNode(node),
        }
    }

    /// A bundle-age block.
    pub fn bundle_age(age_ms: u64) -> Self {
        Self {
            block_type: block_type::BUNDLE_AGE,
            block_number: 0,
            flags: 0,
            data: BlockData::BundleAge(age_ms),
        }
    }

    /// A hop-count block.
    pub fn hop_count(limit: u64, count: u64) -> Self {
        Self {
            block_type: block_type::HOP_COUNT,
            block_number: 0,
            flags: 0,
            data: BlockData::HopCount { limit, count },
        }
    }
}

/// The primary block: immutable-for-life addressing and lifetime data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimaryBlock {
    pub version: u64,
    pub flags: u64,
    pub destination: EndpointId,
    pub source: EndpointId,
    pub report_to: EndpointId,
    pub creation_timestamp: CreationTimestamp,
    pub lifetime_ms: u64,
}

// ── Bundle ────────────────────────────────────────────────────────────────────

/// Sequence counter for bundles created by this process. Distinguishes
/// bundles whose creation falls in the same millisecond.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A bundle: one primary block and an ordered sequence of canonical blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    pub primary: PrimaryBlock,
    pub blocks: Vec<CanonicalBlock>,
}

impl Bundle {
    /// A well-formed bundle carrying `payload` from `source` to
    /// `destination`, with default flags and lifetime.
    pub fn new(source: EndpointId, destination: EndpointId, payload: Vec<u8>) -> Self {
        let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        Self {
            primary: PrimaryBlock {
                version: BP_VERSION,
                flags: 0,
                destination,
                source,
                report_to: EndpointId::none(),
                creation_timestamp: CreationTimestamp::now(sequence),
                lifetime_ms: DEFAULT_LIFETIME_MS,
            },
            blocks: vec![CanonicalBlock::payload(payload)],
        }
    }

    /// The bundle's globally unique identifier.
    pub fn id(&self) -> BundleId {
        BundleId {
            source: self.primary.source.clone(),
            timestamp: self.primary.creation_timestamp,
            fragment_offset: None,
        }
    }

    /// First extension block with the given type tag.
    pub fn extension_block(&self, block_type: u64) -> Option<&CanonicalBlock> {
        self.blocks.iter().find(|b| b.block_type == block_type)
    }

    /// Remove the block with the given block number. No-op if absent.
    pub fn remove_block_by_number(&mut self, block_number: u64) {
        self.blocks.retain(|b| b.block_number != block_number);
    }

    /// Insert an extension block, assigning the next free block number.
    /// The payload block keeps number 1; everything else numbers upward
    /// from 2. Returns the assigned number.
    pub fn add_extension_block(&mut self, mut block: CanonicalBlock) -> u64 {
        let next = self
            .blocks
            .iter()
            .map(|b| b.block_number)
            .max()
            .unwrap_or(1)
            .max(1)
            + 1;
        block.block_number = next;
        self.blocks.push(block);
        next
    }

    /// The payload bytes, if a payload block is present.
    pub fn payload(&self) -> Option<&[u8]> {
        self.blocks.iter().find_map(|b| match &b.data {
            BlockData::Payload(data) if b.block_type == block_type::PAYLOAD => {
                Some(data.as_slice())
            }
            _ => None,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
