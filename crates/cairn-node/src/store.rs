//! Bundle storage — retention constraints, descriptors, and the store contract.
//!
//! A bundle stays in storage for as long as its constraint set is non-empty.
//! Every mutation of a descriptor must be durable before the call returns, so
//! [`MemoryStore`] rewrites its snapshot on each change and rolls the change
//! back if the snapshot cannot be written.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use cairn_core::bundle::{Bundle, BundleId};
use cairn_core::eid::EndpointId;

// ── Constraints ──────────────────────────────────────────────────────────────

/// A reason why a bundle must be retained in storage.
///
/// A bundle is eligible for deletion only once no constraint remains on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    /// The bundle has arrived and awaits a dispatch decision.
    DispatchPending,
    /// The bundle has been selected for forwarding and transmission is
    /// in progress.
    ForwardPending,
    /// The bundle is a fragment awaiting its siblings.
    ReassemblyPending,
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::DispatchPending => write!(f, "dispatch pending"),
            Constraint::ForwardPending => write!(f, "forwarding pending"),
            Constraint::ReassemblyPending => write!(f, "reassembly pending"),
        }
    }
}

// ── Descriptors ──────────────────────────────────────────────────────────────

/// Bookkeeping record the store keeps per bundle, separate from the bundle
/// content itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleDescriptor {
    pub id: BundleId,
    pub destination: EndpointId,
    pub constraints: HashSet<Constraint>,
    /// Peers that have already received this bundle from us.
    pub already_sent: Vec<EndpointId>,
}

impl BundleDescriptor {
    pub fn has_constraint(&self, constraint: Constraint) -> bool {
        self.constraints.contains(&constraint)
    }

    /// Whether any constraint still holds the bundle in storage.
    pub fn retained(&self) -> bool {
        !self.constraints.is_empty()
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("bundle {0} not found in store")]
    NotFound(BundleId),
    #[error("snapshot write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ── Store contract ───────────────────────────────────────────────────────────

/// Storage collaborator of the forwarding engine.
///
/// Calls are synchronous and atomic per bundle: when a mutating call returns
/// `Ok`, the change has been committed durably. Implementations must be safe
/// to share across tasks.
pub trait BundleStore: Send + Sync {
    /// Stores a new bundle under the [`Constraint::DispatchPending`]
    /// constraint and returns its descriptor. Re-inserting a known bundle id
    /// is a no-op that returns the existing descriptor.
    fn insert(&self, bundle: Bundle) -> Result<BundleDescriptor, StoreError>;

    /// Returns a copy of the stored bundle content.
    fn load(&self, id: &BundleId) -> Result<Bundle, StoreError>;

    /// Descriptors of all bundles currently marked
    /// [`Constraint::DispatchPending`].
    fn get_dispatchable(&self) -> Result<Vec<BundleDescriptor>, StoreError>;

    /// Returns a copy of the bundle's current descriptor.
    fn descriptor(&self, id: &BundleId) -> Result<BundleDescriptor, StoreError>;

    /// Adds a constraint. Adding one that is already present is a no-op.
    fn add_constraint(&self, id: &BundleId, constraint: Constraint) -> Result<(), StoreError>;

    /// Removes a constraint. Removing one that is absent is a no-op.
    fn remove_constraint(&self, id: &BundleId, constraint: Constraint) -> Result<(), StoreError>;

    /// Clears all constraints, releasing the bundle for eventual deletion.
    fn reset_constraints(&self, id: &BundleId) -> Result<(), StoreError>;

    /// Records that `peer` has received this bundle from us. The set only
    /// grows; recording a peer twice keeps a single entry.
    fn add_already_sent(&self, id: &BundleId, peer: EndpointId) -> Result<(), StoreError>;
}

// ── In-memory store ──────────────────────────────────────────────────────────

struct StoredEntry {
    /// Bundle content. `None` after a snapshot reload, since the snapshot
    /// only records descriptors.
    bundle: Option<Bundle>,
    descriptor: BundleDescriptor,
}

/// Hash-map backed store with optional descriptor snapshots on disk.
///
/// The snapshot is rewritten on every mutation so that constraint and
/// already-sent state survives a restart. Bundle payloads live only in
/// memory; after a reload, [`BundleStore::load`] reports the content as
/// missing.
pub struct MemoryStore {
    entries: Mutex<HashMap<BundleId, StoredEntry>>,
    snapshot_path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            snapshot_path: None,
        }
    }

    /// Creates a store that snapshots descriptors to `path`, reloading any
    /// existing snapshot. An unreadable snapshot is logged and skipped.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut entries = HashMap::new();
        match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Vec<BundleDescriptor>>(&raw) {
                Ok(descriptors) => {
                    for descriptor in descriptors {
                        let id = descriptor.id.clone();
                        entries.insert(
                            id,
                            StoredEntry {
                                bundle: None,
                                descriptor,
                            },
                        );
                    }
                    tracing::info!(
                        path = %path.display(),
                        bundles = entries.len(),
                        "reloaded store snapshot"
                    );
                }
                Err(error) => {
                    tracing::warn!(
                        path = %path.display(),
                        %error,
                        "store snapshot is unreadable, starting empty"
                    );
                }
            },
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    %error,
                    "could not read store snapshot, starting empty"
                );
            }
        }
        Self {
            entries: Mutex::new(entries),
            snapshot_path: Some(path),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<BundleId, StoredEntry>> {
        self.entries.lock().expect("store mutex poisoned")
    }

    fn persist(&self, entries: &HashMap<BundleId, StoredEntry>) -> Result<(), StoreError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let descriptors: Vec<&BundleDescriptor> =
            entries.values().map(|entry| &entry.descriptor).collect();
        let raw = serde_json::to_string_pretty(&descriptors)?;
        fs::write(path, raw)?;
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BundleStore for MemoryStore {
    fn insert(&self, bundle: Bundle) -> Result<BundleDescriptor, StoreError> {
        let id = bundle.id();
        let mut entries = self.entries();
        if let Some(entry) = entries.get(&id) {
            tracing::debug!(bundle = %id, "bundle already stored, keeping existing descriptor");
            return Ok(entry.descriptor.clone());
        }
        let descriptor = BundleDescriptor {
            id: id.clone(),
            destination: bundle.primary.destination.clone(),
            constraints: HashSet::from([Constraint::DispatchPending]),
            already_sent: Vec::new(),
        };
        entries.insert(
            id.clone(),
            StoredEntry {
                bundle: Some(bundle),
                descriptor: descriptor.clone(),
            },
        );
        if let Err(error) = self.persist(&entries) {
            entries.remove(&id);
            return Err(error);
        }
        Ok(descriptor)
    }

    fn load(&self, id: &BundleId) -> Result<Bundle, StoreError> {
        let entries = self.entries();
        let entry = entries
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        entry
            .bundle
            .clone()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    fn get_dispatchable(&self) -> Result<Vec<BundleDescriptor>, StoreError> {
        let entries = self.entries();
        Ok(entries
            .values()
            .filter(|entry| entry.descriptor.has_constraint(Constraint::DispatchPending))
            .map(|entry| entry.descriptor.clone())
            .collect())
    }

    fn descriptor(&self, id: &BundleId) -> Result<BundleDescriptor, StoreError> {
        let entries = self.entries();
        entries
            .get(id)
            .map(|entry| entry.descriptor.clone())
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    fn add_constraint(&self, id: &BundleId, constraint: Constraint) -> Result<(), StoreError> {
        let mut entries = self.entries();
        let was_present = {
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            !entry.descriptor.constraints.insert(constraint)
        };
        if let Err(error) = self.persist(&entries) {
            if !was_present {
                if let Some(entry) = entries.get_mut(id) {
                    entry.descriptor.constraints.remove(&constraint);
                }
            }
            return Err(error);
        }
        Ok(())
    }

    fn remove_constraint(&self, id: &BundleId, constraint: Constraint) -> Result<(), StoreError> {
        let mut entries = self.entries();
        let was_present = {
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            entry.descriptor.constraints.remove(&constraint)
        };
        if let Err(error) = self.persist(&entries) {
            if was_present {
                if let Some(entry) = entries.get_mut(id) {
                    entry.descriptor.constraints.insert(constraint);
                }
            }
            return Err(error);
        }
        Ok(())
    }

    fn reset_constraints(&self, id: &BundleId) -> Result<(), StoreError> {
        let mut entries = self.entries();
        let previous = {
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            std::mem::take(&mut entry.descriptor.constraints)
        };
        if let Err(error) = self.persist(&entries) {
            if let Some(entry) = entries.get_mut(id) {
                entry.descriptor.constraints = previous;
            }
            return Err(error);
        }
        Ok(())
    }

    fn add_already_sent(&self, id: &BundleId, peer: EndpointId) -> Result<(), StoreError> {
        let mut entries = self.entries();
        let added = {
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            if entry.descriptor.already_sent.contains(&peer) {
                false
            } else {
                entry.descriptor.already_sent.push(peer);
                true
            }
        };
        if let Err(error) = self.persist(&entries) {
            if added {
                if let Some(entry) = entries.get_mut(id) {
                    entry.descriptor.already_sent.pop();
                }
            }
            return Err(error);
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
