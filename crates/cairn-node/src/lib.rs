//! cairn-node — bundle storage, routing, the convergence layer, and the
//! forwarding engine of a cairn node.

pub mod cla;
pub mod processing;
pub mod routing;
pub mod store;

pub use cla::{ClaError, ConnectionNotifier, ConvergenceSender, PeerRegistry};
pub use processing::ForwardingEngine;
pub use routing::{EpidemicRouting, RoutingAgent};
pub use store::{BundleDescriptor, BundleStore, Constraint, MemoryStore, StoreError};
