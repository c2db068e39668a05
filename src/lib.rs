//! WolfMesh - Self-Organising Service Cluster
//!
//! Nodes discover each other through a bootstrap list, elect a single master
//! and keep a replicated view of the cluster topology.
//!
//! # Architecture
//!
//! Every node runs a [`connector`] that owns the local [`topology`]. The
//! master accepts links from the other nodes and pushes topology changes to
//! them; members follow along and elect a new master when the current one
//! stays unreachable. Links share the node's port with a small HTTP API used
//! for bootstrapping and diagnostics.
//!
//! # Features
//!
//! - Bootstrap from any reachable node's `GET /topology`
//! - Deterministic master election on failover
//! - Incremental topology replication with full-snapshot recovery
//! - Length-prefixed links with JSON or MessagePack codecs
//! - Bounded send queues with per-message expiry
//! - Automatic reconnection with a backoff schedule

pub mod config;
pub mod error;
pub mod topology;
pub mod protocol;
pub mod network;
pub mod connector;
pub mod api;

pub use config::WolfMeshConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfMeshConfig;
    pub use crate::connector::{Connector, ConnectorHandle, Notification, StateInfo, StateName};
    pub use crate::error::{Error, Result};
    pub use crate::protocol::{Envelope, Message};
    pub use crate::topology::{Node, Topology, TopologySnapshot, UpdateBatch};
}
