//! Replication payloads
//!
//! Full snapshots (`topology.reload`) and incremental batches
//! (`topology.update`) exchanged between the master and its members.

use serde::{Deserialize, Deserializer, Serialize};

use super::node::Node;

/// Version tag carried by every snapshot
pub const TOPOLOGY_VERSION: &str = "wm0";

/// One membership change, coalesced per node id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Change {
    Insert {
        node: Node,
    },
    Update {
        node: Node,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<Node>,
    },
    Delete {
        #[serde(rename = "nodeId")]
        node_id: String,
    },
}

impl Change {
    /// Id of the node this change refers to
    pub fn node_id(&self) -> &str {
        match self {
            Change::Insert { node } | Change::Update { node, .. } => node.id(),
            Change::Delete { node_id } => node_id,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Change::Insert { .. } => "insert",
            Change::Update { .. } => "update",
            Change::Delete { .. } => "delete",
        }
    }
}

/// A flushed batch of changes, the unit broadcast to members
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBatch {
    #[serde(deserialize_with = "deserialize_revision")]
    pub base_revision: u64,
    #[serde(deserialize_with = "deserialize_revision")]
    pub revision: u64,
    pub changes: Vec<Change>,
}

/// Full topology as served by `GET /topology` and `topology.reload`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub v: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub master: Option<String>,
    #[serde(deserialize_with = "deserialize_revision")]
    pub revision: u64,
    pub nodes: Vec<Node>,
}

impl TopologySnapshot {
    /// Look up a node in the snapshot
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id() == id)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RevisionValue {
    Number(u64),
    Text(String),
}

/// Revisions are accepted as non-negative integers or numeric strings
fn deserialize_revision<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match RevisionValue::deserialize(deserializer)? {
        RevisionValue::Number(n) => Ok(n),
        RevisionValue::Text(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom(format!("unparsable revision: {:?}", s))),
    }
}
