//! Link Protocol Messages
//!
//! Every message on a link is an [`Envelope`] `{event, data}`. The cluster
//! protocol itself uses a closed set of events, parsed into [`Message`];
//! anything else is carried through untouched as [`Message::Custom`] for the
//! layers built on top of the links.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::topology::{Node, TopologySnapshot, UpdateBatch};

/// Event name: a member announces its identity
pub const EVENT_ID: &str = "id";
/// Event name: a member reports its revision and asks for a full snapshot
pub const EVENT_STATE: &str = "state";
/// Event name: full topology snapshot
pub const EVENT_TOPOLOGY_RELOAD: &str = "topology.reload";
/// Event name: incremental topology batch
pub const EVENT_TOPOLOGY_UPDATE: &str = "topology.update";

/// Raw message as carried on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self { event: event.into(), data }
    }
}

/// Protocol messages exchanged between connectors
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Member identity, sent once after the link comes up
    Id(Node),
    /// Member revision, answered with a full snapshot
    State { revision: u64 },
    /// Full topology
    TopologyReload(TopologySnapshot),
    /// Incremental topology
    TopologyUpdate(UpdateBatch),
    /// Any other event
    Custom(Envelope),
}

#[derive(Deserialize)]
struct StatePayload {
    revision: u64,
}

impl Message {
    /// Get the event name (for logging)
    pub fn event(&self) -> &str {
        match self {
            Message::Id(_) => EVENT_ID,
            Message::State { .. } => EVENT_STATE,
            Message::TopologyReload(_) => EVENT_TOPOLOGY_RELOAD,
            Message::TopologyUpdate(_) => EVENT_TOPOLOGY_UPDATE,
            Message::Custom(envelope) => &envelope.event,
        }
    }

    /// Parse an envelope, validating the payload of protocol events
    pub fn from_envelope(envelope: Envelope) -> Result<Self> {
        match envelope.event.as_str() {
            EVENT_ID => serde_json::from_value(envelope.data)
                .map(Message::Id)
                .map_err(|e| Error::InvalidNode(e.to_string())),
            EVENT_STATE => serde_json::from_value::<StatePayload>(envelope.data)
                .map(|s| Message::State { revision: s.revision })
                .map_err(|e| Error::Codec(format!("state: {}", e))),
            EVENT_TOPOLOGY_RELOAD => serde_json::from_value(envelope.data)
                .map(Message::TopologyReload)
                .map_err(|e| Error::BadTopology(e.to_string())),
            EVENT_TOPOLOGY_UPDATE => serde_json::from_value(envelope.data)
                .map(Message::TopologyUpdate)
                .map_err(|e| Error::BadUpdate(e.to_string())),
            _ => Ok(Message::Custom(envelope)),
        }
    }

    /// Convert to the wire representation
    pub fn to_envelope(&self) -> Result<Envelope> {
        let data = match self {
            Message::Id(node) => serde_json::to_value(node)?,
            Message::State { revision } => json!({ "revision": revision }),
            Message::TopologyReload(snapshot) => serde_json::to_value(snapshot)?,
            Message::TopologyUpdate(batch) => serde_json::to_value(batch)?,
            Message::Custom(envelope) => return Ok(envelope.clone()),
        };
        Ok(Envelope::new(self.event(), data))
    }
}
