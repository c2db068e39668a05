//! Node identity

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identity of one cluster participant.
///
/// A `Node` is either fully valid or not constructed: the id and address are
/// non-empty and the port is positive. Fields are read-only once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "NodeInfo")]
pub struct Node {
    id: String,
    address: String,
    port: u16,
}

/// Unvalidated node record as it appears on the wire
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub port: Option<PortValue>,
}

/// Ports are accepted as numbers or numeric strings
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PortValue {
    Number(i64),
    Text(String),
}

impl PortValue {
    fn resolve(&self) -> Option<u16> {
        let port = match self {
            PortValue::Number(n) => *n,
            PortValue::Text(s) => s.trim().parse::<i64>().ok()?,
        };
        if port > 0 {
            u16::try_from(port).ok()
        } else {
            None
        }
    }
}

impl Node {
    /// Create a validated node
    pub fn new(id: impl Into<String>, address: impl Into<String>, port: u16) -> Result<Self> {
        let id = id.into();
        let address = address.into();
        if id.is_empty() {
            return Err(Error::InvalidNode("missing id".into()));
        }
        if address.is_empty() {
            return Err(Error::InvalidNode(format!("{}: missing address", id)));
        }
        if port == 0 {
            return Err(Error::InvalidNode(format!("{}: port must be positive", id)));
        }
        Ok(Self { id, address, port })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` pair used to dial the node
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Link transport endpoint
    pub fn link_uri(&self) -> String {
        format!("tcp://{}:{}", self.address, self.port)
    }

    /// Diagnostic HTTP endpoint
    pub fn api_uri(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }
}

impl TryFrom<NodeInfo> for Node {
    type Error = Error;

    fn try_from(info: NodeInfo) -> Result<Self> {
        let id = info.id.filter(|s| !s.is_empty())
            .ok_or_else(|| Error::InvalidNode("missing id".into()))?;
        let address = info.address.filter(|s| !s.is_empty())
            .ok_or_else(|| Error::InvalidNode(format!("{}: missing address", id)))?;
        let port = info.port.as_ref()
            .and_then(PortValue::resolve)
            .ok_or_else(|| Error::InvalidNode(format!("{}: invalid port", id)))?;
        Node::new(id, address, port)
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_uris() {
        let node = Node::new("node-1", "10.0.0.5", 7400).unwrap();
        assert_eq!(node.endpoint(), "10.0.0.5:7400");
        assert_eq!(node.link_uri(), "tcp://10.0.0.5:7400");
        assert_eq!(node.api_uri(), "http://10.0.0.5:7400");
    }

    #[test]
    fn test_node_rejects_invalid_input() {
        assert!(Node::new("", "localhost", 1).is_err());
        assert!(Node::new("a", "", 1).is_err());
        assert!(Node::new("a", "localhost", 0).is_err());

        let missing_id = serde_json::from_value::<Node>(json!({ "address": "localhost", "port": 1 }));
        assert!(missing_id.is_err());

        let bad_port = serde_json::from_value::<Node>(json!({ "id": "a", "address": "localhost", "port": "abc" }));
        assert!(bad_port.is_err());

        let negative = serde_json::from_value::<Node>(json!({ "id": "a", "address": "localhost", "port": -3 }));
        assert!(negative.is_err());
    }

    #[test]
    fn test_node_accepts_numeric_string_port() {
        let node: Node = serde_json::from_value(json!({ "id": "a", "address": "localhost", "port": "2001" })).unwrap();
        assert_eq!(node.port(), 2001);

        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value, json!({ "id": "a", "address": "localhost", "port": 2001 }));
    }
}
