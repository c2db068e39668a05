//! Payload codecs negotiated per link

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::Envelope;

/// Payload serialization of a link, picked during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkProtocol {
    /// UTF-8 JSON
    Json,
    /// MessagePack with named fields
    Msgpack,
}

impl LinkProtocol {
    /// All supported protocols in default preference order
    pub const ALL: [LinkProtocol; 2] = [LinkProtocol::Json, LinkProtocol::Msgpack];

    /// Identifier offered and accepted on the wire
    pub fn id(&self) -> &'static str {
        match self {
            LinkProtocol::Json => "wolfmesh-json",
            LinkProtocol::Msgpack => "wolfmesh-msgpack",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.id() == id)
    }

    /// Pick the first protocol in `preference` the peer offered
    pub fn select(preference: &[LinkProtocol], offered: &[String]) -> Option<LinkProtocol> {
        preference
            .iter()
            .copied()
            .find(|p| offered.iter().any(|o| o == p.id()))
    }

    pub fn encode(&self, envelope: &Envelope) -> Result<Bytes> {
        let payload = match self {
            LinkProtocol::Json => serde_json::to_vec(envelope)?,
            LinkProtocol::Msgpack => rmp_serde::to_vec_named(envelope)
                .map_err(|e| Error::Codec(format!("msgpack encode: {}", e)))?,
        };
        Ok(Bytes::from(payload))
    }

    pub fn decode(&self, payload: &[u8]) -> Result<Envelope> {
        match self {
            LinkProtocol::Json => serde_json::from_slice(payload)
                .map_err(|e| Error::Codec(format!("json decode: {}", e))),
            LinkProtocol::Msgpack => rmp_serde::from_slice(payload)
                .map_err(|e| Error::Codec(format!("msgpack decode: {}", e))),
        }
    }
}

impl fmt::Display for LinkProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for LinkProtocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" | "wolfmesh-json" => Ok(LinkProtocol::Json),
            "msgpack" | "wolfmesh-msgpack" => Ok(LinkProtocol::Msgpack),
            other => Err(Error::Config(format!("unknown link protocol: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn offered(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_select_follows_server_preference() {
        let both = offered(&["wolfmesh-msgpack", "wolfmesh-json"]);
        assert_eq!(LinkProtocol::select(&LinkProtocol::ALL, &both), Some(LinkProtocol::Json));
        assert_eq!(
            LinkProtocol::select(&[LinkProtocol::Msgpack, LinkProtocol::Json], &both),
            Some(LinkProtocol::Msgpack)
        );
        assert_eq!(LinkProtocol::select(&[LinkProtocol::Json], &offered(&["wolfmesh-msgpack"])), None);
        assert_eq!(LinkProtocol::select(&LinkProtocol::ALL, &offered(&["smtp"])), None);
    }

    #[test]
    fn test_payload_survives_both_codecs() {
        let envelope = Envelope::new(
            "topology.update",
            json!({ "baseRevision": 3, "revision": 4, "changes": [{ "type": "delete", "nodeId": "n1" }], "ratio": 0.5, "flag": null }),
        );
        for protocol in LinkProtocol::ALL {
            let bytes = protocol.encode(&envelope).unwrap();
            assert_eq!(protocol.decode(&bytes).unwrap(), envelope, "{}", protocol);
        }
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(LinkProtocol::Json.decode(b"\xff\x00").is_err());
        assert!(LinkProtocol::Msgpack.decode(b"{\"event\":").is_err());
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("json".parse::<LinkProtocol>().unwrap(), LinkProtocol::Json);
        assert_eq!("wolfmesh-msgpack".parse::<LinkProtocol>().unwrap(), LinkProtocol::Msgpack);
        assert!("xml".parse::<LinkProtocol>().is_err());
        assert_eq!(LinkProtocol::from_id("wolfmesh-json"), Some(LinkProtocol::Json));
    }
}
