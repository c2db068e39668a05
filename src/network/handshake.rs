//! Link Handshake
//!
//! The dialing side opens with a JSON frame listing the protocols it speaks.
//! The accepting side answers with the protocol it picked, or an error after
//! which it closes the connection. Every later frame on the link uses the
//! picked protocol.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::codec::LinkProtocol;
use super::{read_frame_limited, write_frame, MAX_HANDSHAKE_FRAME_LEN};
use crate::error::{Error, Result};

/// Rejection reason for links a non-master cannot serve
pub const REJECT_NOT_SUPPORTED: &str = "Not Supported";

/// Rejection reason when no offered protocol is acceptable
pub const REJECT_UNSUPPORTED_PROTOCOL: &str = "Unsupported Protocol";

/// First frame sent by the dialing side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub protocols: Vec<String>,
}

/// Answer to a [`Hello`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HelloReply {
    Accepted { protocol: String },
    Rejected { error: String },
}

/// Open a link to `endpoint`, offering a single protocol
pub async fn dial(endpoint: &str, protocol: LinkProtocol, connect_timeout: Duration) -> Result<TcpStream> {
    let result = timeout(connect_timeout, async {
        let mut stream = TcpStream::connect(endpoint).await.map_err(|e| Error::ConnectionFailed {
            address: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        stream.set_nodelay(true)?;
        offer(&mut stream, protocol).await?;
        Ok::<_, Error>(stream)
    })
    .await;

    match result {
        Ok(inner) => inner,
        Err(_) => Err(Error::ConnectionTimeout(endpoint.to_string())),
    }
}

/// Client half of the handshake over an already connected stream
pub async fn offer<S>(stream: &mut S, protocol: LinkProtocol) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = Hello { protocols: vec![protocol.id().to_string()] };
    write_frame(stream, &serde_json::to_vec(&hello)?).await?;

    let reply = read_frame_limited(stream, MAX_HANDSHAKE_FRAME_LEN).await?;
    let reply: HelloReply = serde_json::from_slice(&reply)
        .map_err(|e| Error::Handshake(format!("malformed reply: {}", e)))?;

    match reply {
        HelloReply::Accepted { protocol: picked } if picked == protocol.id() => Ok(()),
        HelloReply::Accepted { protocol: picked } => {
            Err(Error::Handshake(format!("peer picked unoffered protocol {}", picked)))
        }
        HelloReply::Rejected { error } if error == REJECT_UNSUPPORTED_PROTOCOL => Err(Error::UnsupportedProtocol),
        HelloReply::Rejected { error } => Err(Error::Handshake(error)),
    }
}

/// Read the [`Hello`] frame of an incoming link
pub async fn read_hello<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Hello> {
    let frame = read_frame_limited(reader, MAX_HANDSHAKE_FRAME_LEN).await?;
    serde_json::from_slice(&frame).map_err(|e| Error::Handshake(format!("malformed hello: {}", e)))
}

/// Confirm the picked protocol
pub async fn accept<W: AsyncWrite + Unpin>(writer: &mut W, protocol: LinkProtocol) -> Result<()> {
    let reply = HelloReply::Accepted { protocol: protocol.id().to_string() };
    write_frame(writer, &serde_json::to_vec(&reply)?).await
}

/// Refuse the link; the caller closes the stream afterwards
pub async fn reject<W: AsyncWrite + Unpin>(writer: &mut W, reason: &str) -> Result<()> {
    let reply = HelloReply::Rejected { error: reason.to_string() };
    write_frame(writer, &serde_json::to_vec(&reply)?).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_offer_accepted() {
        let (mut client, mut server) = duplex(1024);

        let server_side = tokio::spawn(async move {
            let hello = read_hello(&mut server).await.unwrap();
            assert_eq!(hello.protocols, vec!["wolfmesh-msgpack".to_string()]);
            let picked = LinkProtocol::select(&LinkProtocol::ALL, &hello.protocols).unwrap();
            accept(&mut server, picked).await.unwrap();
        });

        offer(&mut client, LinkProtocol::Msgpack).await.unwrap();
        server_side.await.unwrap();
    }

    #[tokio::test]
    async fn test_offer_rejected() {
        let (mut client, mut server) = duplex(1024);

        tokio::spawn(async move {
            read_hello(&mut server).await.unwrap();
            reject(&mut server, REJECT_NOT_SUPPORTED).await.unwrap();
        });

        match offer(&mut client, LinkProtocol::Json).await {
            Err(Error::Handshake(reason)) => assert_eq!(reason, REJECT_NOT_SUPPORTED),
            other => panic!("unexpected handshake result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_offer_unsupported_protocol() {
        let (mut client, mut server) = duplex(1024);

        tokio::spawn(async move {
            let hello = read_hello(&mut server).await.unwrap();
            assert!(LinkProtocol::select(&[LinkProtocol::Json], &hello.protocols).is_none());
            reject(&mut server, REJECT_UNSUPPORTED_PROTOCOL).await.unwrap();
        });

        let result = offer(&mut client, LinkProtocol::Msgpack).await;
        assert!(matches!(result, Err(Error::UnsupportedProtocol)));
    }

    #[test]
    fn test_reply_wire_format() {
        let accepted = HelloReply::Accepted { protocol: "wolfmesh-json".into() };
        assert_eq!(serde_json::to_string(&accepted).unwrap(), r#"{"protocol":"wolfmesh-json"}"#);

        let rejected: HelloReply = serde_json::from_str(r#"{"error":"Not Supported"}"#).unwrap();
        assert_eq!(rejected, HelloReply::Rejected { error: "Not Supported".into() });
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = dial(&addr.to_string(), LinkProtocol::Json, Duration::from_secs(1)).await;
        assert!(result.is_err());
    }
}
