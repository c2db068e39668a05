//! Network Module
//!
//! Node-to-node links over TCP. Links are length-framed, negotiate a payload
//! codec on connect and share the listening port with the HTTP API.

mod backoff;
mod codec;
mod frame;
pub mod handshake;
mod inbound;
mod outbound;
mod server;
mod synapse;

pub use backoff::{Backoff, Retry, DEFAULT_BACKOFF_MS};
pub use codec::LinkProtocol;
pub use frame::{FrameCodec, FRAME_HEADER_LEN, MAX_FRAME_LEN};
pub use inbound::{InboundConfig, LinkConnection};
pub use outbound::{NodeLink, OutboundConfig, ReconnectPhase};
pub use server::{LinkRequest, MeshServer};
pub use synapse::{CloseReason, Completion, SendOptions, SendQueue, SendStatus, Synapse, SynapseEvent};

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::protocol::Envelope;
use crate::topology::Node;

/// Identifies one link for the lifetime of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Events raised by link tasks
#[derive(Debug)]
pub enum LinkEvent {
    /// Outbound link connected and negotiated
    Up,
    /// Outbound link lost its transport
    Down,
    /// Outbound link ran out of reconnect attempts
    Timeout,
    /// Inbound peer announced itself
    Identified(Node),
    /// Decoded payload from the peer
    Message(Envelope),
    /// Identified inbound peer went away
    Disconnected,
}

/// Channel link tasks report on
pub type LinkEventSender = mpsc::UnboundedSender<(LinkId, LinkEvent)>;

/// Instructions for a link task
#[derive(Debug)]
pub enum LinkCommand {
    Send {
        envelope: Envelope,
        options: SendOptions,
        done: Option<Completion>,
    },
    /// Stop reconnecting once the current transport is lost
    DisableReconnect,
    Close,
}

/// Owner's handle to a running link task
#[derive(Debug, Clone)]
pub struct LinkHandle {
    id: LinkId,
    commands: mpsc::UnboundedSender<LinkCommand>,
}

impl LinkHandle {
    pub(crate) fn new(id: LinkId, commands: mpsc::UnboundedSender<LinkCommand>) -> Self {
        Self { id, commands }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Queue a message; false once the link task is gone
    pub fn send(&self, envelope: Envelope) -> bool {
        self.commands
            .send(LinkCommand::Send { envelope, options: SendOptions::default(), done: None })
            .is_ok()
    }

    /// Queue a message and get notified when it is written or dropped
    pub fn send_with(&self, envelope: Envelope, options: SendOptions) -> oneshot::Receiver<Result<()>> {
        let (done, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(LinkCommand::Send { done: Some(done), .. })) =
            self.commands.send(LinkCommand::Send { envelope, options, done: Some(done) })
        {
            let _ = done.send(Err(Error::LinkClosed));
        }
        rx
    }

    pub fn disable_reconnect(&self) {
        let _ = self.commands.send(LinkCommand::DisableReconnect);
    }

    pub fn close(&self) {
        let _ = self.commands.send(LinkCommand::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Largest frame accepted while a link is still negotiating
pub const MAX_HANDSHAKE_FRAME_LEN: usize = 4096;

/// Read one frame payload without buffering past it
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    read_frame_limited(reader, MAX_FRAME_LEN).await
}

/// Read one frame payload, refusing headers that announce more than `max` bytes
pub async fn read_frame_limited<R: AsyncRead + Unpin>(reader: &mut R, max: usize) -> Result<Vec<u8>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let len = FrameCodec::frame_len(header);
    if len > max {
        return Err(Error::Frame(format!("frame of {} bytes exceeds {} byte limit", len, max)));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Write one framed payload
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let frame = FrameCodec::frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
