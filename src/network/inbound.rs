//! Inbound Links
//!
//! A [`LinkConnection`] serves one accepted link on the master. The peer must
//! identify itself with an `id` message before the registration timer fires,
//! otherwise the link is dropped without any event. Only identified links
//! forward messages and report a disconnect.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use super::codec::LinkProtocol;
use super::handshake;
use super::synapse::{Synapse, SynapseEvent};
use super::{LinkCommand, LinkEvent, LinkEventSender, LinkHandle, LinkId};
use crate::protocol::{Message, EVENT_ID};
use crate::topology::Node;

/// Settings for accepted links
#[derive(Debug, Clone)]
pub struct InboundConfig {
    pub registration_timeout: Duration,
    pub send_queue_max: usize,
    pub idle_timeout: Option<Duration>,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            registration_timeout: Duration::from_secs(3),
            send_queue_max: 1024,
            idle_timeout: None,
        }
    }
}

/// Inbound link task
pub struct LinkConnection<S> {
    id: LinkId,
    stream: S,
    protocol: LinkProtocol,
    config: InboundConfig,
    commands: mpsc::UnboundedReceiver<LinkCommand>,
    events: LinkEventSender,
}

impl<S> LinkConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Confirm `protocol` to the peer and serve the link
    pub fn spawn(
        id: LinkId,
        stream: S,
        protocol: LinkProtocol,
        config: InboundConfig,
        events: LinkEventSender,
    ) -> LinkHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = LinkConnection { id, stream, protocol, config, commands: rx, events };
        tokio::spawn(connection.run());
        LinkHandle::new(id, tx)
    }

    async fn run(mut self) {
        if let Err(e) = handshake::accept(&mut self.stream, self.protocol).await {
            tracing::debug!("Link {} handshake reply failed: {}", self.id, e);
            return;
        }

        let (reader, writer) = tokio::io::split(self.stream);
        let mut synapse = Synapse::new(self.config.send_queue_max, self.config.idle_timeout);
        synapse.attach(reader, writer);

        let registration = tokio::time::sleep(self.config.registration_timeout);
        tokio::pin!(registration);
        let mut identified: Option<Node> = None;

        loop {
            tokio::select! {
                _ = &mut registration, if identified.is_none() => {
                    tracing::debug!("Link {} did not identify within {:?}", self.id, self.config.registration_timeout);
                    break;
                }
                event = synapse.next_event() => match event {
                    SynapseEvent::Message(frame) => {
                        let envelope = match self.protocol.decode(&frame) {
                            Ok(envelope) => envelope,
                            Err(e) => {
                                tracing::warn!("Link {} dropped undecodable frame: {}", self.id, e);
                                continue;
                            }
                        };
                        if identified.is_some() {
                            emit(&self.events, self.id, LinkEvent::Message(envelope));
                        } else if envelope.event == EVENT_ID {
                            match Message::from_envelope(envelope) {
                                Ok(Message::Id(node)) => {
                                    tracing::debug!("Link {} identified as {}", self.id, node);
                                    identified = Some(node.clone());
                                    emit(&self.events, self.id, LinkEvent::Identified(node));
                                }
                                Ok(_) => {}
                                Err(e) => tracing::warn!("Link {} sent a bad identity: {}", self.id, e),
                            }
                        } else {
                            tracing::trace!("Link {} ignored {} before identifying", self.id, envelope.event);
                        }
                    }
                    SynapseEvent::Closed(reason) => {
                        tracing::debug!("Link {} closed: {}", self.id, reason);
                        if identified.is_some() {
                            emit(&self.events, self.id, LinkEvent::Disconnected);
                        }
                        break;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(LinkCommand::Send { envelope, options, done }) => match self.protocol.encode(&envelope) {
                        Ok(payload) => {
                            if let Err(e) = synapse.send(payload, options, done) {
                                tracing::debug!("Link {} dropped {}: {}", self.id, envelope.event, e);
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Link {} cannot encode {}: {}", self.id, envelope.event, e);
                            if let Some(done) = done {
                                let _ = done.send(Err(e));
                            }
                        }
                    },
                    Some(LinkCommand::DisableReconnect) => {}
                    Some(LinkCommand::Close) | None => break,
                },
            }
        }

        synapse.close();
    }
}

fn emit(events: &LinkEventSender, id: LinkId, event: LinkEvent) {
    let _ = events.send((id, event));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{read_frame, write_frame};
    use crate::protocol::Envelope;
    use serde_json::json;
    use tokio::io::duplex;

    fn spawn_link(registration_ms: u64) -> (tokio::io::DuplexStream, LinkHandle, mpsc::UnboundedReceiver<(LinkId, LinkEvent)>) {
        let (client, server) = duplex(4096);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let config = InboundConfig {
            registration_timeout: Duration::from_millis(registration_ms),
            ..InboundConfig::default()
        };
        let handle = LinkConnection::spawn(LinkId(9), server, LinkProtocol::Json, config, events_tx);
        (client, handle, events_rx)
    }

    async fn send(client: &mut tokio::io::DuplexStream, envelope: Envelope) {
        let payload = LinkProtocol::Json.encode(&envelope).unwrap();
        write_frame(client, &payload).await.unwrap();
    }

    #[tokio::test]
    async fn test_identify_then_forward() {
        let (mut client, handle, mut events) = spawn_link(1000);
        let reply = read_frame(&mut client).await.unwrap();
        assert_eq!(reply, br#"{"protocol":"wolfmesh-json"}"#.to_vec());

        send(&mut client, Envelope::new("chat", json!("too early"))).await;
        send(&mut client, Envelope::new("id", json!({ "id": "b", "address": "127.0.0.1", "port": 7401 }))).await;
        send(&mut client, Envelope::new("chat", json!("hello"))).await;

        match events.recv().await.unwrap() {
            (LinkId(9), LinkEvent::Identified(node)) => assert_eq!(node.id(), "b"),
            other => panic!("unexpected {:?}", other),
        }
        match events.recv().await.unwrap() {
            (_, LinkEvent::Message(envelope)) => assert_eq!(envelope.data, json!("hello")),
            other => panic!("unexpected {:?}", other),
        }

        handle.send(Envelope::new("welcome", json!(1)));
        let frame = read_frame(&mut client).await.unwrap();
        assert_eq!(LinkProtocol::Json.decode(&frame).unwrap().event, "welcome");

        drop(client);
        assert!(matches!(events.recv().await.unwrap(), (_, LinkEvent::Disconnected)));
    }

    #[tokio::test]
    async fn test_unidentified_link_closes_silently() {
        let (mut client, _handle, mut events) = spawn_link(50);
        read_frame(&mut client).await.unwrap();

        // Link task ends without raising anything
        assert!(events.recv().await.is_none());
        assert!(read_frame(&mut client).await.is_err());
    }
}
