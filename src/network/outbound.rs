//! Outbound Links
//!
//! A [`NodeLink`] owns one dialing connection to a remote node. It connects
//! immediately, keeps its send queue across reconnects and walks the backoff
//! schedule after every failure. Running out of schedule raises
//! [`LinkEvent::Timeout`] and ends the task.

use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;

use super::backoff::{Backoff, Retry};
use super::codec::LinkProtocol;
use super::handshake;
use super::synapse::{Synapse, SynapseEvent};
use super::{LinkCommand, LinkEvent, LinkEventSender, LinkHandle, LinkId};
use crate::topology::Node;

/// Settings for dialing links
#[derive(Debug, Clone)]
pub struct OutboundConfig {
    /// The single protocol offered in the handshake
    pub protocol: LinkProtocol,
    pub backoff: Vec<Duration>,
    pub connect_timeout: Duration,
    pub send_queue_max: usize,
    pub idle_timeout: Option<Duration>,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            protocol: LinkProtocol::Json,
            backoff: Backoff::default_schedule(),
            connect_timeout: Duration::from_secs(3),
            send_queue_max: 1024,
            idle_timeout: None,
        }
    }
}

/// Where a [`NodeLink`] is in its connect/retry cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPhase {
    Idle,
    Connecting,
    /// Waiting out the delay before attempt number `attempt`
    BackoffWait { attempt: usize, delay: Duration },
    Connected,
    /// Schedule exhausted
    TerminallyFailed,
    /// Closed by the owner, or lost after reconnects were disabled
    Closed,
}

/// Outbound link task
pub struct NodeLink {
    id: LinkId,
    node: Node,
    config: OutboundConfig,
    backoff: Backoff,
    phase: ReconnectPhase,
    synapse: Synapse<OwnedReadHalf, OwnedWriteHalf>,
    commands: mpsc::UnboundedReceiver<LinkCommand>,
    events: LinkEventSender,
}

impl NodeLink {
    /// Spawn a link to `node`; the first connect attempt starts right away
    pub fn spawn(id: LinkId, node: Node, config: OutboundConfig, events: LinkEventSender) -> LinkHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = NodeLink {
            id,
            node,
            backoff: Backoff::new(config.backoff.clone()),
            synapse: Synapse::new(config.send_queue_max, config.idle_timeout),
            config,
            phase: ReconnectPhase::Idle,
            commands: rx,
            events,
        };
        tokio::spawn(link.run());
        LinkHandle::new(id, tx)
    }

    async fn run(mut self) {
        self.phase = ReconnectPhase::Connecting;
        loop {
            match self.phase {
                ReconnectPhase::Connecting => self.connect().await,
                ReconnectPhase::BackoffWait { delay, .. } => self.wait(delay).await,
                ReconnectPhase::Connected => self.serve().await,
                ReconnectPhase::TerminallyFailed => {
                    tracing::warn!("Link {} to {} gave up after {} attempts", self.id, self.node, self.backoff.attempts());
                    self.emit(LinkEvent::Timeout);
                    break;
                }
                ReconnectPhase::Idle | ReconnectPhase::Closed => break,
            }
        }
        self.synapse.close();
        tracing::debug!("Link {} to {} finished", self.id, self.node);
    }

    async fn connect(&mut self) {
        let endpoint = self.node.endpoint();
        let dial = handshake::dial(&endpoint, self.config.protocol, self.config.connect_timeout);
        tokio::pin!(dial);

        loop {
            tokio::select! {
                result = &mut dial => {
                    match result {
                        Ok(stream) => {
                            let (reader, writer) = stream.into_split();
                            self.synapse.attach(reader, writer);
                            self.backoff.reset();
                            self.phase = ReconnectPhase::Connected;
                            tracing::debug!("Link {} up to {} ({})", self.id, self.node, self.config.protocol);
                            self.emit(LinkEvent::Up);
                        }
                        Err(e) => {
                            tracing::debug!("Link {} connect to {} failed: {}", self.id, self.node, e);
                            self.phase = self.retry_phase();
                        }
                    }
                    return;
                }
                command = self.commands.recv() => {
                    if !self.handle_command(command) {
                        self.phase = ReconnectPhase::Closed;
                        return;
                    }
                }
            }
        }
    }

    async fn wait(&mut self, delay: Duration) {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => {
                    self.phase = ReconnectPhase::Connecting;
                    return;
                }
                command = self.commands.recv() => {
                    if !self.handle_command(command) {
                        self.phase = ReconnectPhase::Closed;
                        return;
                    }
                }
            }
        }
    }

    async fn serve(&mut self) {
        tokio::select! {
            event = self.synapse.next_event() => match event {
                SynapseEvent::Message(frame) => match self.config.protocol.decode(&frame) {
                    Ok(envelope) => self.emit(LinkEvent::Message(envelope)),
                    Err(e) => tracing::warn!("Link {} dropped undecodable frame from {}: {}", self.id, self.node, e),
                },
                SynapseEvent::Closed(reason) => {
                    tracing::debug!("Link {} down to {}: {}", self.id, self.node, reason);
                    self.emit(LinkEvent::Down);
                    self.phase = self.retry_phase();
                }
            },
            command = self.commands.recv() => {
                if !self.handle_command(command) {
                    self.phase = ReconnectPhase::Closed;
                }
            }
        }
    }

    fn retry_phase(&mut self) -> ReconnectPhase {
        match self.backoff.next() {
            Retry::After(delay) => ReconnectPhase::BackoffWait { attempt: self.backoff.attempts(), delay },
            Retry::Exhausted => ReconnectPhase::TerminallyFailed,
            Retry::Disabled => ReconnectPhase::Closed,
        }
    }

    /// Apply an owner command; false when the link should stop
    fn handle_command(&mut self, command: Option<LinkCommand>) -> bool {
        match command {
            Some(LinkCommand::Send { envelope, options, done }) => {
                match self.config.protocol.encode(&envelope) {
                    Ok(payload) => {
                        if let Err(e) = self.synapse.send(payload, options, done) {
                            tracing::debug!("Link {} dropped {}: {}", self.id, envelope.event, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Link {} cannot encode {}: {}", self.id, envelope.event, e);
                        if let Some(done) = done {
                            let _ = done.send(Err(e));
                        }
                    }
                }
                true
            }
            Some(LinkCommand::DisableReconnect) => {
                self.backoff.disable();
                true
            }
            Some(LinkCommand::Close) | None => false,
        }
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send((self.id, event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::handshake::{accept, read_hello};
    use crate::network::{read_frame, write_frame};
    use crate::protocol::Envelope;
    use serde_json::json;
    use tokio::net::TcpListener;

    fn config(backoff: &[u64]) -> OutboundConfig {
        OutboundConfig {
            backoff: backoff.iter().map(|ms| Duration::from_millis(*ms)).collect(),
            connect_timeout: Duration::from_millis(500),
            ..OutboundConfig::default()
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<(LinkId, LinkEvent)>) -> LinkEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("link event timeout")
            .expect("event channel closed")
            .1
    }

    #[tokio::test]
    async fn test_link_exchanges_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let node = Node::new("remote", "127.0.0.1", port).unwrap();

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let link = NodeLink::spawn(LinkId(1), node, config(&[50]), events_tx);
        link.send(Envelope::new("early", json!({ "n": 1 })));

        let (mut stream, _) = listener.accept().await.unwrap();
        let hello = read_hello(&mut stream).await.unwrap();
        assert_eq!(hello.protocols, vec!["wolfmesh-json".to_string()]);
        accept(&mut stream, LinkProtocol::Json).await.unwrap();

        assert!(matches!(next_event(&mut events_rx).await, LinkEvent::Up));

        let frame = read_frame(&mut stream).await.unwrap();
        let early = LinkProtocol::Json.decode(&frame).unwrap();
        assert_eq!(early.event, "early");

        let reply = LinkProtocol::Json.encode(&Envelope::new("pong", json!(true))).unwrap();
        write_frame(&mut stream, &reply).await.unwrap();
        match next_event(&mut events_rx).await {
            LinkEvent::Message(envelope) => assert_eq!(envelope.event, "pong"),
            other => panic!("unexpected event {:?}", other),
        }

        drop(stream);
        assert!(matches!(next_event(&mut events_rx).await, LinkEvent::Down));
        link.close();
    }

    #[tokio::test]
    async fn test_link_times_out_after_schedule() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let node = Node::new("gone", "127.0.0.1", port).unwrap();

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let link = NodeLink::spawn(LinkId(2), node, config(&[10, 10]), events_tx);
        let done = link.send_with(Envelope::new("lost", json!(null)), Default::default());

        assert!(matches!(next_event(&mut events_rx).await, LinkEvent::Timeout));
        assert!(matches!(done.await, Ok(Err(crate::error::Error::Abandoned))));
    }

    #[tokio::test]
    async fn test_disabled_link_stops_quietly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let node = Node::new("remote", "127.0.0.1", port).unwrap();

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let link = NodeLink::spawn(LinkId(3), node, config(&[10, 10]), events_tx);

        let (mut stream, _) = listener.accept().await.unwrap();
        read_hello(&mut stream).await.unwrap();
        accept(&mut stream, LinkProtocol::Json).await.unwrap();
        assert!(matches!(next_event(&mut events_rx).await, LinkEvent::Up));

        link.disable_reconnect();
        drop(listener);
        drop(stream);
        assert!(matches!(next_event(&mut events_rx).await, LinkEvent::Down));

        // No timeout follows; the task just ends
        assert!(tokio::time::timeout(Duration::from_millis(200), events_rx.recv()).await.map_or(true, |e| e.is_none()));
    }
}
