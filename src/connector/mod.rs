//! Connector
//!
//! Drives a node through its cluster roles:
//!
//! - **boot**: fetch the topology from a bootstrap node, or become master
//!   when there is none
//! - **connect**: dial the master; elect a new one when it stays unreachable
//! - **connected**: follow the master's topology replication
//! - **master**: accept member links and replicate the topology to them
//!
//! One tokio task owns the [`Topology`] and the active state. Link tasks, the
//! listener and [`ConnectorHandle`]s talk to it over channels, so topology
//! changes and state transitions never race.

mod boot;
mod connect;
mod connected;
mod links;
mod master;

pub use links::LinkIndex;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::api;
use crate::config::WolfMeshConfig;
use crate::error::{Error, Result};
use crate::network::handshake::{self, REJECT_NOT_SUPPORTED};
use crate::network::{LinkEvent, LinkEventSender, LinkId, LinkRequest, MeshServer};
use crate::protocol::Envelope;
use crate::topology::{Node, Topology, TopologySnapshot};

use boot::{BootResponse, BootState};
use connect::ConnectState;
use connected::ConnectedState;
use master::MasterState;

const NOTIFICATION_CAPACITY: usize = 256;

/// Connector role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateName {
    Boot,
    Connect,
    Connected,
    Master,
}

impl fmt::Display for StateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StateName::Boot => "boot",
            StateName::Connect => "connect",
            StateName::Connected => "connected",
            StateName::Master => "master",
        };
        f.write_str(name)
    }
}

/// Observable connector state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateInfo {
    /// `None` before start and after stop
    pub name: Option<StateName>,
    /// Whether the node takes part in the cluster (connected or master)
    pub ready: bool,
}

/// Broadcast to [`ConnectorHandle::subscribe`]rs
#[derive(Debug, Clone)]
pub enum Notification {
    State(StateInfo),
    /// The local topology reached a new revision
    Topology { revision: u64 },
    /// Application message; `from` is the sending node id
    Message { from: String, envelope: Envelope },
    MemberJoined(Node),
    MemberLeft(String),
}

/// Requests handled by the connector task
#[derive(Debug)]
pub(crate) enum Event {
    Boot(BootResponse),
    SyncTopology,
    /// Message sent to the local node
    Local(Envelope),
    SendToMaster {
        envelope: Envelope,
        reply: oneshot::Sender<bool>,
    },
    SendTo {
        node_id: String,
        envelope: Envelope,
        reply: oneshot::Sender<bool>,
    },
    Snapshot(oneshot::Sender<TopologySnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// The local node as a message target; sends loop back into the connector
#[derive(Clone)]
pub(crate) struct LocalNode {
    events: mpsc::UnboundedSender<Event>,
}

impl LocalNode {
    pub fn send(&self, envelope: Envelope) -> bool {
        self.events.send(Event::Local(envelope)).is_ok()
    }
}

/// State shared by every connector state
pub(crate) struct Context {
    pub config: Arc<WolfMeshConfig>,
    pub topology: Topology,
    pub local: LocalNode,
    pub events: mpsc::UnboundedSender<Event>,
    pub link_events: LinkEventSender,
    notifications: broadcast::Sender<Notification>,
    state: watch::Sender<StateInfo>,
    next_link_id: u64,
}

impl Context {
    pub fn next_link_id(&mut self) -> LinkId {
        self.next_link_id += 1;
        LinkId(self.next_link_id)
    }

    pub fn notify(&self, notification: Notification) {
        let _ = self.notifications.send(notification);
    }

    pub fn publish_state(&self, name: Option<StateName>, ready: bool) {
        let info = StateInfo { name, ready };
        if self.state.send_replace(info) != info {
            match name {
                Some(name) => tracing::info!("Connector {} entered {}", self.topology.id(), name),
                None => tracing::info!("Connector {} stopped", self.topology.id()),
            }
            self.notify(Notification::State(info));
        }
    }
}

enum State {
    Boot(BootState),
    Connect(ConnectState),
    Connected(ConnectedState),
    Master(MasterState),
}

impl State {
    fn name(&self) -> StateName {
        match self {
            State::Boot(_) => StateName::Boot,
            State::Connect(_) => StateName::Connect,
            State::Connected(_) => StateName::Connected,
            State::Master(_) => StateName::Master,
        }
    }

    fn enter(&mut self, ctx: &mut Context) -> Option<State> {
        match self {
            State::Boot(state) => state.enter(ctx),
            State::Connect(state) => state.enter(ctx),
            State::Connected(state) => state.enter(ctx),
            State::Master(state) => state.enter(ctx),
        }
    }

    fn leave(&mut self) {
        match self {
            State::Boot(_) => {}
            State::Connect(state) => state.leave(),
            State::Connected(state) => state.leave(),
            State::Master(state) => state.leave(),
        }
    }

    fn on_link_event(&mut self, ctx: &mut Context, id: LinkId, event: LinkEvent) -> Option<State> {
        match self {
            State::Boot(_) => None,
            State::Connect(state) => state.on_link_event(ctx, id, event),
            State::Connected(state) => state.on_link_event(ctx, id, event),
            State::Master(state) => {
                state.on_link_event(ctx, id, event);
                None
            }
        }
    }
}

/// The connector task
struct ConnectorCore {
    ctx: Context,
    state: Option<State>,
    server_shutdown: watch::Sender<bool>,
}

impl ConnectorCore {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<Event>,
        mut link_events: mpsc::UnboundedReceiver<(LinkId, LinkEvent)>,
        mut link_requests: mpsc::UnboundedReceiver<LinkRequest>,
    ) {
        self.transit(State::Boot(BootState::new(&self.ctx.config)));

        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    if !self.handle_event(event) {
                        break;
                    }
                }
                Some((id, event)) = link_events.recv() => self.handle_link_event(id, event),
                Some(request) = link_requests.recv() => self.handle_link_request(request),
                else => break,
            }
        }
    }

    /// Leave the current state and enter `next`, following any immediate
    /// transitions the new state asks for
    fn transit(&mut self, next: State) {
        let mut next = Some(next);
        while let Some(mut state) = next.take() {
            if let Some(mut previous) = self.state.take() {
                tracing::debug!("Connector leaving {} for {}", previous.name(), state.name());
                previous.leave();
            }
            next = state.enter(&mut self.ctx);
            self.state = Some(state);
        }
    }

    /// Returns false once the connector stopped
    fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Boot(response) => {
                let next = match self.state.as_mut() {
                    Some(State::Boot(state)) => state.on_response(&mut self.ctx, response),
                    _ => None,
                };
                if let Some(next) = next {
                    self.transit(next);
                }
            }
            Event::SyncTopology => {
                if let Some(State::Master(state)) = self.state.as_mut() {
                    state.sync(&mut self.ctx);
                }
            }
            Event::Local(envelope) => match self.state.as_mut() {
                Some(State::Master(state)) => state.on_local(&mut self.ctx, envelope),
                _ => {
                    let from = self.ctx.topology.id().to_string();
                    self.ctx.notify(Notification::Message { from, envelope });
                }
            },
            Event::SendToMaster { envelope, reply } => {
                let sent = match self.state.as_ref() {
                    Some(State::Connected(state)) => state.send_to_master(envelope),
                    Some(State::Master(_)) => self.ctx.local.send(envelope),
                    _ => false,
                };
                let _ = reply.send(sent);
            }
            Event::SendTo { node_id, envelope, reply } => {
                let sent = match self.state.as_ref() {
                    Some(State::Master(state)) => state.send_to(&self.ctx, &node_id, envelope),
                    _ if node_id == self.ctx.topology.id() => self.ctx.local.send(envelope),
                    _ => false,
                };
                let _ = reply.send(sent);
            }
            Event::Snapshot(reply) => {
                let _ = reply.send(self.ctx.topology.to_snapshot());
            }
            Event::Shutdown(done) => {
                self.shutdown();
                let _ = done.send(());
                return false;
            }
        }
        true
    }

    fn handle_link_event(&mut self, id: LinkId, event: LinkEvent) {
        let next = match self.state.as_mut() {
            Some(state) => state.on_link_event(&mut self.ctx, id, event),
            None => None,
        };
        if let Some(next) = next {
            self.transit(next);
        }
    }

    fn handle_link_request(&mut self, request: LinkRequest) {
        if let Some(State::Master(state)) = self.state.as_mut() {
            state.on_link_request(&mut self.ctx, request);
            return;
        }

        tracing::debug!("Rejecting link from {}: not master", request.peer);
        let mut stream = request.stream;
        tokio::spawn(async move {
            let _ = handshake::reject(&mut stream, REJECT_NOT_SUPPORTED).await;
        });
    }

    fn shutdown(&mut self) {
        if let Some(mut state) = self.state.take() {
            state.leave();
        }
        self.ctx.topology.clear();
        self.ctx.publish_state(None, false);
        let _ = self.server_shutdown.send(true);
    }
}

/// Cloneable handle to a running connector
#[derive(Clone)]
pub struct ConnectorHandle {
    local: Node,
    local_addr: SocketAddr,
    events: mpsc::UnboundedSender<Event>,
    state: watch::Receiver<StateInfo>,
    notifications: broadcast::Sender<Notification>,
}

impl ConnectorHandle {
    pub fn local_node(&self) -> &Node {
        &self.local
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> StateInfo {
        *self.state.borrow()
    }

    /// Wait until the connector enters `name`
    pub async fn wait_for_state(&self, name: StateName) -> Result<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|info| info.name == Some(name))
            .await
            .map(|_| ())
            .map_err(|_| Error::ShuttingDown)
    }

    /// Snapshot of the current topology
    pub async fn topology(&self) -> Result<TopologySnapshot> {
        let (tx, rx) = oneshot::channel();
        self.request(Event::Snapshot(tx))?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }

    /// Send to the master, looping back when this node is the master.
    /// Returns false when no master link is up.
    pub async fn send_to_master(&self, envelope: Envelope) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.request(Event::SendToMaster { envelope, reply })?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }

    /// Send to a member (master only) or to the local node
    pub async fn send_to(&self, node_id: &str, envelope: Envelope) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.request(Event::SendTo { node_id: node_id.to_string(), envelope, reply })?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Close every link, clear the topology and stop listening
    pub async fn stop(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        if self.events.send(Event::Shutdown(done)).is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    fn request(&self, event: Event) -> Result<()> {
        self.events.send(event).map_err(|_| Error::ShuttingDown)
    }
}

/// Entry point for running a node
pub struct Connector;

impl Connector {
    /// Bind the listener and start the connector task in its boot state
    pub async fn start(config: WolfMeshConfig) -> Result<ConnectorHandle> {
        config.validate()?;

        let listener = TcpListener::bind(config.bind_address()).await?;
        let local_addr = listener.local_addr()?;
        let local = config.local_node(local_addr.port())?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (link_events_tx, link_events_rx) = mpsc::unbounded_channel();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let (state_tx, state_rx) = watch::channel(StateInfo::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = ConnectorHandle {
            local: local.clone(),
            local_addr,
            events: events_tx.clone(),
            state: state_rx,
            notifications: notifications.clone(),
        };

        let config = Arc::new(config);
        let server = MeshServer::new(
            listener,
            api::router(handle.clone()),
            requests_tx,
            config.connect_timeout(),
            shutdown_rx,
        );
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                tracing::error!("Mesh server error: {}", e);
            }
        });

        let core = ConnectorCore {
            ctx: Context {
                config,
                topology: Topology::new(local.clone()),
                local: LocalNode { events: events_tx.clone() },
                events: events_tx,
                link_events: link_events_tx,
                notifications,
                state: state_tx,
                next_link_id: 0,
            },
            state: None,
            server_shutdown: shutdown_tx,
        };
        tokio::spawn(core.run(events_rx, link_events_rx, requests_rx));

        tracing::info!("Connector {} listening on {}", local, local_addr);
        Ok(handle)
    }
}
