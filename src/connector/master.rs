//! Master state: accept members and replicate the topology to them
//!
//! Each identified member link carries the last revision it was sent. A sync
//! pass flushes pending topology changes into one batch; members whose
//! revision equals the batch base get the incremental update, everyone else a
//! full reload.

use std::collections::HashMap;

use super::links::LinkIndex;
use super::{Context, Event, Notification, State, StateName};
use crate::network::handshake::{self, REJECT_UNSUPPORTED_PROTOCOL};
use crate::network::{LinkConnection, LinkEvent, LinkHandle, LinkId, LinkProtocol, LinkRequest};
use crate::protocol::{Envelope, Message};
use crate::topology::Node;

struct MemberLink {
    handle: LinkHandle,
    /// Revision last sent to the member; `None` until it got a snapshot
    revision: Option<u64>,
}

pub(crate) struct MasterState {
    links: HashMap<LinkId, MemberLink>,
    index: LinkIndex,
    sync_scheduled: bool,
}

impl MasterState {
    pub fn new() -> Self {
        Self {
            links: HashMap::new(),
            index: LinkIndex::new(),
            sync_scheduled: false,
        }
    }

    pub fn enter(&mut self, ctx: &mut Context) -> Option<State> {
        ctx.topology.become_master();
        ctx.publish_state(Some(StateName::Master), true);
        tracing::info!("Running as master {} at revision {}", ctx.topology.local_node(), ctx.topology.revision());
        ctx.notify(Notification::Topology { revision: ctx.topology.revision() });
        None
    }

    pub fn leave(&mut self) {
        for link in self.links.values() {
            link.handle.close();
        }
        self.links.clear();
        self.index.clear();
    }

    /// Take over an incoming link if one of its protocols is acceptable
    pub fn on_link_request(&mut self, ctx: &mut Context, request: LinkRequest) {
        let Some(protocol) = LinkProtocol::select(&ctx.config.link.protocols, &request.protocols) else {
            tracing::warn!("Rejecting link from {}: no supported protocol in {:?}", request.peer, request.protocols);
            let mut stream = request.stream;
            tokio::spawn(async move {
                let _ = handshake::reject(&mut stream, REJECT_UNSUPPORTED_PROTOCOL).await;
            });
            return;
        };

        let id = ctx.next_link_id();
        tracing::debug!("Accepted link {} from {} ({})", id, request.peer, protocol);
        let handle = LinkConnection::spawn(id, request.stream, protocol, ctx.config.inbound(), ctx.link_events.clone());
        self.links.insert(id, MemberLink { handle, revision: None });
    }

    pub fn on_link_event(&mut self, ctx: &mut Context, id: LinkId, event: LinkEvent) {
        if !self.links.contains_key(&id) {
            return;
        }

        match event {
            LinkEvent::Identified(node) => self.on_identified(ctx, id, node),
            LinkEvent::Message(envelope) => self.on_message(ctx, Some(id), envelope),
            LinkEvent::Disconnected => self.on_disconnected(ctx, id),
            LinkEvent::Up | LinkEvent::Down | LinkEvent::Timeout => {}
        }
    }

    fn on_identified(&mut self, ctx: &mut Context, id: LinkId, node: Node) {
        if node.id() == ctx.topology.id() {
            tracing::warn!("Link {} claims the local id {}, closing", id, node.id());
            if let Some(link) = self.links.remove(&id) {
                link.handle.close();
            }
            return;
        }

        if let Some(previous) = self.index.insert(node.id(), id) {
            tracing::debug!("Member {} reconnected, dropping {}", node.id(), previous);
            if let Some(link) = self.links.remove(&previous) {
                link.handle.close();
            }
        }

        match ctx.topology.add(node.clone()) {
            Ok(true) => {
                tracing::info!("Member {} joined ({} linked)", node, self.member_count());
                self.schedule_sync(ctx);
            }
            Ok(false) => {
                tracing::debug!("Member {} re-registered unchanged", node);
                self.send_reload(ctx, id);
            }
            Err(e) => tracing::error!("Cannot register {}: {}", node, e),
        }
        ctx.notify(Notification::MemberJoined(node));
    }

    fn on_disconnected(&mut self, ctx: &mut Context, id: LinkId) {
        self.links.remove(&id);
        let Some(node_id) = self.index.remove_link(id) else {
            return;
        };

        match ctx.topology.remove(&node_id) {
            Ok(_) => {
                tracing::info!("Member {} left", node_id);
                self.schedule_sync(ctx);
            }
            Err(e) => tracing::error!("Cannot unregister {}: {}", node_id, e),
        }
        ctx.notify(Notification::MemberLeft(node_id));
    }

    /// Message looped back from the local node
    pub fn on_local(&mut self, ctx: &mut Context, envelope: Envelope) {
        self.on_message(ctx, None, envelope);
    }

    fn on_message(&mut self, ctx: &mut Context, link: Option<LinkId>, envelope: Envelope) {
        let from = match link {
            Some(id) => match self.index.node_for(id) {
                Some(node_id) => node_id.to_string(),
                None => return,
            },
            None => ctx.topology.id().to_string(),
        };

        let event = envelope.event.clone();
        match Message::from_envelope(envelope) {
            Ok(Message::State { revision }) => {
                if let Some(id) = link {
                    tracing::debug!("Member {} reports revision {}, sending snapshot", from, revision);
                    self.send_reload(ctx, id);
                }
            }
            Ok(Message::Custom(envelope)) => ctx.notify(Notification::Message { from, envelope }),
            Ok(other) => tracing::debug!("Ignoring {} from {}", other.event(), from),
            Err(e) => tracing::warn!("Dropping malformed {} from {}: {}", event, from, e),
        }
    }

    /// Deliver to a member link, or loop back for the local node
    pub fn send_to(&self, ctx: &Context, node_id: &str, envelope: Envelope) -> bool {
        if node_id == ctx.topology.id() {
            return ctx.local.send(envelope);
        }
        match self.index.link_for(node_id).and_then(|id| self.links.get(&id)) {
            Some(link) => link.handle.send(envelope),
            None => false,
        }
    }

    /// Coalesce topology changes into one sync pass
    fn schedule_sync(&mut self, ctx: &Context) {
        if self.sync_scheduled {
            return;
        }
        self.sync_scheduled = true;

        let delay = ctx.config.sync_delay();
        if delay.is_zero() {
            let _ = ctx.events.send(Event::SyncTopology);
        } else {
            let events = ctx.events.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = events.send(Event::SyncTopology);
            });
        }
    }

    pub fn sync(&mut self, ctx: &mut Context) {
        self.sync_scheduled = false;
        let batch = match ctx.topology.flush_changes() {
            Ok(Some(batch)) => batch,
            Ok(None) => return,
            Err(e) => {
                tracing::error!("Topology flush failed: {}", e);
                return;
            }
        };
        tracing::debug!("Topology revision {} with {} changes", batch.revision, batch.changes.len());
        ctx.notify(Notification::Topology { revision: batch.revision });

        let update = match Message::TopologyUpdate(batch.clone()).to_envelope() {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!("Cannot encode topology update: {}", e);
                return;
            }
        };
        let mut reload: Option<(u64, Envelope)> = None;

        for id in self.index.links() {
            let Some(link) = self.links.get_mut(&id) else {
                continue;
            };
            if link.revision == Some(batch.base_revision) {
                link.revision = Some(batch.revision);
                link.handle.send(update.clone());
                continue;
            }
            if reload.is_none() {
                reload = snapshot_envelope(ctx);
            }
            if let Some((revision, envelope)) = &reload {
                link.revision = Some(*revision);
                link.handle.send(envelope.clone());
            }
        }
    }

    fn send_reload(&mut self, ctx: &Context, id: LinkId) {
        let Some(link) = self.links.get_mut(&id) else {
            return;
        };
        if let Some((revision, envelope)) = snapshot_envelope(ctx) {
            link.revision = Some(revision);
            link.handle.send(envelope);
        }
    }

    pub fn member_count(&self) -> usize {
        self.index.len()
    }
}

fn snapshot_envelope(ctx: &Context) -> Option<(u64, Envelope)> {
    let snapshot = ctx.topology.to_snapshot();
    let revision = snapshot.revision;
    match Message::TopologyReload(snapshot).to_envelope() {
        Ok(envelope) => Some((revision, envelope)),
        Err(e) => {
            tracing::error!("Cannot encode topology snapshot: {}", e);
            None
        }
    }
}
