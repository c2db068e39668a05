//! Connected state: follow the master's topology

use super::connect::ConnectState;
use super::{Context, Notification, State, StateName};
use crate::error::Error;
use crate::network::{LinkEvent, LinkHandle, LinkId};
use crate::protocol::{Envelope, Message};
use crate::topology::{TopologySnapshot, UpdateBatch};

pub(crate) struct ConnectedState {
    link: LinkHandle,
}

impl ConnectedState {
    pub fn new(link: LinkHandle) -> Self {
        Self { link }
    }

    pub fn enter(&mut self, ctx: &mut Context) -> Option<State> {
        ctx.publish_state(Some(StateName::Connected), true);
        tracing::info!("Connected to master {}", ctx.topology.master_id().unwrap_or("-"));
        self.send(Message::Id(ctx.topology.local_node().clone()));
        None
    }

    pub fn leave(&mut self) {
        self.link.close();
    }

    pub fn send_to_master(&self, envelope: Envelope) -> bool {
        self.link.send(envelope)
    }

    pub fn on_link_event(&mut self, ctx: &mut Context, id: LinkId, event: LinkEvent) -> Option<State> {
        if id != self.link.id() {
            return None;
        }

        match event {
            LinkEvent::Message(envelope) => {
                self.on_message(ctx, envelope);
                None
            }
            LinkEvent::Down | LinkEvent::Timeout => {
                tracing::info!("Lost master {}", ctx.topology.master_id().unwrap_or("-"));
                Some(State::Connect(ConnectState::new()))
            }
            LinkEvent::Up | LinkEvent::Identified(_) | LinkEvent::Disconnected => None,
        }
    }

    fn on_message(&mut self, ctx: &mut Context, envelope: Envelope) {
        let event = envelope.event.clone();
        match Message::from_envelope(envelope) {
            Ok(Message::TopologyReload(snapshot)) => self.reload(ctx, &snapshot),
            Ok(Message::TopologyUpdate(batch)) => self.update(ctx, &batch),
            Ok(Message::Custom(envelope)) => {
                let from = ctx.topology.master_id().unwrap_or_default().to_string();
                ctx.notify(Notification::Message { from, envelope });
            }
            Ok(other) => tracing::debug!("Ignoring {} from master", other.event()),
            Err(e) => tracing::warn!("Dropping malformed {} from master: {}", event, e),
        }
    }

    fn reload(&mut self, ctx: &mut Context, snapshot: &TopologySnapshot) {
        match ctx.topology.reload(snapshot) {
            Ok(()) => {
                tracing::debug!("Topology reloaded at revision {}", snapshot.revision);
                ctx.notify(Notification::Topology { revision: snapshot.revision });
            }
            Err(e) => tracing::warn!("Dropping topology reload: {}", e),
        }
    }

    fn update(&mut self, ctx: &mut Context, batch: &UpdateBatch) {
        match ctx.topology.apply_update(batch) {
            Ok(changed) => {
                tracing::debug!("Topology updated to revision {} ({} changes)", batch.revision, batch.changes.len());
                if changed {
                    ctx.notify(Notification::Topology { revision: batch.revision });
                }
            }
            Err(Error::OutOfDate { local, base }) => {
                tracing::debug!("Update based on {} but local revision is {}, requesting state", base, local);
                self.send(Message::State { revision: local });
            }
            Err(e) => tracing::warn!("Dropping topology update: {}", e),
        }
    }

    fn send(&self, message: Message) {
        match message.to_envelope() {
            Ok(envelope) => {
                self.link.send(envelope);
            }
            Err(e) => tracing::error!("Cannot encode {}: {}", message.event(), e),
        }
    }
}
