//! Connect state: dial the master, elect a new one if it stays unreachable

use super::connected::ConnectedState;
use super::master::MasterState;
use super::{Context, State, StateName};
use crate::network::{LinkEvent, LinkHandle, LinkId, NodeLink};

pub(crate) struct ConnectState {
    link: Option<LinkHandle>,
}

impl ConnectState {
    pub fn new() -> Self {
        Self { link: None }
    }

    pub fn enter(&mut self, ctx: &mut Context) -> Option<State> {
        ctx.publish_state(Some(StateName::Connect), false);

        if ctx.topology.is_master() {
            return Some(State::Master(MasterState::new()));
        }
        let Some(master) = ctx.topology.master().cloned() else {
            tracing::warn!("No master known, starting as master");
            return Some(State::Master(MasterState::new()));
        };

        tracing::info!("Connecting to master {}", master);
        let id = ctx.next_link_id();
        self.link = Some(NodeLink::spawn(id, master, ctx.config.outbound(), ctx.link_events.clone()));
        None
    }

    pub fn leave(&mut self) {
        if let Some(link) = self.link.take() {
            link.close();
        }
    }

    pub fn on_link_event(&mut self, ctx: &mut Context, id: LinkId, event: LinkEvent) -> Option<State> {
        if self.link.as_ref().map(|l| l.id()) != Some(id) {
            return None;
        }

        match event {
            LinkEvent::Up => {
                let link = self.link.take()?;
                link.disable_reconnect();
                Some(State::Connected(ConnectedState::new(link)))
            }
            LinkEvent::Timeout => {
                self.link = None;
                let failed = ctx.topology.master_id().unwrap_or("-").to_string();
                match ctx.topology.elect_master().map(|m| m.to_string()) {
                    Ok(elected) => tracing::info!("Master {} unreachable, elected {}", failed, elected),
                    Err(e) => tracing::error!("Election after losing {} failed: {}", failed, e),
                }

                if ctx.topology.is_master() || !ctx.topology.is_valid() {
                    Some(State::Master(MasterState::new()))
                } else {
                    Some(State::Connect(ConnectState::new()))
                }
            }
            LinkEvent::Down | LinkEvent::Message(_) => None,
            LinkEvent::Identified(_) | LinkEvent::Disconnected => None,
        }
    }
}
