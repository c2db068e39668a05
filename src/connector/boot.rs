//! Boot state: fetch the topology from a bootstrap node

use std::time::Duration;

use super::connect::ConnectState;
use super::master::MasterState;
use super::{Context, Event, Notification, State, StateName};
use crate::config::WolfMeshConfig;
use crate::error::{Error, Result};
use crate::topology::TopologySnapshot;

/// Result of one bootstrap request
#[derive(Debug)]
pub(crate) struct BootResponse {
    pub bootstrap: String,
    pub result: Result<TopologySnapshot>,
}

pub(crate) struct BootState {
    bootstraps: Vec<String>,
    /// Position in `bootstraps` of the outstanding request
    index: usize,
    /// Completed passes over the whole list
    retries: u32,
    max_retries: u32,
    retry_delay: Duration,
    request_timeout: Duration,
}

impl BootState {
    pub fn new(config: &WolfMeshConfig) -> Self {
        Self {
            bootstraps: config.cluster.bootstraps.clone(),
            index: 0,
            retries: 0,
            max_retries: config.cluster.boot_max_retries,
            retry_delay: config.boot_retry_delay(),
            request_timeout: config.boot_request_timeout(),
        }
    }

    pub fn enter(&mut self, ctx: &mut Context) -> Option<State> {
        ctx.publish_state(Some(StateName::Boot), false);
        if self.bootstraps.is_empty() {
            tracing::info!("No bootstrap nodes configured, starting as master");
            return Some(State::Master(MasterState::new()));
        }
        self.request(ctx, None);
        None
    }

    pub fn on_response(&mut self, ctx: &mut Context, response: BootResponse) -> Option<State> {
        let loaded = response.result.and_then(|snapshot| ctx.topology.reload(&snapshot));
        match loaded {
            Ok(()) => {
                tracing::info!(
                    "Bootstrapped from {}: master {}, revision {}",
                    response.bootstrap,
                    ctx.topology.master_id().unwrap_or("-"),
                    ctx.topology.revision()
                );
                ctx.notify(Notification::Topology { revision: ctx.topology.revision() });
                return Some(State::Connect(ConnectState::new()));
            }
            Err(e) => tracing::warn!("Bootstrap {} failed: {}", response.bootstrap, e),
        }

        self.index += 1;
        if self.index < self.bootstraps.len() {
            self.request(ctx, None);
            return None;
        }

        self.index = 0;
        self.retries += 1;
        if self.retries < self.max_retries {
            tracing::debug!("Bootstrap pass {} of {} failed, retrying", self.retries, self.max_retries);
            self.request(ctx, Some(self.retry_delay));
            None
        } else {
            tracing::error!("No bootstrap node reachable after {} attempts, starting as master", self.retries);
            Some(State::Master(MasterState::new()))
        }
    }

    /// Fetch from the current bootstrap, optionally after a pause
    fn request(&self, ctx: &Context, delay: Option<Duration>) {
        let bootstrap = self.bootstraps[self.index].clone();
        let timeout = self.request_timeout;
        let events = ctx.events.clone();

        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            tracing::debug!("Requesting topology from {}", bootstrap);
            let result = fetch_topology(&bootstrap, timeout).await;
            let _ = events.send(Event::Boot(BootResponse { bootstrap, result }));
        });
    }
}

/// GET `{bootstrap}/topology`
pub(crate) async fn fetch_topology(bootstrap: &str, timeout: Duration) -> Result<TopologySnapshot> {
    let url = format!("{}/topology", bootstrap.trim_end_matches('/'));
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let response = client.get(&url).send().await?;

    if !response.status().is_success() {
        return Err(Error::Bootstrap {
            address: bootstrap.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| Error::BadTopology(e.to_string()))
}
