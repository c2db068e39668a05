//! Mesh Server
//!
//! One listening port carries both node links and the HTTP API. Link frames
//! always start with a zero byte (the unused high byte of the length header),
//! which no HTTP request line can, so the first byte decides who gets the
//! connection.

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use super::handshake;
use crate::error::{Error, Result};

/// A link connection whose hello frame has been read
#[derive(Debug)]
pub struct LinkRequest {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    /// Protocol ids offered by the peer
    pub protocols: Vec<String>,
}

/// Listener for links and HTTP
pub struct MeshServer {
    listener: TcpListener,
    router: Router,
    requests: mpsc::UnboundedSender<LinkRequest>,
    handshake_timeout: Duration,
    shutdown: watch::Receiver<bool>,
}

impl MeshServer {
    pub fn new(
        listener: TcpListener,
        router: Router,
        requests: mpsc::UnboundedSender<LinkRequest>,
        handshake_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self { listener, router, requests, handshake_timeout, shutdown }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until the shutdown flag flips
    pub async fn run(mut self) -> Result<()> {
        tracing::info!("Mesh server listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let router = self.router.clone();
                            let requests = self.requests.clone();
                            let handshake_timeout = self.handshake_timeout;

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer, router, requests, handshake_timeout).await {
                                    tracing::debug!("Connection error from {}: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Mesh server stopped");
        Ok(())
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    router: Router,
    requests: mpsc::UnboundedSender<LinkRequest>,
    handshake_timeout: Duration,
) -> Result<()> {
    let mut first = [0u8; 1];
    match tokio::time::timeout(handshake_timeout, stream.peek(&mut first)).await {
        Ok(peeked) => {
            if peeked? == 0 {
                return Ok(());
            }
        }
        Err(_) => return Err(Error::ConnectionTimeout(peer.to_string())),
    }

    if first[0] != 0 {
        return serve_http(stream, router).await;
    }

    stream.set_nodelay(true)?;
    let hello = match tokio::time::timeout(handshake_timeout, handshake::read_hello(&mut stream)).await {
        Ok(hello) => hello?,
        Err(_) => return Err(Error::ConnectionTimeout(peer.to_string())),
    };
    tracing::trace!("Link request from {} offering {:?}", peer, hello.protocols);

    requests
        .send(LinkRequest { stream, peer, protocols: hello.protocols })
        .map_err(|_| Error::ShuttingDown)
}

async fn serve_http(stream: TcpStream, router: Router) -> Result<()> {
    Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(stream), TowerToHyperService::new(router))
        .await
        .map_err(|e| Error::Network(format!("HTTP connection error: {}", e)))
}
