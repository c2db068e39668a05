//! Synapse
//!
//! One framed duplex byte stream plus an outgoing queue. A frame is handed to
//! the writer only while no other write is in flight; everything else waits
//! in FIFO order. Queued frames may carry an expiry and are abandoned, never
//! written, once it passes. The queue outlives the transport so an outbound
//! link can keep buffering across reconnects.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::codec::FramedRead;

use super::frame::FrameCodec;
use crate::error::{Error, Result};

/// Notified once a frame is written, abandoned or rejected
pub type Completion = oneshot::Sender<Result<()>>;

type WriteFuture<W> = Pin<Box<dyn Future<Output = (W, io::Result<()>)> + Send>>;

/// Per-send options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Abandon the frame if it is still queued after this long
    pub expire_after: Option<Duration>,
}

impl SendOptions {
    pub fn expire_after(duration: Duration) -> Self {
        Self { expire_after: Some(duration) }
    }
}

/// Where a frame went when it was handed to [`Synapse::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Handed straight to the writer
    Written,
    /// Waiting behind an in-flight write or for a transport
    Queued,
}

/// Why a transport went away
#[derive(Debug)]
pub enum CloseReason {
    Eof,
    Error(Error),
    IdleTimeout,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Eof => f.write_str("closed by peer"),
            CloseReason::Error(e) => write!(f, "{}", e),
            CloseReason::IdleTimeout => f.write_str("idle timeout"),
        }
    }
}

#[derive(Debug)]
pub enum SynapseEvent {
    /// One complete inbound frame payload
    Message(BytesMut),
    /// The transport was dropped; queued frames are kept
    Closed(CloseReason),
}

struct Outgoing {
    frame: Bytes,
    expires_at: Option<Instant>,
    done: Option<Completion>,
}

impl Outgoing {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }

    fn complete(self, result: Result<()>) {
        complete(self.done, result);
    }
}

fn complete(done: Option<Completion>, result: Result<()>) {
    if let Some(done) = done {
        let _ = done.send(result);
    }
}

/// Bounded FIFO of frames waiting for the writer
pub struct SendQueue {
    items: VecDeque<Outgoing>,
    capacity: usize,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        Self { items: VecDeque::new(), capacity }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a frame, making room by dropping expired ones first
    fn push(&mut self, item: Outgoing, now: Instant) -> std::result::Result<(), Outgoing> {
        if self.items.len() >= self.capacity {
            self.purge_expired(now);
        }
        if self.items.len() >= self.capacity {
            return Err(item);
        }
        self.items.push_back(item);
        Ok(())
    }

    fn push_front(&mut self, item: Outgoing) {
        self.items.push_front(item);
    }

    /// Next live frame; expired ones met on the way are abandoned
    fn pop(&mut self, now: Instant) -> Option<Outgoing> {
        while let Some(item) = self.items.pop_front() {
            if item.is_expired(now) {
                item.complete(Err(Error::Abandoned));
                continue;
            }
            return Some(item);
        }
        None
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.items.len();
        let mut live = VecDeque::with_capacity(before);
        for item in self.items.drain(..) {
            if item.is_expired(now) {
                item.complete(Err(Error::Abandoned));
            } else {
                live.push_back(item);
            }
        }
        self.items = live;
        before - self.items.len()
    }

    fn abandon_all(&mut self) {
        for item in self.items.drain(..) {
            item.complete(Err(Error::Abandoned));
        }
    }
}

struct InFlight<W> {
    write: WriteFuture<W>,
    done: Option<Completion>,
}

struct Transport<R, W> {
    reader: FramedRead<R, FrameCodec>,
    /// `None` while a write is in flight
    writer: Option<W>,
    in_flight: Option<InFlight<W>>,
}

impl<R, W> Transport<R, W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn start_write(&mut self, mut writer: W, item: Outgoing) {
        let frame = item.frame;
        let write = Box::pin(async move {
            let result = match writer.write_all(&frame).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            };
            (writer, result)
        });
        self.in_flight = Some(InFlight { write, done: item.done });
    }
}

/// Framed transport with a persistent send queue
pub struct Synapse<R, W> {
    transport: Option<Transport<R, W>>,
    queue: SendQueue,
    idle_timeout: Option<Duration>,
}

impl<R, W> Synapse<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(queue_capacity: usize, idle_timeout: Option<Duration>) -> Self {
        Self {
            transport: None,
            queue: SendQueue::new(queue_capacity),
            idle_timeout,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.transport.is_some()
    }

    /// True when a send would go straight to the writer
    pub fn is_writable(&self) -> bool {
        self.queue.is_empty()
            && self.transport.as_ref().map_or(false, |t| t.in_flight.is_none())
    }

    /// Frames waiting for the writer
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Start using a fresh transport; queued frames are flushed to it
    pub fn attach(&mut self, reader: R, writer: W) {
        self.detach();
        self.transport = Some(Transport {
            reader: FramedRead::new(reader, FrameCodec::new()),
            writer: Some(writer),
            in_flight: None,
        });
        self.pump();
    }

    /// Drop the transport but keep the queue for the next attach
    pub fn detach(&mut self) {
        if let Some(transport) = self.transport.take() {
            if let Some(in_flight) = transport.in_flight {
                complete(in_flight.done, Err(Error::LinkClosed));
            }
        }
    }

    /// Drop the transport and abandon everything queued
    pub fn close(&mut self) {
        self.detach();
        self.queue.abandon_all();
    }

    /// Frame `payload` and write it now, or queue it behind the busy writer
    pub fn send(&mut self, payload: Bytes, options: SendOptions, done: Option<Completion>) -> Result<SendStatus> {
        let frame = match FrameCodec::frame(&payload) {
            Ok(frame) => frame,
            Err(e) => {
                complete(done, Err(Error::Frame(e.to_string())));
                return Err(e);
            }
        };
        let now = Instant::now();
        let item = Outgoing {
            frame,
            expires_at: options.expire_after.map(|after| now + after),
            done,
        };

        if self.queue.is_empty() {
            if let Some(transport) = self.transport.as_mut() {
                if transport.in_flight.is_none() {
                    if let Some(writer) = transport.writer.take() {
                        transport.start_write(writer, item);
                        return Ok(SendStatus::Written);
                    }
                }
            }
        }

        match self.queue.push(item, now) {
            Ok(()) => Ok(SendStatus::Queued),
            Err(item) => {
                item.complete(Err(Error::QueueFull));
                Err(Error::QueueFull)
            }
        }
    }

    /// Drive pending writes until an inbound frame arrives or the transport
    /// closes. Cancel safe; pends forever while detached.
    pub async fn next_event(&mut self) -> SynapseEvent {
        loop {
            self.pump();
            let idle = self.idle_timeout;
            let transport = match self.transport.as_mut() {
                Some(transport) => transport,
                None => return std::future::pending().await,
            };

            tokio::select! {
                (writer, result) = write_completion(&mut transport.in_flight) => {
                    let done = transport.in_flight.take().and_then(|f| f.done);
                    match result {
                        Ok(()) => {
                            transport.writer = Some(writer);
                            complete(done, Ok(()));
                        }
                        Err(e) => {
                            complete(done, Err(Error::LinkClosed));
                            self.detach();
                            return SynapseEvent::Closed(CloseReason::Error(e.into()));
                        }
                    }
                }
                frame = transport.reader.next() => match frame {
                    Some(Ok(frame)) => return SynapseEvent::Message(frame),
                    Some(Err(e)) => {
                        self.detach();
                        return SynapseEvent::Closed(CloseReason::Error(e));
                    }
                    None => {
                        self.detach();
                        return SynapseEvent::Closed(CloseReason::Eof);
                    }
                },
                _ = idle_wait(idle) => {
                    self.detach();
                    return SynapseEvent::Closed(CloseReason::IdleTimeout);
                }
            }
        }
    }

    /// Hand the next live queued frame to an idle writer
    fn pump(&mut self) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        if transport.in_flight.is_some() {
            return;
        }
        let Some(item) = self.queue.pop(Instant::now()) else {
            return;
        };
        match transport.writer.take() {
            Some(writer) => transport.start_write(writer, item),
            None => self.queue.push_front(item),
        }
    }
}

async fn write_completion<W>(in_flight: &mut Option<InFlight<W>>) -> (W, io::Result<()>) {
    match in_flight {
        Some(in_flight) => (&mut in_flight.write).await,
        None => std::future::pending().await,
    }
}

async fn idle_wait(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}
