//! Peer connections
//!
//! Every connection runs in its own task: a loop that reads frames and hands
//! parsed messages to the connection's [`Dispatcher`], next to a writer task
//! that drains the outbound queue. The task reports its lifecycle through
//! [`PeerEvent`]s, so the owner of the peer sets never needs a back
//! reference from the peer.

use super::dispatcher::{Dispatcher, Handler};
use super::message::{Message, MessageType};
use super::{Direction, PeerAddress, PeerSummary};
use crate::error::{NetworkError, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Largest accepted frame
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Messages that may wait in a peer's outbound queue
pub const OUTBOUND_QUEUE_SIZE: usize = 256;

/// Lifecycle notifications from connection tasks
#[derive(Debug)]
pub enum PeerEvent {
    /// Transport is open and the receive loop is about to start
    Connected(PeerHandle),
    /// Unsolicited message (no continuation registered for it)
    Message(PeerHandle, Message),
    /// Dial failed or the connection ended
    Disconnected(PeerHandle),
}

struct PeerShared {
    address: PeerAddress,
    direction: Direction,
    rank: AtomicI64,
    outbound: mpsc::Sender<Message>,
    dispatcher: Mutex<Dispatcher>,
    closed: CancellationToken,
}

/// Cloneable handle on one peer connection
#[derive(Clone)]
pub struct PeerHandle {
    shared: Arc<PeerShared>,
}

impl PeerHandle {
    /// Create a handle and the queue its connection task will drain
    ///
    /// Unsolicited messages are forwarded to `events`.
    pub fn new(
        address: PeerAddress,
        direction: Direction,
        rank: i64,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE_SIZE);

        let mut dispatcher = Dispatcher::new();
        dispatcher.set_global_handler(Box::new(move |message: Message, peer: &PeerHandle| {
            let _ = events.send(PeerEvent::Message(peer.clone(), message));
        }));

        let handle = Self {
            shared: Arc::new(PeerShared {
                address,
                direction,
                rank: AtomicI64::new(rank),
                outbound,
                dispatcher: Mutex::new(dispatcher),
                closed: CancellationToken::new(),
            }),
        };
        (handle, queue)
    }

    pub fn address(&self) -> &PeerAddress {
        &self.shared.address
    }

    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    /// Whether we dialled this peer
    pub fn is_server(&self) -> bool {
        self.shared.direction == Direction::Outbound
    }

    pub fn rank(&self) -> i64 {
        self.shared.rank.load(Ordering::Relaxed)
    }

    /// Lower the peer's rank, returning the new value
    pub fn penalize(&self, amount: i64) -> i64 {
        self.shared.rank.fetch_sub(amount, Ordering::Relaxed) - amount
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            address: self.shared.address.address.clone(),
            port: self.shared.address.port,
            rank: self.rank(),
            direction: self.shared.direction,
        }
    }

    /// Queue a message, registering `handler` for its answers first
    pub async fn send(&self, message: Message, handler: Option<Handler>) -> Result<()> {
        let identifier = message.identifier.clone();
        if let Some(handler) = handler {
            self.shared.dispatcher.lock().await.register(&identifier, handler);
        }

        if self.is_closed() || self.shared.outbound.send(message).await.is_err() {
            self.shared.dispatcher.lock().await.unregister(&identifier);
            return Err(NetworkError::ConnectionClosed {
                addr: self.address().to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Queue a message without waiting for room
    pub fn try_send(&self, message: Message) -> Result<()> {
        let addr = self.address().to_string();
        if self.is_closed() {
            return Err(NetworkError::ConnectionClosed { addr }.into());
        }
        self.shared.outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NetworkError::QueueFull { addr },
            mpsc::error::TrySendError::Closed(_) => NetworkError::ConnectionClosed { addr },
        })?;
        Ok(())
    }

    /// Send a question and collect its answers in order
    ///
    /// `is_final` marks the message that ends the sequence; it stays in the
    /// returned stream.
    pub async fn ask<F>(&self, question: Message, is_final: F) -> Result<Answers>
    where
        F: Fn(&Message) -> bool + Send + 'static,
    {
        let identifier = question.identifier.clone();
        let (pages, receiver) = mpsc::unbounded_channel();
        let handler: Handler = Box::new(move |message: Message, _: &PeerHandle| {
            let done = is_final(&message);
            let _ = pages.send(message);
            done
        });

        self.send(question, Some(handler)).await?;
        Ok(Answers {
            identifier,
            receiver,
            peer: self.clone(),
        })
    }

    /// Route an inbound message through this connection's dispatcher
    pub async fn dispatch(&self, message: Message) {
        self.shared.dispatcher.lock().await.dispatch(message, self);
    }

    pub fn close(&self) {
        self.shared.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Close and drop every continuation tied to this connection
    async fn shutdown(&self) {
        self.shared.closed.cancel();
        self.shared.dispatcher.lock().await.clear();
    }

    /// Same connection, not merely the same address
    pub fn same_connection(&self, other: &PeerHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("address", &self.shared.address)
            .field("direction", &self.shared.direction)
            .field("rank", &self.rank())
            .finish()
    }
}

/// Ordered answers to one question
///
/// Ends after the final answer, or early when the connection goes away.
pub struct Answers {
    identifier: String,
    receiver: mpsc::UnboundedReceiver<Message>,
    peer: PeerHandle,
}

impl Answers {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub async fn next(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Wait at most `timeout` for the next answer
    ///
    /// On timeout the continuation is removed from the dispatcher.
    pub async fn next_within(&mut self, timeout: Duration) -> Result<Option<Message>> {
        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(message) => Ok(message),
            Err(_) => {
                self.cancel().await;
                Err(NetworkError::Timeout { duration: timeout }.into())
            },
        }
    }

    pub async fn cancel(&self) {
        self.peer
            .shared
            .dispatcher
            .lock()
            .await
            .unregister(&self.identifier);
    }
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

/// Dial `address` in a new task
pub fn connect(
    address: PeerAddress,
    rank: i64,
    events: mpsc::UnboundedSender<PeerEvent>,
    timeout: Duration,
) -> PeerHandle {
    let (handle, queue) = PeerHandle::new(address, Direction::Outbound, rank, events.clone());

    let peer = handle.clone();
    tokio::spawn(async move {
        let target = peer.address().to_string();
        match tokio::time::timeout(timeout, TcpStream::connect(&target)).await {
            Ok(Ok(stream)) => {
                info!(peer = %target, "Connected");
                serve(stream, &peer, queue, &events).await;
            },
            Ok(Err(source)) => {
                let error = NetworkError::ConnectionFailed {
                    addr: target.clone(),
                    source,
                };
                warn!(peer = %target, "{}", error);
            },
            Err(_) => {
                warn!(peer = %target, "{}", NetworkError::Timeout { duration: timeout });
            },
        }
        peer.shutdown().await;
        let _ = events.send(PeerEvent::Disconnected(peer));
    });

    handle
}

/// Wrap an accepted stream in a new task
pub fn accept(
    stream: TcpStream,
    remote: SocketAddr,
    events: mpsc::UnboundedSender<PeerEvent>,
) -> PeerHandle {
    let address = PeerAddress::new(remote.ip().to_string(), remote.port());
    let (handle, queue) =
        PeerHandle::new(address, Direction::Inbound, super::DEFAULT_RANK, events.clone());

    let peer = handle.clone();
    tokio::spawn(async move {
        serve(stream, &peer, queue, &events).await;
        peer.shutdown().await;
        let _ = events.send(PeerEvent::Disconnected(peer));
    });

    handle
}

async fn serve(
    stream: TcpStream,
    peer: &PeerHandle,
    queue: mpsc::Receiver<Message>,
    events: &mpsc::UnboundedSender<PeerEvent>,
) {
    let _ = events.send(PeerEvent::Connected(peer.clone()));
    let (reader, writer) = stream.into_split();
    let mut frames = FramedRead::new(reader, codec());
    // Reads never wait on a blocked write
    let writer = tokio::spawn(write_loop(
        FramedWrite::new(writer, codec()),
        peer.clone(),
        queue,
    ));

    loop {
        tokio::select! {
            _ = peer.shared.closed.cancelled() => break,
            frame = frames.next() => match frame {
                Some(Ok(frame)) => match Message::load(&frame) {
                    Some(message) => peer.dispatch(message).await,
                    None => {
                        let rank = peer.penalize(1);
                        warn!(peer = %peer.address(), rank, "Unparsable frame ({} bytes)", frame.len());
                    },
                },
                Some(Err(e)) => {
                    warn!(peer = %peer.address(), "Receive failed: {}", e);
                    break;
                },
                None => break,
            },
        }
    }

    peer.close();
    if let Err(e) = writer.await {
        warn!(peer = %peer.address(), "Writer ended abnormally: {}", e);
    }
    info!(peer = %peer.address(), "Connection closed");
}

/// Drain the outbound queue until the connection closes
async fn write_loop(
    mut sink: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
    peer: PeerHandle,
    mut queue: mpsc::Receiver<Message>,
) {
    loop {
        let message = tokio::select! {
            _ = peer.shared.closed.cancelled() => break,
            outgoing = queue.recv() => match outgoing {
                Some(message) => message,
                None => break,
            },
        };

        let bytes = match message.dump() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(peer = %peer.address(), "Cannot encode message: {}", e);
                continue;
            },
        };
        let sent = tokio::select! {
            _ = peer.shared.closed.cancelled() => break,
            sent = sink.send(Bytes::from(bytes)) => sent,
        };
        if let Err(e) = sent {
            warn!(peer = %peer.address(), "Send failed: {}", e);
            peer.close();
            break;
        }
        if message.kind != MessageType::Answer {
            debug!(peer = %peer.address(), kind = ?message.kind, "Sent {}", message.identifier);
        }
    }
}
