//! # Connection
//!
//! One live, bidirectional session with a peer. Both sides of a connection
//! are equal: either may send commands, and handlers on either side may use
//! the connection they were invoked on to send commands back.
//!
//! ## Tasks
//!
//! Each connection runs two tasks:
//!
//! - the **receive loop** reads frames, routes replies straight to waiting
//!   callers, and queues commands and requests;
//! - the **dispatch loop** drains that queue one frame at a time, so handlers
//!   see commands in the order they arrived on this connection, while
//!   different connections run concurrently.
//!
//! Replies bypass the queue, so a handler may `call` over its own connection
//! without waiting on itself.
//!
//! ## Lifecycle
//!
//! `Open -> Active -> Closing -> Closed`, never backwards. Closing starts on
//! an explicit `close`, an I/O error, or a framing error; it cancels both
//! tasks, removes the connection from its pool and fails pending calls. The
//! receive loop then releases the socket and marks the connection `Closed`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::Weak;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use cmdwire::Command;
use cmdwire::Failure;
use cmdwire::Frame;
use cmdwire::FrameCodec;
use cmdwire::Request;
use dashmap::DashMap;
use futures::SinkExt;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio_util::codec::FramedRead;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::config::CommanderConfig;
use crate::disconnect::is_disconnection;
use crate::dispatch::DispatchError;
use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::error::Result;
use crate::handler::Outcome;
use crate::pool::Entries;

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static CURRENT: Connection;
}

/// Process-unique connection identifier.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Identity of a remote peer, used as the pool key.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct Endpoint(pub SocketAddr);

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Open = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Open,
            1 => Self::Active,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Why the receive loop stopped.
#[derive(Debug)]
enum CloseReason {
    Requested,
    PeerClosed,
    Protocol(cmdwire::Error),
}

type PendingReply = oneshot::Sender<std::result::Result<Vec<u8>, Failure>>;

/// Where this connection is pooled, so it can remove itself on close.
struct Registration {
    endpoint: Endpoint,
    entries: Weak<Entries>,
}

struct Inner {
    id: ConnectionId,
    endpoint: Endpoint,
    state: AtomicU8,
    writer: Mutex<Option<FramedWrite<BoxWriter, FrameCodec>>>,
    shutdown: CancellationToken,
    closed: CancellationToken,
    pending: DashMap<u64, PendingReply>,
    seq_gen: AtomicU64,
    registration: OnceLock<Registration>,
    call_timeout: Duration,
    frame_timeout: Duration,
}

/// A cheap, cloneable handle to a live session.
///
/// Clones share one socket. Holding a handle does not keep the session open:
/// after `close` every operation fails with [`Error::Closed`].
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Wraps an accepted or dialed TCP stream and starts its tasks.
    pub fn from_tcp(stream: TcpStream, endpoint: Endpoint, dispatcher: Dispatcher, config: &CommanderConfig) -> Self {
        let (reader, writer) = stream.into_split();
        Self::spawn(Box::new(reader), Box::new(writer), endpoint, dispatcher, config)
    }

    /// Starts a connection over any byte stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        reader: BoxReader,
        writer: BoxWriter,
        endpoint: Endpoint,
        dispatcher: Dispatcher,
        config: &CommanderConfig,
    ) -> Self {
        let codec = FrameCodec::with_max_frame_len(config.max_frame_len);
        let conn = Self {
            inner: Arc::new(Inner {
                id: ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)),
                endpoint,
                state: AtomicU8::new(ConnectionState::Open as u8),
                writer: Mutex::new(Some(FramedWrite::new(writer, codec))),
                shutdown: CancellationToken::new(),
                closed: CancellationToken::new(),
                pending: DashMap::new(),
                seq_gen: AtomicU64::new(1),
                registration: OnceLock::new(),
                call_timeout: config.call_timeout(),
                frame_timeout: config.frame_timeout(),
            }),
        };

        let frames = FramedRead::new(reader, codec);
        let (queue_tx, queue_rx) = mpsc::channel(config.dispatch_queue());

        let _ = conn.inner.state.compare_exchange(
            ConnectionState::Open as u8,
            ConnectionState::Active as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        tokio::spawn(receive_loop(conn.clone(), frames, queue_tx));
        tokio::spawn(dispatch_loop(conn.clone(), dispatcher, queue_rx));

        debug!(connection = %conn.id(), endpoint = %endpoint, "connection active");
        conn
    }

    /// The connection whose dispatch task is running the caller, if any.
    pub fn current() -> Option<Connection> {
        CURRENT.try_with(Connection::clone).ok()
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn endpoint(&self) -> Endpoint {
        self.inner.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// True until closing starts.
    pub fn is_live(&self) -> bool {
        self.state() < ConnectionState::Closing
    }

    /// Sends a fire-and-forget command.
    pub async fn send<C: Command>(&self, command: &C) -> Result<()> {
        self.send_frame(Frame::command(command)?).await
    }

    /// Sends a request and waits for the peer's response.
    pub async fn call<R: Request>(&self, request: &R) -> Result<R::Response> {
        let seq = self.inner.seq_gen.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::request(seq, request)?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(seq, tx);

        // Closing clears `pending` after flipping the state; re-checking here
        // means either we see the flip or the clear drops our sender.
        if !self.is_live() {
            self.inner.pending.remove(&seq);
            return Err(Error::Closed);
        }

        if let Err(e) = self.send_frame(frame).await {
            self.inner.pending.remove(&seq);
            return Err(e);
        }

        let reply = match tokio::time::timeout(self.inner.call_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(Error::Closed),
            Err(_) => {
                self.inner.pending.remove(&seq);
                return Err(Error::Timeout);
            }
        };

        let payload = reply.map_err(Error::Remote)?;
        Ok(cmdwire::decode_payload(&payload)?)
    }

    /// Starts closing the connection. Idempotent, never blocks.
    pub fn close(&self) {
        self.begin_close();
    }

    /// Resolves once the connection is fully closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    pub(crate) async fn send_frame(&self, frame: Frame) -> Result<()> {
        if !self.is_live() {
            return Err(Error::Closed);
        }

        let written = tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => return Err(Error::Closed),
            written = self.write(frame) => written,
        };

        // Encoding errors leave the stream intact; a failed write does not.
        if let Err(Error::Protocol(cmdwire::Error::Io(e))) = &written {
            if is_disconnection(e) {
                debug!(connection = %self.id(), error = %e, "peer went away during write");
            } else {
                warn!(connection = %self.id(), error = %e, "write failed");
            }
            self.begin_close();
        }
        written
    }

    async fn write(&self, frame: Frame) -> Result<()> {
        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::Closed)?;
        writer.send(frame).await?;
        Ok(())
    }

    /// Returns false if the connection was already closing.
    fn begin_close(&self) -> bool {
        let closing = ConnectionState::Closing as u8;
        let flipped = self
            .inner
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| (s < closing).then_some(closing))
            .is_ok();
        if !flipped {
            return false;
        }

        self.inner.shutdown.cancel();
        self.detach();
        // Dropping the senders wakes every waiting `call` with `Closed`.
        self.inner.pending.clear();
        true
    }

    /// Binds this connection to a pool entry. Fails if already bound.
    pub(crate) fn attach(&self, endpoint: Endpoint, entries: Weak<Entries>) -> Result<()> {
        self.inner
            .registration
            .set(Registration { endpoint, entries })
            .map_err(|_| Error::AlreadyRegistered)
    }

    /// The key this connection was pooled under.
    pub(crate) fn registered_endpoint(&self) -> Option<Endpoint> {
        self.inner.registration.get().map(|r| r.endpoint)
    }

    fn detach(&self) {
        let Some(reg) = self.inner.registration.get() else { return };
        let Some(entries) = reg.entries.upgrade() else { return };
        entries.remove_if(&reg.endpoint, |_, c| c.id() == self.id());
    }

    fn complete(&self, seq: u64, status: std::result::Result<Vec<u8>, Failure>) {
        match self.inner.pending.remove(&seq) {
            Some((_, tx)) => {
                let _ = tx.send(status);
            }
            None => debug!(connection = %self.id(), seq, "reply for unknown or expired request"),
        }
    }

    /// Reads the next frame, failing a partial frame that stops making progress.
    async fn next_frame(&self, frames: &mut FramedRead<BoxReader, FrameCodec>) -> Option<cmdwire::Result<Frame>> {
        let mut partial = None;
        loop {
            match tokio::time::timeout(self.inner.frame_timeout, frames.next()).await {
                Ok(next) => return next,
                Err(_) => {
                    let buffered = frames.read_buffer().len();
                    if buffered == 0 {
                        partial = None;
                    } else if partial == Some(buffered) {
                        return Some(Err(cmdwire::Error::Stalled));
                    } else {
                        partial = Some(buffered);
                    }
                }
            }
        }
    }

    async fn finish(&self, reason: CloseReason) {
        self.begin_close();

        match &reason {
            CloseReason::Requested => debug!(connection = %self.id(), "connection closed"),
            CloseReason::PeerClosed => debug!(connection = %self.id(), "peer closed connection"),
            CloseReason::Protocol(e) if is_disconnection(e) => {
                debug!(connection = %self.id(), error = %e, "peer disconnected")
            }
            CloseReason::Protocol(e) => {
                warn!(connection = %self.id(), endpoint = %self.endpoint(), error = %e, "protocol error, closing connection")
            }
        }

        // Dropping the write half shuts the socket down.
        drop(self.inner.writer.lock().await.take());
        self.inner.state.store(ConnectionState::Closed as u8, Ordering::SeqCst);
        self.inner.closed.cancel();
    }

    async fn process(&self, dispatcher: &Dispatcher, frame: Frame) {
        match frame {
            Frame::Command { handler, payload } => {
                if let Err(e) = dispatcher.dispatch(&handler, &payload, self).await {
                    self.log_dispatch_failure(&handler, &e);
                }
            }
            Frame::Request { seq, handler, payload } => {
                let reply = match dispatcher.dispatch(&handler, &payload, self).await {
                    Ok(Outcome::Response(bytes)) => Frame::Reply { seq, status: Ok(bytes) },
                    Ok(Outcome::Done) => match Frame::reply_ok(seq, &()) {
                        Ok(frame) => frame,
                        Err(e) => Frame::reply_err(seq, DispatchError::Payload(e).failure()),
                    },
                    Err(e) => {
                        self.log_dispatch_failure(&handler, &e);
                        Frame::reply_err(seq, e.failure())
                    }
                };
                if let Err(e) = self.send_frame(reply).await {
                    debug!(connection = %self.id(), seq, error = %e, "could not deliver reply");
                }
            }
            Frame::Reply { seq, .. } => {
                debug!(connection = %self.id(), seq, "reply reached dispatch queue, dropping")
            }
        }
    }

    fn log_dispatch_failure(&self, handler: &str, error: &DispatchError) {
        match error {
            DispatchError::UnknownHandler(_) => {
                warn!(connection = %self.id(), handler, "unknown handler, command dropped")
            }
            _ => warn!(connection = %self.id(), handler, error = %error, "command failed"),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

async fn receive_loop(conn: Connection, mut frames: FramedRead<BoxReader, FrameCodec>, queue: mpsc::Sender<Frame>) {
    let reason = loop {
        let next = tokio::select! {
            biased;
            _ = conn.inner.shutdown.cancelled() => break CloseReason::Requested,
            next = conn.next_frame(&mut frames) => next,
        };

        match next {
            None => break CloseReason::PeerClosed,
            Some(Err(e)) => break CloseReason::Protocol(e),
            Some(Ok(Frame::Reply { seq, status })) => conn.complete(seq, status),
            Some(Ok(frame)) => {
                let queued = tokio::select! {
                    biased;
                    _ = conn.inner.shutdown.cancelled() => break CloseReason::Requested,
                    queued = queue.send(frame) => queued,
                };
                if queued.is_err() {
                    break CloseReason::Requested;
                }
            }
        }
    };

    drop(frames);
    conn.finish(reason).await;
}

async fn dispatch_loop(conn: Connection, dispatcher: Dispatcher, mut queue: mpsc::Receiver<Frame>) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = conn.inner.shutdown.cancelled() => break,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let work = CURRENT.scope(conn.clone(), conn.process(&dispatcher, frame));
        tokio::select! {
            biased;
            _ = conn.inner.shutdown.cancelled() => break,
            _ = work => {}
        }
    }
    debug!(connection = %conn.id(), "dispatch stopped");
}
