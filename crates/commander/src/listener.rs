//! # Listener
//!
//! Binds a TCP port and hands every accepted socket to an [`Acceptor`].
//!
//! A bind failure is returned to the caller and never retried. Once bound,
//! the accept loop never dies on a per-connection failure: a failed accept
//! is logged and the loop goes back to accepting.

use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::error::Error;
use crate::error::Result;

/// Pause after a failed accept, so a persistent error (e.g. out of file
/// descriptors) does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Receives each accepted socket.
pub trait Acceptor: Send + Sync + 'static {
    fn accepted(&self, stream: TcpStream, remote: SocketAddr);
}

/// Port selection for [`Listener::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    /// Let the OS pick a free port.
    Any,
    Fixed(u16),
}

impl Port {
    fn number(self) -> u16 {
        match self {
            Self::Any => 0,
            Self::Fixed(port) => port,
        }
    }
}

impl From<u16> for Port {
    fn from(port: u16) -> Self {
        match port {
            0 => Self::Any,
            port => Self::Fixed(port),
        }
    }
}

/// A running accept loop. Dropping it stops accepting; connections that were
/// already accepted are unaffected.
#[derive(Debug)]
pub struct Listener {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Listener {
    /// Binds `host:port` and starts accepting.
    pub async fn start(host: IpAddr, port: impl Into<Port>, acceptor: Arc<dyn Acceptor>) -> Result<Self> {
        let addr = SocketAddr::new(host, port.into().number());
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        Self::run(listener, acceptor)
    }

    /// Adopts an already bound std listener.
    pub fn from_std(listener: std::net::TcpListener, acceptor: Arc<dyn Acceptor>) -> Result<Self> {
        listener.set_nonblocking(true)?;
        Self::run(TcpListener::from_std(listener)?, acceptor)
    }

    fn run(listener: TcpListener, acceptor: Arc<dyn Acceptor>) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        info!(addr = %local_addr, "listening");

        let task = tokio::spawn(accept_loop(listener, acceptor, shutdown.clone()));
        Ok(Self { local_addr, shutdown, task: Some(task) })
    }

    /// The bound port; the actual one when started with [`Port::Any`].
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and waits for the accept loop to exit.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(listener: TcpListener, acceptor: Arc<dyn Acceptor>, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, remote)) => {
                info!(remote = %remote, "accepted connection");
                acceptor.accepted(stream, remote);
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    info!(addr = ?listener.local_addr().ok(), "listener stopped");
}
