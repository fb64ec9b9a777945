//! # Commander
//!
//! The per-process runtime: frozen handler table, connection pool and
//! configuration, shared by every listener and every dialed connection.
//!
//! Accepted and dialed connections are treated the same way. Both are pooled
//! under the remote endpoint and both dispatch inbound commands, so either
//! side may send to the other.

use std::net::SocketAddr;
use std::sync::Arc;

use cmdwire::Command;
use cmdwire::Request;
use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::warn;

use crate::builder::CommanderBuilder;
use crate::config::CommanderConfig;
use crate::connection::Connection;
use crate::connection::Endpoint;
use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::error::Result;
use crate::listener::Acceptor;
use crate::listener::Listener;
use crate::listener::Port;
use crate::pool::ConnectionPool;
use crate::registry::HandlerRegistry;

struct Shared {
    config: CommanderConfig,
    dispatcher: Dispatcher,
    pool: ConnectionPool,
    /// Serializes dials per endpoint so concurrent `connect`s share one socket.
    dialing: DashMap<Endpoint, Arc<Mutex<()>>>,
}

#[derive(Clone)]
pub struct Commander {
    shared: Arc<Shared>,
}

impl Commander {
    pub fn builder() -> CommanderBuilder {
        CommanderBuilder::new()
    }

    pub(crate) fn new(config: CommanderConfig, registry: HandlerRegistry) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                dispatcher: Dispatcher::new(registry),
                pool: ConnectionPool::new(),
                dialing: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &CommanderConfig {
        &self.shared.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.shared.pool
    }

    pub fn registry(&self) -> &HandlerRegistry {
        self.shared.dispatcher.registry()
    }

    /// Starts accepting on `port` at the configured bind host.
    pub async fn listen(&self, port: impl Into<Port>) -> Result<Listener> {
        Listener::start(self.shared.config.bind_host, port, Arc::new(self.clone())).await
    }

    /// Starts accepting on an already bound listener.
    pub fn listen_std(&self, listener: std::net::TcpListener) -> Result<Listener> {
        Listener::from_std(listener, Arc::new(self.clone()))
    }

    /// Wraps an established stream in a pooled connection.
    pub fn attach(&self, stream: TcpStream, endpoint: Endpoint) -> Result<Connection> {
        if self.shared.config.nodelay {
            stream.set_nodelay(true)?;
        }
        let conn = Connection::from_tcp(stream, endpoint, self.shared.dispatcher.clone(), &self.shared.config);
        if let Err(e) = self.shared.pool.register(endpoint, conn.clone()) {
            conn.close();
            return Err(e);
        }
        Ok(conn)
    }

    /// Returns the pooled connection to `addr`, dialing if there is none.
    pub async fn connect(&self, addr: SocketAddr) -> Result<Connection> {
        let endpoint = Endpoint(addr);
        if let Some(conn) = self.shared.pool.lookup(&endpoint) {
            return Ok(conn);
        }

        let lock = self.shared.dialing.entry(endpoint).or_default().clone();
        let _guard = lock.lock().await;

        if let Some(conn) = self.shared.pool.lookup(&endpoint) {
            return Ok(conn);
        }

        debug!(addr = %addr, "dialing");
        let stream = tokio::time::timeout(self.shared.config.connect_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| Error::ConnectTimeout(addr))?
            .map_err(|source| Error::Connect { addr, source })?;
        self.attach(stream, endpoint)
    }

    /// Sends `command` to `addr`, reusing or establishing the connection.
    pub async fn send_to<C: Command>(&self, addr: SocketAddr, command: &C) -> Result<()> {
        self.connect(addr).await?.send(command).await
    }

    /// Calls `request` on `addr`, reusing or establishing the connection.
    pub async fn call<R: Request>(&self, addr: SocketAddr, request: &R) -> Result<R::Response> {
        self.connect(addr).await?.call(request).await
    }

    pub fn close_all(&self) {
        self.shared.pool.close_all();
    }
}

impl Acceptor for Commander {
    fn accepted(&self, stream: TcpStream, remote: SocketAddr) {
        if let Err(e) = self.attach(stream, Endpoint(remote)) {
            warn!(remote = %remote, error = %e, "could not set up accepted connection");
        }
    }
}

impl std::fmt::Debug for Commander {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Commander")
            .field("config", &self.shared.config)
            .field("handlers", &self.registry().len())
            .field("connections", &self.shared.pool.len())
            .finish()
    }
}
