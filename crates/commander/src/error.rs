//! # Error Definitions
//!
//! Failures surfaced to callers of the commander runtime. Errors that only
//! concern one connection (protocol violations, disconnections, handler
//! failures) are logged where they happen and never reach the listener or
//! other connections; the variants below are what a caller of `listen`,
//! `connect`, `send` or `call` can observe.

use std::net::SocketAddr;

use cmdwire::Failure;

use crate::registry::RegistryError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The listener could not bind its socket. Fatal at startup, never retried.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    /// Dialing a peer failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    /// Dialing a peer did not finish within the connect timeout.
    #[error("timed out connecting to {0}")]
    ConnectTimeout(SocketAddr),
    /// The connection is closing or closed.
    #[error("connection closed")]
    Closed,
    /// The connection is already registered in a pool.
    #[error("connection already registered")]
    AlreadyRegistered,
    /// A frame could not be encoded, or the stream failed.
    #[error("protocol error: {0}")]
    Protocol(#[from] cmdwire::Error),
    /// Socket level failure outside of framing.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// No reply arrived within the call timeout.
    #[error("request timed out")]
    Timeout,
    /// The remote peer answered a request with a failure.
    #[error("remote failure: {0}")]
    Remote(Failure),
    /// The handler table could not be built.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

pub type Result<T> = std::result::Result<T, Error>;
