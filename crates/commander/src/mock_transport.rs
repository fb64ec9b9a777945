//! In-memory transports for testing.
//!
//! These are used internally by the test suite and are not part of the public API.

use std::net::Ipv4Addr;
use std::net::SocketAddr;

use tokio::io::DuplexStream;
use tokio::io::ReadHalf;
use tokio::io::WriteHalf;

use crate::config::CommanderConfig;
use crate::connection::Connection;
use crate::connection::Endpoint;
use crate::dispatch::Dispatcher;

const BUFFER: usize = 64 * 1024;

/// A made-up endpoint for in-memory connections.
pub fn endpoint(port: u16) -> Endpoint {
    Endpoint(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
}

/// Two connections wired to each other through a duplex pipe.
///
/// `a` dispatches into `left`, `b` into `right`.
pub fn connected_pair(left: Dispatcher, right: Dispatcher, config: &CommanderConfig) -> (Connection, Connection) {
    let (near, far) = tokio::io::duplex(BUFFER);
    let (near_read, near_write) = tokio::io::split(near);
    let (far_read, far_write) = tokio::io::split(far);

    let a = Connection::spawn(Box::new(near_read), Box::new(near_write), endpoint(1), left, config);
    let b = Connection::spawn(Box::new(far_read), Box::new(far_write), endpoint(2), right, config);
    (a, b)
}

/// The raw far end of a connection, for writing arbitrary bytes at it.
pub struct RawPeer {
    pub read: ReadHalf<DuplexStream>,
    pub write: WriteHalf<DuplexStream>,
}

/// A connection whose peer is a raw byte pipe.
pub fn raw(dispatcher: Dispatcher, config: &CommanderConfig) -> (Connection, RawPeer) {
    let (near, far) = tokio::io::duplex(BUFFER);
    let (near_read, near_write) = tokio::io::split(near);
    let (read, write) = tokio::io::split(far);

    let conn = Connection::spawn(Box::new(near_read), Box::new(near_write), endpoint(3), dispatcher, config);
    (conn, RawPeer { read, write })
}
