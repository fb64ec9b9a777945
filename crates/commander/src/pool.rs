//! # Connection Pool
//!
//! Live connections keyed by remote endpoint, at most one per endpoint.
//!
//! ## Invariants
//!
//! - A closed connection is never handed out. Closing a connection removes
//!   its entry, and `lookup` filters anything that died in between.
//! - Registering over an existing entry closes the replaced connection.
//! - Removal is guarded by connection id, so a connection going away never
//!   evicts the newer connection that replaced it.
//!
//! The map is a `DashMap`; iteration always works on a snapshot so callbacks
//! may touch the pool (or close connections) without deadlocking on a shard.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::connection::Connection;
use crate::connection::Endpoint;
use crate::error::Error;
use crate::error::Result;

pub(crate) type Entries = DashMap<Endpoint, Connection>;

#[derive(Debug, Clone, Default)]
pub struct ConnectionPool {
    entries: Arc<Entries>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `conn` under `endpoint`, closing any connection it replaces.
    ///
    /// A connection can belong to one pool entry for its whole life.
    pub fn register(&self, endpoint: Endpoint, conn: Connection) -> Result<()> {
        if !conn.is_live() {
            return Err(Error::Closed);
        }
        conn.attach(endpoint, Arc::downgrade(&self.entries))?;

        let replaced = self.entries.insert(endpoint, conn.clone());

        // The connection may have closed before the insert became visible to
        // its own detach; drop the stale entry ourselves.
        if !conn.is_live() {
            self.entries.remove_if(&endpoint, |_, c| c.id() == conn.id());
            return Err(Error::Closed);
        }

        if let Some(old) = replaced {
            if old.id() != conn.id() {
                debug!(endpoint = %endpoint, old = %old.id(), new = %conn.id(), "replacing pooled connection");
                old.close();
            }
        }
        debug!(endpoint = %endpoint, connection = %conn.id(), "connection pooled");
        Ok(())
    }

    /// The live connection for `endpoint`, if any.
    pub fn lookup(&self, endpoint: &Endpoint) -> Option<Connection> {
        let conn = self.entries.get(endpoint).map(|entry| entry.value().clone())?;
        conn.is_live().then_some(conn)
    }

    /// Removes `conn` from the pool if it is still the entry for its endpoint.
    pub fn unregister(&self, conn: &Connection) -> bool {
        let Some(endpoint) = conn.registered_endpoint() else {
            return false;
        };
        self.entries.remove_if(&endpoint, |_, c| c.id() == conn.id()).is_some()
    }

    /// Calls `f` on every live connection.
    pub fn for_each_live(&self, mut f: impl FnMut(&Connection)) {
        for conn in self.connections() {
            f(&conn);
        }
    }

    /// Snapshot of the live connections.
    pub fn connections(&self) -> Vec<Connection> {
        self.entries
            .iter()
            .map(|entry| entry.value().clone())
            .filter(Connection::is_live)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Closes every pooled connection.
    pub fn close_all(&self) {
        for conn in self.connections() {
            conn.close();
        }
    }
}
