//! # Commander
//!
//! Bidirectional remote command execution over pooled TCP connections.
//!
//! ## Philosophy
//!
//! There is no client and no server. A process that listens and a process
//! that dials end up holding the same kind of [`Connection`], and either one
//! may send commands over it. A command is a serde value that names its
//! handler; the receiving side decodes it and runs whatever it registered
//! under that name.
//!
//! ## Architecture
//!
//! - **Listener**: accepts sockets and hands them to the runtime.
//! - **Connection**: one session; a receive task and an ordered dispatch task.
//! - **ConnectionPool**: at most one live connection per remote endpoint.
//! - **Dispatcher**: resolves a handler and runs it, isolating its failures.
//! - **HandlerRegistry**: identifier to handler table, frozen at startup.
//! - **Commander**: ties the above together behind `listen` and `connect`.
//!
//! The wire format lives in the `cmdwire` crate.

pub mod builder;
pub mod config;
pub mod connection;
pub mod disconnect;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod listener;
pub mod pool;
pub mod registry;
pub mod runtime;

#[cfg(test)]
mod mock_transport;
#[cfg(test)]
mod tests;

pub use builder::CommanderBuilder;
pub use cmdwire::Command;
pub use cmdwire::Request;
pub use config::CommanderConfig;
pub use connection::Connection;
pub use connection::ConnectionId;
pub use connection::ConnectionState;
pub use connection::Endpoint;
pub use disconnect::is_disconnection;
pub use dispatch::DispatchError;
pub use dispatch::Dispatcher;
pub use error::Error;
pub use error::Result;
pub use handler::CommandHandler;
pub use handler::ConnectionAwareHandler;
pub use handler::Handler;
pub use handler::HandlerKind;
pub use handler::HandlerResult;
pub use handler::Responder;
pub use listener::Acceptor;
pub use listener::Listener;
pub use listener::Port;
pub use pool::ConnectionPool;
pub use registry::HandlerRegistry;
pub use registry::RegistryBuilder;
pub use registry::RegistryError;
pub use runtime::Commander;
