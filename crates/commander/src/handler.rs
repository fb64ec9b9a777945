//! # Handlers
//!
//! The behavior a peer runs when a command arrives. There are three variants,
//! fixed at registration time:
//!
//! - **Plain**: receives the decoded command.
//! - **Connection-aware**: also receives a handle to the connection the
//!   command arrived on, so it can push commands back toward the caller.
//! - **Responder**: answers a [`Request`] with a typed response.
//!
//! One instance serves every matching command on every connection, so
//! implementations must tolerate concurrent invocation.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use cmdwire::Command;
use cmdwire::Request;

use crate::connection::Connection;
use crate::dispatch::DispatchError;

/// What a handler body returns.
pub type HandlerResult<T = ()> = anyhow::Result<T>;

#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync + 'static {
    async fn run(&self, command: C) -> HandlerResult;
}

#[async_trait]
pub trait ConnectionAwareHandler<C: Command>: Send + Sync + 'static {
    /// `connection` is a non-owning handle; the pool decides its lifetime.
    async fn run(&self, command: C, connection: Connection) -> HandlerResult;
}

#[async_trait]
pub trait Responder<R: Request>: Send + Sync + 'static {
    async fn respond(&self, request: R) -> HandlerResult<R::Response>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Plain,
    ConnectionAware,
    Responder,
}

impl HandlerKind {
    /// Whether the dispatcher must inject the originating connection.
    pub fn wants_connection(self) -> bool {
        matches!(self, Self::ConnectionAware)
    }
}

/// Result of one successful invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// Serialized response of a responder.
    Response(Vec<u8>),
}

#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn invoke(&self, payload: &[u8], origin: Option<Connection>) -> Result<Outcome, DispatchError>;
}

/// A type-erased, shareable handler tagged with its variant.
#[derive(Clone)]
pub struct Handler {
    kind: HandlerKind,
    inner: Arc<dyn ErasedHandler>,
}

impl Handler {
    pub fn plain<C, H>(handler: H) -> Self
    where
        C: Command,
        H: CommandHandler<C>,
    {
        Self {
            kind: HandlerKind::Plain,
            inner: Arc::new(Plain { handler, _command: PhantomData }),
        }
    }

    pub fn connection_aware<C, H>(handler: H) -> Self
    where
        C: Command,
        H: ConnectionAwareHandler<C>,
    {
        Self {
            kind: HandlerKind::ConnectionAware,
            inner: Arc::new(Aware { handler, _command: PhantomData }),
        }
    }

    pub fn responder<R, H>(handler: H) -> Self
    where
        R: Request,
        H: Responder<R>,
    {
        Self {
            kind: HandlerKind::Responder,
            inner: Arc::new(Respond { handler, _request: PhantomData }),
        }
    }

    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    /// Decodes `payload` into the handler's command type and runs it.
    pub(crate) async fn invoke(&self, payload: &[u8], origin: Option<Connection>) -> Result<Outcome, DispatchError> {
        self.inner.invoke(payload, origin).await
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler").field("kind", &self.kind).finish_non_exhaustive()
    }
}

// Adapters from the typed traits to the erased one.

struct Plain<C, H> {
    handler: H,
    _command: PhantomData<fn() -> C>,
}

#[async_trait]
impl<C, H> ErasedHandler for Plain<C, H>
where
    C: Command,
    H: CommandHandler<C>,
{
    async fn invoke(&self, payload: &[u8], _origin: Option<Connection>) -> Result<Outcome, DispatchError> {
        let command: C = cmdwire::decode_payload(payload).map_err(DispatchError::Payload)?;
        self.handler.run(command).await.map_err(DispatchError::Handler)?;
        Ok(Outcome::Done)
    }
}

struct Aware<C, H> {
    handler: H,
    _command: PhantomData<fn() -> C>,
}

#[async_trait]
impl<C, H> ErasedHandler for Aware<C, H>
where
    C: Command,
    H: ConnectionAwareHandler<C>,
{
    async fn invoke(&self, payload: &[u8], origin: Option<Connection>) -> Result<Outcome, DispatchError> {
        let connection = origin.ok_or(DispatchError::MissingConnection)?;
        let command: C = cmdwire::decode_payload(payload).map_err(DispatchError::Payload)?;
        self.handler.run(command, connection).await.map_err(DispatchError::Handler)?;
        Ok(Outcome::Done)
    }
}

struct Respond<R, H> {
    handler: H,
    _request: PhantomData<fn() -> R>,
}

#[async_trait]
impl<R, H> ErasedHandler for Respond<R, H>
where
    R: Request,
    H: Responder<R>,
{
    async fn invoke(&self, payload: &[u8], _origin: Option<Connection>) -> Result<Outcome, DispatchError> {
        let request: R = cmdwire::decode_payload(payload).map_err(DispatchError::Payload)?;
        let response = self.handler.respond(request).await.map_err(DispatchError::Handler)?;
        let bytes = cmdwire::encode_payload(&response).map_err(DispatchError::Payload)?;
        Ok(Outcome::Response(bytes))
    }
}
