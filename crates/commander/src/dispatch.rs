//! # Dispatcher
//!
//! Resolves a handler identifier against the registry and runs the handler.
//!
//! ## Invariants
//!
//! - Exactly one handler runs per dispatched command, exactly once.
//! - Only connection-aware handlers see the originating connection.
//! - Nothing that goes wrong here is fatal to the connection: unknown
//!   identifiers, undecodable payloads, handler errors and handler panics all
//!   come back as a [`DispatchError`] for the caller to log (or report in a
//!   reply).

use std::any::Any;
use std::panic::AssertUnwindSafe;

use cmdwire::Failure;
use cmdwire::FailureReason;
use futures::FutureExt;

use crate::connection::Connection;
use crate::handler::Outcome;
use crate::registry::HandlerRegistry;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No handler is registered under the identifier.
    #[error("no handler registered for '{0}'")]
    UnknownHandler(String),
    /// The payload did not match the handler's command type.
    #[error("payload did not decode: {0}")]
    Payload(#[source] cmdwire::Error),
    /// The handler returned an error.
    #[error("handler failed: {0:#}")]
    Handler(anyhow::Error),
    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),
    /// A connection-aware handler was invoked without its connection.
    #[error("connection-aware handler invoked without a connection")]
    MissingConnection,
}

impl DispatchError {
    /// The failure reported to a peer waiting on a reply.
    pub fn failure(&self) -> Failure {
        let reason = match self {
            Self::UnknownHandler(_) => FailureReason::UnknownHandler,
            Self::Payload(_) => FailureReason::BadPayload,
            Self::Handler(_) | Self::Panicked(_) | Self::MissingConnection => FailureReason::HandlerFailed,
        };
        Failure::new(reason, self.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: HandlerRegistry,
}

impl Dispatcher {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Runs the handler registered under `handler_id` with `payload`.
    pub async fn dispatch(
        &self,
        handler_id: &str,
        payload: &[u8],
        origin: &Connection,
    ) -> Result<Outcome, DispatchError> {
        let handler = self
            .registry
            .resolve(handler_id)
            .ok_or_else(|| DispatchError::UnknownHandler(handler_id.to_string()))?;

        let injected = handler.kind().wants_connection().then(|| origin.clone());

        match AssertUnwindSafe(handler.invoke(payload, injected)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(DispatchError::Panicked(panic_message(panic))),
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
