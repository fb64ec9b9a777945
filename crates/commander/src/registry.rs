//! # Handler Registry
//!
//! The table from handler identifier to handler. It is populated through a
//! [`RegistryBuilder`] at startup and then frozen into a [`HandlerRegistry`],
//! an immutable map behind an `Arc`. Receive loops resolve handlers without
//! taking any lock, and no handler can be added once traffic flows.

use std::collections::HashMap;
use std::sync::Arc;

use cmdwire::Command;
use cmdwire::Request;

use crate::handler::CommandHandler;
use crate::handler::ConnectionAwareHandler;
use crate::handler::Handler;
use crate::handler::Responder;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("handler '{0}' is already registered")]
    Duplicate(String),
    #[error("handler identifier must not be empty")]
    EmptyIdentifier,
}

/// Mutable table used while the process starts up.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    handlers: HashMap<String, Handler>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `id`.
    ///
    /// Identifiers are unique; registering the same one twice is an error
    /// rather than a silent replacement.
    pub fn register(&mut self, id: impl Into<String>, handler: Handler) -> Result<&mut Self, RegistryError> {
        let id = id.into();
        if id.is_empty() {
            return Err(RegistryError::EmptyIdentifier);
        }
        if self.handlers.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        self.handlers.insert(id, handler);
        Ok(self)
    }

    /// Registers a plain handler under `C::HANDLER`.
    pub fn plain<C, H>(&mut self, handler: H) -> Result<&mut Self, RegistryError>
    where
        C: Command,
        H: CommandHandler<C>,
    {
        self.register(C::HANDLER, Handler::plain::<C, H>(handler))
    }

    /// Registers a connection-aware handler under `C::HANDLER`.
    pub fn connection_aware<C, H>(&mut self, handler: H) -> Result<&mut Self, RegistryError>
    where
        C: Command,
        H: ConnectionAwareHandler<C>,
    {
        self.register(C::HANDLER, Handler::connection_aware::<C, H>(handler))
    }

    /// Registers a responder under `R::HANDLER`.
    pub fn responder<R, H>(&mut self, handler: H) -> Result<&mut Self, RegistryError>
    where
        R: Request,
        H: Responder<R>,
    {
        self.register(R::HANDLER, Handler::responder::<R, H>(handler))
    }

    /// Freezes the table.
    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry { handlers: Arc::new(self.handlers) }
    }
}

/// Frozen, cheaply cloneable handler table.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<HashMap<String, Handler>>,
}

impl HandlerRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn resolve(&self, id: &str) -> Option<&Handler> {
        self.handlers.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.handlers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}
