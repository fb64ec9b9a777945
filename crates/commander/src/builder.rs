//! Fluent setup for a [`Commander`].
//!
//! ```ignore
//! let commander = Commander::builder()
//!     .plain::<Ping, _>(PingHandler)
//!     .connection_aware::<Grab, _>(GrabHandler::default())
//!     .configure(|c| c.with_call_timeout(Duration::from_secs(5)))
//!     .build()?;
//! ```
//!
//! Registration errors are held until `build`, so the chain stays linear.

use cmdwire::Command;
use cmdwire::Request;

use crate::config::CommanderConfig;
use crate::error::Result;
use crate::handler::CommandHandler;
use crate::handler::ConnectionAwareHandler;
use crate::handler::Handler;
use crate::handler::Responder;
use crate::registry::RegistryBuilder;
use crate::registry::RegistryError;
use crate::runtime::Commander;

#[derive(Debug, Default)]
pub struct CommanderBuilder {
    registry: RegistryBuilder,
    config: CommanderConfig,
    error: Option<RegistryError>,
}

impl CommanderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plain<C, H>(self, handler: H) -> Self
    where
        C: Command,
        H: CommandHandler<C>,
    {
        self.handler(C::HANDLER, Handler::plain::<C, H>(handler))
    }

    pub fn connection_aware<C, H>(self, handler: H) -> Self
    where
        C: Command,
        H: ConnectionAwareHandler<C>,
    {
        self.handler(C::HANDLER, Handler::connection_aware::<C, H>(handler))
    }

    pub fn responder<R, H>(self, handler: H) -> Self
    where
        R: Request,
        H: Responder<R>,
    {
        self.handler(R::HANDLER, Handler::responder::<R, H>(handler))
    }

    /// Registers a pre-built handler under an explicit identifier.
    pub fn handler(mut self, id: impl Into<String>, handler: Handler) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.registry.register(id, handler) {
                self.error = Some(e);
            }
        }
        self
    }

    pub fn config(mut self, config: CommanderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn configure(mut self, f: impl FnOnce(CommanderConfig) -> CommanderConfig) -> Self {
        self.config = f(self.config);
        self
    }

    /// Freezes the handler table and creates the runtime.
    ///
    /// Fails with the first registration error, if any.
    pub fn build(self) -> Result<Commander> {
        if let Some(e) = self.error {
            return Err(e.into());
        }
        Ok(Commander::new(self.config, self.registry.build()))
    }
}
