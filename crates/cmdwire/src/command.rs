//! # Commands
//!
//! A command is a plain serializable value that names the handler which
//! should run it on the receiving peer. The name is an explicit string chosen
//! by the author of the command, never derived from the Rust type, so peers
//! built independently (or in other languages) agree on it.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;

/// A value that can be sent to a remote peer and executed there.
pub trait Command: Serialize + DeserializeOwned + Send + 'static {
    /// Identifier of the handler that executes this command.
    const HANDLER: &'static str;
}

/// A command whose handler answers with a typed response.
pub trait Request: Command {
    type Response: Serialize + DeserializeOwned + Send + 'static;
}

/// Serializes a payload value into the bytes carried inside a frame.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Deserializes a payload carried inside a frame.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}
