//! Runtime configuration.
//!
//! Every field has a default, so a host can deserialize a partial document
//! (JSON, TOML, ...) and only override what it cares about.

use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommanderConfig {
    /// Address listeners bind to.
    pub bind_host: IpAddr,
    /// Largest accepted frame body, in bytes.
    pub max_frame_len: usize,
    /// How long `call` waits for a reply.
    pub call_timeout_ms: u64,
    /// How long `connect` waits for the TCP handshake.
    pub connect_timeout_ms: u64,
    /// How long a partially received frame may go without progress.
    pub frame_timeout_ms: u64,
    /// Frames buffered per connection ahead of its dispatch task.
    pub dispatch_queue: usize,
    /// Set TCP_NODELAY on every connection.
    pub nodelay: bool,
}

impl Default for CommanderConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            max_frame_len: cmdwire::DEFAULT_MAX_FRAME_LEN,
            call_timeout_ms: 30_000,
            connect_timeout_ms: 5_000,
            frame_timeout_ms: 30_000,
            dispatch_queue: 64,
            nodelay: true,
        }
    }
}

impl CommanderConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    /// Queue depth, never zero.
    pub fn dispatch_queue(&self) -> usize {
        self.dispatch_queue.max(1)
    }

    pub fn with_bind_host(mut self, host: IpAddr) -> Self {
        self.bind_host = host;
        self
    }

    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_dispatch_queue(mut self, depth: usize) -> Self {
        self.dispatch_queue = depth;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CommanderConfig::default();
        assert_eq!(config.bind_host, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.max_frame_len, 16 * 1024 * 1024);
        assert_eq!(config.call_timeout(), Duration::from_secs(30));
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert!(config.nodelay);
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let config: CommanderConfig =
            serde_json::from_str(r#"{ "bind_host": "127.0.0.1", "call_timeout_ms": 250 }"#)
                .expect("valid config");

        assert_eq!(config.bind_host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.call_timeout(), Duration::from_millis(250));
        assert_eq!(config.dispatch_queue, 64);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let parsed = serde_json::from_str::<CommanderConfig>(r#"{ "bind_hots": "127.0.0.1" }"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_zero_queue_is_clamped() {
        let config = CommanderConfig::default().with_dispatch_queue(0);
        assert_eq!(config.dispatch_queue(), 1);
    }
}
