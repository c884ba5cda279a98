use crate::decoder::{JsonModelDecoder, ModelDecoder};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default cap on any single inbound message: 4 MiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

#[derive(Clone)]
pub struct ClientConfig {
    /// Upper bound on every decoded response and push message, in bytes.
    pub max_message_size: usize,
    pub handshake_timeout: Duration,
    pub ping_interval: Duration,
    pub command_queue_size: usize,
    pub decoder: Arc<dyn ModelDecoder>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            handshake_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(15),
            command_queue_size: 100,
            decoder: Arc::new(JsonModelDecoder),
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("max_message_size", &self.max_message_size)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("ping_interval", &self.ping_interval)
            .field("command_queue_size", &self.command_queue_size)
            .finish_non_exhaustive()
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_command_queue_size(mut self, size: usize) -> Self {
        self.command_queue_size = size;
        self
    }

    pub fn with_decoder(mut self, decoder: impl ModelDecoder) -> Self {
        self.decoder = Arc::new(decoder);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.max_message_size, 4 * 1024 * 1024);
        assert_eq!(config.ping_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_builders() {
        let config = ClientConfig::new()
            .with_max_message_size(1024)
            .with_handshake_timeout(Duration::from_millis(50))
            .with_command_queue_size(8);
        assert_eq!(config.max_message_size, 1024);
        assert_eq!(config.handshake_timeout, Duration::from_millis(50));
        assert_eq!(config.command_queue_size, 8);
        assert!(format!("{config:?}").contains("max_message_size: 1024"));
    }
}
