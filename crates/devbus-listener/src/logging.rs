//! Bus logging server
//!
//! Publishes log lines as Logging-protocol broadcasts once a tool has
//! enabled logging. This is a bus feature, separate from the process's own
//! `tracing` diagnostics.

use devbus_protocol::{
    LogLevel, LogMessagePayload, LoggingMessage, MessageBuffer, Protocol, BROADCAST_CLIENT_ID,
};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tracing::debug;

use crate::channel::{ChannelSender, ProtocolServer};

/// Destination for bus log lines
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, category: u32, text: &str);
}

/// Logging-protocol server attached to a [`MessageChannel`](crate::MessageChannel)
pub struct LoggingServer {
    sender: ChannelSender,
    enabled: AtomicBool,
    min_level: AtomicU8,
}

impl LoggingServer {
    pub fn new(sender: ChannelSender) -> Self {
        Self {
            sender,
            enabled: AtomicBool::new(false),
            min_level: AtomicU8::new(LogLevel::default() as u8),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn min_level(&self) -> LogLevel {
        LogLevel::try_from(self.min_level.load(Ordering::Acquire)).unwrap_or_default()
    }

    /// Enable publishing for lines at or above `level`
    pub fn enable(&self, level: LogLevel) {
        self.min_level.store(level as u8, Ordering::Release);
        self.enabled.store(true, Ordering::Release);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }
}

impl LogSink for LoggingServer {
    fn log(&self, level: LogLevel, category: u32, text: &str) {
        if !self.is_enabled() || level < self.min_level() || !self.sender.is_connected() {
            return;
        }
        let payload = LogMessagePayload {
            level,
            category,
            text: text.to_string(),
        };
        let message = payload.to_message(self.sender.client_id(), BROADCAST_CLIENT_ID);
        if let Err(e) = self.sender.send(message) {
            debug!("[CHANNEL] Log line dropped: {}", e);
        }
    }
}

impl ProtocolServer for LoggingServer {
    fn protocol(&self) -> Protocol {
        Protocol::LOGGING
    }

    fn handle_message(&self, message: &MessageBuffer, _sender: &ChannelSender) {
        match LoggingMessage::try_from(message.header.message_id) {
            Ok(LoggingMessage::Enable) => {
                let level = message
                    .payload()
                    .first()
                    .and_then(|raw| LogLevel::try_from(*raw).ok())
                    .unwrap_or_default();
                debug!(
                    "[CHANNEL] Logging enabled by client {} at {:?}",
                    message.header.src_client_id, level
                );
                self.enable(level);
            }
            Ok(LoggingMessage::Disable) => {
                debug!(
                    "[CHANNEL] Logging disabled by client {}",
                    message.header.src_client_id
                );
                self.disable();
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MessageChannel, DEFAULT_CONNECT_TIMEOUT};
    use crate::client_manager::ListenerClientManager;
    use crate::router::{RouterCore, RouterSettings};
    use crate::transports::HostTransport;
    use devbus_protocol::MessageHeader;
    use std::sync::Arc;

    fn logging_control(kind: LoggingMessage, payload: &[u8]) -> MessageBuffer {
        let mut message =
            MessageBuffer::new(MessageHeader::new(9, BROADCAST_CLIENT_ID, Protocol::LOGGING, kind as u8));
        message.set_payload(payload).unwrap();
        message
    }

    #[test]
    fn test_enable_and_disable_messages() {
        let transport = HostTransport::new();
        let channel = MessageChannel::new(transport.endpoint().unwrap(), "logging");
        let server = LoggingServer::new(channel.sender());
        assert!(!server.is_enabled());

        server.handle_message(
            &logging_control(LoggingMessage::Enable, &[LogLevel::Alert as u8]),
            &channel.sender(),
        );
        assert!(server.is_enabled());
        assert_eq!(server.min_level(), LogLevel::Alert);

        server.handle_message(&logging_control(LoggingMessage::Disable, &[]), &channel.sender());
        assert!(!server.is_enabled());
    }

    #[test]
    fn test_log_lines_filtered_by_level() {
        let manager =
            Arc::new(ListenerClientManager::default().with_host_transport(HostTransport::new()));
        let endpoint = manager.host_endpoint().unwrap();
        let router = RouterCore::new(RouterSettings::default());
        router.set_client_manager(manager).unwrap();
        router.start("logging test").unwrap();

        let channel = MessageChannel::new(endpoint, "logging");
        let server = LoggingServer::new(channel.sender());
        channel.connect(DEFAULT_CONNECT_TIMEOUT).unwrap();

        // disabled: nothing is sent, and nothing fails
        server.log(LogLevel::Always, 0, "ignored");

        server.enable(LogLevel::Error);
        server.log(LogLevel::Info, 1, "too quiet");
        server.log(LogLevel::Error, 2, "published");
        assert!(server.is_enabled());

        channel.disconnect(crate::channel::DEFAULT_DISCONNECT_TIMEOUT).unwrap();
        server.log(LogLevel::Always, 3, "after disconnect");
        router.stop();
    }
}
