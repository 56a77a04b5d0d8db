// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Logging protocol messages

use serde::{Deserialize, Serialize};

use crate::message::{MessageHeader, MAX_PAYLOAD_SIZE};
use crate::types::{read_u32, ClientId, Protocol};
use crate::{CodecError, CodecResult, MessageBuffer};

/// Logging protocol message ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LoggingMessage {
    Unknown = 0,
    LogMessage = 1,
    Enable = 2,
    Disable = 3,
}

impl TryFrom<u8> for LoggingMessage {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        Ok(match value {
            0 => LoggingMessage::Unknown,
            1 => LoggingMessage::LogMessage,
            2 => LoggingMessage::Enable,
            3 => LoggingMessage::Disable,
            other => {
                return Err(CodecError::UnknownValue {
                    kind: "logging message",
                    value: other as u32,
                })
            }
        })
    }
}

/// Severity of a log line, lowest first
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    Verbose = 1,
    #[default]
    Info = 2,
    Alert = 3,
    Error = 4,
    Always = 5,
}

impl TryFrom<u8> for LogLevel {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        Ok(match value {
            0 => LogLevel::Debug,
            1 => LogLevel::Verbose,
            2 => LogLevel::Info,
            3 => LogLevel::Alert,
            4 => LogLevel::Error,
            5 => LogLevel::Always,
            other => {
                return Err(CodecError::UnknownValue {
                    kind: "log level",
                    value: other as u32,
                })
            }
        })
    }
}

/// One log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessagePayload {
    pub level: LogLevel,
    pub category: u32,
    pub text: String,
}

impl LogMessagePayload {
    const TEXT_OFFSET: usize = 8;

    /// Longest text (in bytes) a single message can carry
    pub const MAX_TEXT_LEN: usize = MAX_PAYLOAD_SIZE - Self::TEXT_OFFSET - 1;

    /// Encode; text longer than [`Self::MAX_TEXT_LEN`] is cut on a char boundary
    pub fn encode(&self) -> Vec<u8> {
        let mut end = self.text.len().min(Self::MAX_TEXT_LEN);
        while !self.text.is_char_boundary(end) {
            end -= 1;
        }
        let mut out = Vec::with_capacity(Self::TEXT_OFFSET + end + 1);
        out.push(self.level as u8);
        out.extend_from_slice(&[0, 0, 0]);
        out.extend_from_slice(&self.category.to_le_bytes());
        out.extend_from_slice(&self.text.as_bytes()[..end]);
        out.push(0);
        out
    }

    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        if bytes.len() < Self::TEXT_OFFSET {
            return Err(CodecError::Truncated {
                needed: Self::TEXT_OFFSET,
                actual: bytes.len(),
            });
        }
        let text = &bytes[Self::TEXT_OFFSET..];
        let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
        Ok(Self {
            level: LogLevel::try_from(bytes[0])?,
            category: read_u32(bytes, 4),
            text: String::from_utf8_lossy(&text[..end]).into_owned(),
        })
    }

    /// Wrap in a `LogMessage` from `src` to `dst`
    pub fn to_message(&self, src: ClientId, dst: ClientId) -> MessageBuffer {
        let mut message = MessageBuffer::new(MessageHeader::new(
            src,
            dst,
            Protocol::LOGGING,
            LoggingMessage::LogMessage as u8,
        ));
        // encode() never exceeds the payload capacity
        let _ = message.set_payload(&self.encode());
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BROADCAST_CLIENT_ID;

    #[test]
    fn test_log_message_encoding() {
        let payload = LogMessagePayload {
            level: LogLevel::Alert,
            category: 7,
            text: "pipeline dump written".to_string(),
        };
        let message = payload.to_message(3, BROADCAST_CLIENT_ID);
        assert_eq!(message.header.protocol, Protocol::LOGGING);
        assert_eq!(message.payload()[0], LogLevel::Alert as u8);
        assert_eq!(LogMessagePayload::decode(message.payload()).unwrap(), payload);
    }

    #[test]
    fn test_long_text_is_truncated() {
        let payload = LogMessagePayload {
            level: LogLevel::Info,
            category: 0,
            text: "y".repeat(4000),
        };
        let encoded = payload.encode();
        assert_eq!(encoded.len(), MAX_PAYLOAD_SIZE);
        let decoded = LogMessagePayload::decode(&encoded).unwrap();
        assert_eq!(decoded.text.len(), LogMessagePayload::MAX_TEXT_LEN);
    }

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Error);
        assert!(LogLevel::Always > LogLevel::Alert);
        assert!(LogLevel::try_from(9).is_err());
    }
}
