// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Message envelope
//!
//! Every message is a 24 byte header followed by at most
//! [`MAX_PAYLOAD_SIZE`] payload bytes:
//!
//! | offset | size | field          |
//! |--------|------|----------------|
//! | 0      | 2    | src client id  |
//! | 2      | 2    | dst client id  |
//! | 4      | 1    | protocol id    |
//! | 5      | 1    | message id     |
//! | 6      | 2    | window size    |
//! | 8      | 4    | payload size   |
//! | 12     | 4    | session id     |
//! | 16     | 8    | sequence       |

use crate::types::{
    read_u16, read_u32, read_u64, ClientId, MessageCode, Protocol, Sequence, SessionId,
    WindowSize, BROADCAST_CLIENT_ID,
};
use crate::{CodecError, CodecResult};

/// Size of the encoded header in bytes
pub const HEADER_SIZE: usize = 24;

/// Largest message (header + payload) any transport carries
pub const MAX_MESSAGE_SIZE: usize = 1408;

/// Payload capacity of a single message
pub const MAX_PAYLOAD_SIZE: usize = MAX_MESSAGE_SIZE - HEADER_SIZE;

/// Fixed-layout message header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader {
    pub src_client_id: ClientId,
    pub dst_client_id: ClientId,
    pub protocol: Protocol,
    pub message_id: MessageCode,
    pub window_size: WindowSize,
    pub payload_size: u32,
    pub session_id: SessionId,
    pub sequence: Sequence,
}

impl MessageHeader {
    /// Create a header with no payload, session or sequence
    pub fn new(
        src_client_id: ClientId,
        dst_client_id: ClientId,
        protocol: Protocol,
        message_id: MessageCode,
    ) -> Self {
        Self {
            src_client_id,
            dst_client_id,
            protocol,
            message_id,
            ..Default::default()
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.dst_client_id == BROADCAST_CLIENT_ID
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..2].copy_from_slice(&self.src_client_id.to_le_bytes());
        out[2..4].copy_from_slice(&self.dst_client_id.to_le_bytes());
        out[4] = self.protocol.0;
        out[5] = self.message_id;
        out[6..8].copy_from_slice(&self.window_size.to_le_bytes());
        out[8..12].copy_from_slice(&self.payload_size.to_le_bytes());
        out[12..16].copy_from_slice(&self.session_id.to_le_bytes());
        out[16..24].copy_from_slice(&self.sequence.to_le_bytes());
        out
    }

    /// Decode a header, rejecting payload sizes beyond the message limit
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(CodecError::Truncated {
                needed: HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let header = Self {
            src_client_id: read_u16(bytes, 0),
            dst_client_id: read_u16(bytes, 2),
            protocol: Protocol(bytes[4]),
            message_id: bytes[5],
            window_size: read_u16(bytes, 6),
            payload_size: read_u32(bytes, 8),
            session_id: read_u32(bytes, 12),
            sequence: read_u64(bytes, 16),
        };

        if header.payload_size as usize > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge {
                size: header.payload_size as usize,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        Ok(header)
    }
}

/// Header plus payload
///
/// `header.payload_size` always equals `payload.len()`; the payload is only
/// reachable through methods that keep the two in sync.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageBuffer {
    pub header: MessageHeader,
    payload: Vec<u8>,
}

impl MessageBuffer {
    /// Create a message with an empty payload
    pub fn new(mut header: MessageHeader) -> Self {
        header.payload_size = 0;
        Self {
            header,
            payload: Vec::new(),
        }
    }

    /// Create a message carrying `payload`
    pub fn with_payload(header: MessageHeader, payload: &[u8]) -> CodecResult<Self> {
        let mut message = Self::new(header);
        message.set_payload(payload)?;
        Ok(message)
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Replace the payload, updating the header's payload size
    pub fn set_payload(&mut self, payload: &[u8]) -> CodecResult<()> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        self.payload.clear();
        self.payload.extend_from_slice(payload);
        self.header.payload_size = payload.len() as u32;
        Ok(())
    }

    /// Total encoded size
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut header = self.header;
        header.payload_size = self.payload.len() as u32;
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode one message from the front of `bytes`
    ///
    /// Trailing bytes past the declared payload are ignored.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let header = MessageHeader::decode(bytes)?;
        let end = HEADER_SIZE + header.payload_size as usize;
        if bytes.len() < end {
            return Err(CodecError::Truncated {
                needed: end,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            header,
            payload: bytes[HEADER_SIZE..end].to_vec(),
        })
    }
}
