// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Client-management protocol
//!
//! Connection establishment happens before a client owns an id, so those
//! messages travel "out of band": both src and dst are the broadcast id and
//! the sequence field carries the sender's message version instead of a
//! sequence number.

use crate::message::{MessageBuffer, MessageHeader};
use crate::types::{
    expect_len, read_u16, read_u32, ClientId, Component, Protocol, ResultCode, StatusFlags,
    BROADCAST_CLIENT_ID, DISTRIBUTED_STATUS_FLAGS_VERSION, MESSAGE_VERSION,
    MIN_SUPPORTED_MESSAGE_VERSION,
};
use crate::{CodecError, CodecResult};

/// Client-management message ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ManagementMessage {
    Unknown = 0,
    ConnectRequest = 1,
    ConnectResponse = 2,
    DisconnectNotification = 3,
    DisconnectResponse = 4,
    SetClientFlags = 5,
    SetClientFlagsResponse = 6,
    QueryStatus = 7,
    QueryStatusResponse = 8,
    KeepAlive = 9,
}

impl TryFrom<u8> for ManagementMessage {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        Ok(match value {
            0 => ManagementMessage::Unknown,
            1 => ManagementMessage::ConnectRequest,
            2 => ManagementMessage::ConnectResponse,
            3 => ManagementMessage::DisconnectNotification,
            4 => ManagementMessage::DisconnectResponse,
            5 => ManagementMessage::SetClientFlags,
            6 => ManagementMessage::SetClientFlagsResponse,
            7 => ManagementMessage::QueryStatus,
            8 => ManagementMessage::QueryStatusResponse,
            9 => ManagementMessage::KeepAlive,
            other => {
                return Err(CodecError::UnknownValue {
                    kind: "management message",
                    value: other as u32,
                })
            }
        })
    }
}

impl ManagementMessage {
    /// Build a client-management message addressed from `src` to `dst`
    pub fn message(self, src: ClientId, dst: ClientId) -> MessageBuffer {
        MessageBuffer::new(MessageHeader::new(
            src,
            dst,
            Protocol::CLIENT_MANAGEMENT,
            self as u8,
        ))
    }

    /// Build an out-of-band message stamped with the current version
    pub fn out_of_band(self) -> MessageBuffer {
        let mut message = out_of_band_message();
        message.header.message_id = self as u8;
        message
    }
}

/// How SetClientFlags / QueryStatus are answered for a connection
///
/// Chosen once from the version a client connected with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusFlagsMode {
    /// Status flags live in the client manager (older peers)
    Centralized,
    /// Every client owns its own status flags
    Distributed,
}

impl StatusFlagsMode {
    pub fn for_version(version: u32) -> Self {
        if version >= DISTRIBUTED_STATUS_FLAGS_VERSION {
            StatusFlagsMode::Distributed
        } else {
            StatusFlagsMode::Centralized
        }
    }
}

/// Empty out-of-band client-management message
pub fn out_of_band_message() -> MessageBuffer {
    let mut header = MessageHeader::new(
        BROADCAST_CLIENT_ID,
        BROADCAST_CLIENT_ID,
        Protocol::CLIENT_MANAGEMENT,
        ManagementMessage::Unknown as u8,
    );
    header.sequence = MESSAGE_VERSION as u64;
    MessageBuffer::new(header)
}

/// True when the message carries the out-of-band src/dst pairing
pub fn is_out_of_band(header: &MessageHeader) -> bool {
    header.src_client_id == BROADCAST_CLIENT_ID && header.dst_client_id == BROADCAST_CLIENT_ID
}

/// Validate an out-of-band message and pick the status flag behaviour
///
/// Returns `None` when the message is not client management or its version
/// lies outside the supported range.
pub fn negotiate_version(header: &MessageHeader) -> Option<StatusFlagsMode> {
    if !is_out_of_band(header) || header.protocol != Protocol::CLIENT_MANAGEMENT {
        return None;
    }
    let supported = MIN_SUPPORTED_MESSAGE_VERSION as u64..=MESSAGE_VERSION as u64;
    if !supported.contains(&header.sequence) {
        return None;
    }
    Some(StatusFlagsMode::for_version(header.sequence as u32))
}

/// `ConnectRequest` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequestPayload {
    pub initial_flags: StatusFlags,
    /// Raw component byte; validated by the client manager
    pub component: u8,
}

impl ConnectRequestPayload {
    pub const SIZE: usize = 4;

    pub fn new(component: Component, initial_flags: StatusFlags) -> Self {
        Self {
            initial_flags,
            component: component as u8,
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..2].copy_from_slice(&self.initial_flags.bits().to_le_bytes());
        out[2] = self.component;
        out
    }

    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        expect_len(bytes, Self::SIZE)?;
        Ok(Self {
            initial_flags: StatusFlags(read_u16(bytes, 0)),
            component: bytes[2],
        })
    }

    /// Out-of-band `ConnectRequest` carrying this payload
    pub fn to_message(&self) -> MessageBuffer {
        let mut message = ManagementMessage::ConnectRequest.out_of_band();
        let _ = message.set_payload(&self.encode());
        message
    }
}

/// `ConnectResponse` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectResponsePayload {
    pub result: ResultCode,
    pub client_id: ClientId,
}

impl ConnectResponsePayload {
    pub const SIZE: usize = 8;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&(self.result as u32).to_le_bytes());
        out[4..6].copy_from_slice(&self.client_id.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        expect_len(bytes, Self::SIZE)?;
        Ok(Self {
            result: ResultCode::try_from(read_u32(bytes, 0))?,
            client_id: read_u16(bytes, 4),
        })
    }

    /// Out-of-band `ConnectResponse` carrying this payload
    pub fn to_message(&self) -> MessageBuffer {
        let mut message = ManagementMessage::ConnectResponse.out_of_band();
        let _ = message.set_payload(&self.encode());
        message
    }
}

/// `SetClientFlags` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetClientFlagsPayload {
    pub flags: StatusFlags,
}

impl SetClientFlagsPayload {
    pub const SIZE: usize = 4;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..2].copy_from_slice(&self.flags.bits().to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        expect_len(bytes, Self::SIZE)?;
        Ok(Self {
            flags: StatusFlags(read_u16(bytes, 0)),
        })
    }
}

/// `SetClientFlagsResponse` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetClientFlagsResponsePayload {
    pub result: ResultCode,
}

impl SetClientFlagsResponsePayload {
    pub const SIZE: usize = 4;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        (self.result as u32).to_le_bytes()
    }

    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        expect_len(bytes, Self::SIZE)?;
        Ok(Self {
            result: ResultCode::try_from(read_u32(bytes, 0))?,
        })
    }
}

/// `QueryStatusResponse` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryStatusResponsePayload {
    pub result: ResultCode,
    pub flags: StatusFlags,
}

impl QueryStatusResponsePayload {
    pub const SIZE: usize = 8;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&(self.result as u32).to_le_bytes());
        out[4..6].copy_from_slice(&self.flags.bits().to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        expect_len(bytes, Self::SIZE)?;
        Ok(Self {
            result: ResultCode::try_from(read_u32(bytes, 0))?,
            flags: StatusFlags(read_u16(bytes, 4)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_band_detection() {
        let message = ManagementMessage::ConnectRequest.out_of_band();
        assert!(is_out_of_band(&message.header));
        assert_eq!(message.header.sequence, MESSAGE_VERSION as u64);

        let addressed = ManagementMessage::KeepAlive.message(4, BROADCAST_CLIENT_ID);
        assert!(!is_out_of_band(&addressed.header));
    }

    #[test]
    fn test_negotiate_version_range() {
        let mut message = ManagementMessage::ConnectRequest.out_of_band();
        assert_eq!(
            negotiate_version(&message.header),
            Some(StatusFlagsMode::Distributed)
        );

        message.header.sequence = MIN_SUPPORTED_MESSAGE_VERSION as u64;
        assert_eq!(
            negotiate_version(&message.header),
            Some(StatusFlagsMode::Centralized)
        );

        message.header.sequence = MIN_SUPPORTED_MESSAGE_VERSION as u64 - 1;
        assert_eq!(negotiate_version(&message.header), None);

        message.header.sequence = MESSAGE_VERSION as u64 + 1;
        assert_eq!(negotiate_version(&message.header), None);
    }

    #[test]
    fn test_negotiate_requires_client_management() {
        let mut message = ManagementMessage::ConnectRequest.out_of_band();
        message.header.protocol = Protocol::SYSTEM;
        assert_eq!(negotiate_version(&message.header), None);
    }

    #[test]
    fn test_connect_request_payload() {
        let request = ConnectRequestPayload::new(Component::Tool, StatusFlags::HALT_ON_CONNECT);
        let message = request.to_message();
        assert_eq!(message.header.payload_size as usize, ConnectRequestPayload::SIZE);
        assert_eq!(
            ConnectRequestPayload::decode(message.payload()).unwrap(),
            request
        );
        assert!(ConnectRequestPayload::decode(&[0u8; 3]).is_err());
    }

    #[test]
    fn test_connect_response_rejects_unknown_result() {
        let mut bytes = ConnectResponsePayload {
            result: ResultCode::Success,
            client_id: 7,
        }
        .encode();
        bytes[0] = 200;
        assert!(ConnectResponsePayload::decode(&bytes).is_err());
    }

    #[test]
    fn test_query_status_layout() {
        let bytes = QueryStatusResponsePayload {
            result: ResultCode::Success,
            flags: StatusFlags::DEVELOPER_MODE_ENABLED,
        }
        .encode();
        assert_eq!(bytes, [0, 0, 0, 0, 1, 0, 0, 0]);
    }
}
