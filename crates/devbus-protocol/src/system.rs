// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! System protocol: presence, liveness and identification

use serde::{Deserialize, Serialize};

use crate::message::{MessageBuffer, MessageHeader};
use crate::types::{
    expect_len, read_fixed_str, read_u16, read_u32, write_fixed_str, ClientId,
    Component, Protocol, StatusFlags, MAX_STRING_LENGTH,
};
use crate::{CodecError, CodecResult};

/// System protocol message ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SystemMessage {
    Unknown = 0,
    ClientConnected = 1,
    ClientDisconnected = 2,
    Ping = 3,
    Pong = 4,
    QueryClientInfo = 5,
    ClientInfo = 6,
    Halted = 7,
}

impl SystemMessage {
    /// Build a payload-less system message
    pub fn message(self, src: ClientId, dst: ClientId) -> MessageBuffer {
        MessageBuffer::new(MessageHeader::new(src, dst, Protocol::SYSTEM, self as u8))
    }
}

impl TryFrom<u8> for SystemMessage {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        Ok(match value {
            0 => SystemMessage::Unknown,
            1 => SystemMessage::ClientConnected,
            2 => SystemMessage::ClientDisconnected,
            3 => SystemMessage::Ping,
            4 => SystemMessage::Pong,
            5 => SystemMessage::QueryClientInfo,
            6 => SystemMessage::ClientInfo,
            7 => SystemMessage::Halted,
            other => {
                return Err(CodecError::UnknownValue {
                    kind: "system message",
                    value: other as u32,
                })
            }
        })
    }
}

/// Packed client metadata (8 bytes on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClientMetadata {
    /// Bit set of protocols the client serves
    pub protocols: u32,
    pub component: Component,
    pub status: StatusFlags,
}

/// Identification payload answered to `QueryClientInfo`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClientInfoPayload {
    pub name: String,
    pub description: String,
    pub metadata: ClientMetadata,
    pub process_id: u32,
}

impl ClientInfoPayload {
    pub const SIZE: usize = 512;

    const NAME: usize = 0;
    const DESCRIPTION: usize = MAX_STRING_LENGTH;
    const METADATA: usize = MAX_STRING_LENGTH * 3;
    const PROCESS_ID: usize = Self::METADATA + 8;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        write_fixed_str(
            &mut out[Self::NAME..Self::NAME + MAX_STRING_LENGTH],
            &self.name,
        );
        write_fixed_str(
            &mut out[Self::DESCRIPTION..Self::DESCRIPTION + MAX_STRING_LENGTH],
            &self.description,
        );
        let meta = Self::METADATA;
        out[meta..meta + 4].copy_from_slice(&self.metadata.protocols.to_le_bytes());
        out[meta + 4] = self.metadata.component as u8;
        out[meta + 6..meta + 8].copy_from_slice(&self.metadata.status.bits().to_le_bytes());
        out[Self::PROCESS_ID..Self::PROCESS_ID + 4]
            .copy_from_slice(&self.process_id.to_le_bytes());
        out
    }

    /// Decode; an unrecognised component byte reads as `Component::Unknown`
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        expect_len(bytes, Self::SIZE)?;
        let meta = Self::METADATA;
        Ok(Self {
            name: read_fixed_str(&bytes[Self::NAME..Self::NAME + MAX_STRING_LENGTH]),
            description: read_fixed_str(
                &bytes[Self::DESCRIPTION..Self::DESCRIPTION + MAX_STRING_LENGTH],
            ),
            metadata: ClientMetadata {
                protocols: read_u32(bytes, meta),
                component: Component::try_from(bytes[meta + 4]).unwrap_or_default(),
                status: StatusFlags(read_u16(bytes, meta + 6)),
            },
            process_id: read_u32(bytes, Self::PROCESS_ID),
        })
    }

    /// Wrap this payload in a `ClientInfo` system message
    pub fn to_message(&self, src: ClientId, dst: ClientId) -> MessageBuffer {
        let mut message = SystemMessage::ClientInfo.message(src, dst);
        // 512 bytes always fits the payload capacity
        let _ = message.set_payload(&self.encode());
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_info_layout() {
        let info = ClientInfoPayload {
            name: "renderer".to_string(),
            description: "frame capture tool".to_string(),
            metadata: ClientMetadata {
                protocols: 0b101,
                component: Component::Tool,
                status: StatusFlags::DEVELOPER_MODE_ENABLED,
            },
            process_id: 4242,
        };
        let bytes = info.encode();
        assert_eq!(&bytes[0..8], b"renderer");
        assert_eq!(bytes[8], 0);
        assert_eq!(&bytes[128..146], b"frame capture tool");
        assert_eq!(bytes[384], 0b101);
        assert_eq!(bytes[388], Component::Tool as u8);
        assert_eq!(&bytes[392..396], &4242u32.to_le_bytes());
        assert_eq!(ClientInfoPayload::decode(&bytes).unwrap(), info);
        assert_eq!(&bytes[390..392], &1u16.to_le_bytes());
    }

    #[test]
    fn test_long_names_truncate() {
        let info = ClientInfoPayload {
            name: "x".repeat(300),
            ..Default::default()
        };
        let decoded = ClientInfoPayload::decode(&info.encode()).unwrap();
        assert_eq!(decoded.name.len(), MAX_STRING_LENGTH - 1);
    }

    #[test]
    fn test_client_info_message() {
        let message = ClientInfoPayload::default().to_message(3, 9);
        assert_eq!(message.header.protocol, Protocol::SYSTEM);
        assert_eq!(message.header.message_id, SystemMessage::ClientInfo as u8);
        assert_eq!(message.payload().len(), ClientInfoPayload::SIZE);
    }

    #[test]
    fn test_wrong_size_rejected() {
        assert!(ClientInfoPayload::decode(&[0u8; 100]).is_err());
        assert!(SystemMessage::try_from(42).is_err());
    }
}
