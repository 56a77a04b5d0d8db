// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Identifier types, protocol ids and result codes

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::CodecError;

/// Routable identifier of a connected process
pub type ClientId = u16;

/// Correlation id carried verbatim by keep-alive echoes
pub type SessionId = u32;

/// Sender-assigned sequence number (carries the version for out-of-band traffic)
pub type Sequence = u64;

/// Protocol-specific opcode
pub type MessageCode = u8;

/// Flow-control window advertised by the sender
pub type WindowSize = u16;

/// Identifies one registered transport instance inside a router
pub type TransportHandle = u32;

/// Sentinel client id meaning "broadcast / no client"
pub const BROADCAST_CLIENT_ID: ClientId = 0;

/// Mask covering the routable part of a client id (upper bits are router prefix)
pub const CLIENT_ID_MASK: ClientId = (1 << 13) - 1;

/// Session id used when a message is not part of any session
pub const INVALID_SESSION_ID: SessionId = 0;

/// Transport handle that never names a registered transport
pub const INVALID_TRANSPORT_HANDLE: TransportHandle = 0;

/// Current message version stamped into out-of-band traffic
pub const MESSAGE_VERSION: u32 = 1011;

/// Oldest message version the router still negotiates with
pub const MIN_SUPPORTED_MESSAGE_VERSION: u32 = 1010;

/// First version in which status flags are owned by each client
pub const DISTRIBUTED_STATUS_FLAGS_VERSION: u32 = 1011;

/// Default UDP port for remote connections
pub const DEFAULT_NETWORK_PORT: u16 = 27300;

/// Maximum length (including terminator) of fixed string fields
pub const MAX_STRING_LENGTH: usize = 128;

/// Protocol id of a message
///
/// Wraps the raw byte so that protocols this crate knows nothing about are
/// still carried and routed untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Protocol(pub u8);

impl Protocol {
    pub const DRIVER_CONTROL: Protocol = Protocol(0);
    pub const LOGGING: Protocol = Protocol(1);
    pub const SETTINGS: Protocol = Protocol(2);
    pub const RGP: Protocol = Protocol(3);
    pub const ETW: Protocol = Protocol(4);
    pub const GPU_CRASH_DUMP: Protocol = Protocol(5);
    /// Highest id available to user protocols
    pub const MAX_USER: Protocol = Protocol(223);
    pub const TRANSFER: Protocol = Protocol(251);
    pub const URI: Protocol = Protocol(252);
    pub const SESSION: Protocol = Protocol(253);
    pub const CLIENT_MANAGEMENT: Protocol = Protocol(254);
    pub const SYSTEM: Protocol = Protocol(255);

    /// Human-readable protocol name, if known
    pub fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::DRIVER_CONTROL => "DriverControl",
            Self::LOGGING => "Logging",
            Self::SETTINGS => "Settings",
            Self::RGP => "RGP",
            Self::ETW => "ETW",
            Self::GPU_CRASH_DUMP => "GpuCrashDump",
            Self::TRANSFER => "Transfer",
            Self::URI => "URI",
            Self::SESSION => "Session",
            Self::CLIENT_MANAGEMENT => "ClientManagement",
            Self::SYSTEM => "System",
            _ => return None,
        })
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "Protocol({})", self.0),
        }
    }
}

/// Result code carried in response payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ResultCode {
    Success = 0,
    Error = 1,
    NotReady = 2,
    VersionMismatch = 3,
    Unavailable = 4,
    Rejected = 5,
    EndOfStream = 6,
    Aborted = 7,
    InsufficientMemory = 8,
}

impl ResultCode {
    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }
}

impl TryFrom<u32> for ResultCode {
    type Error = CodecError;

    fn try_from(value: u32) -> Result<Self, CodecError> {
        Ok(match value {
            0 => ResultCode::Success,
            1 => ResultCode::Error,
            2 => ResultCode::NotReady,
            3 => ResultCode::VersionMismatch,
            4 => ResultCode::Unavailable,
            5 => ResultCode::Rejected,
            6 => ResultCode::EndOfStream,
            7 => ResultCode::Aborted,
            8 => ResultCode::InsufficientMemory,
            other => {
                return Err(CodecError::UnknownValue {
                    kind: "result code",
                    value: other,
                })
            }
        })
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Kind of process on the other end of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum Component {
    #[default]
    Unknown = 0,
    Server = 1,
    Tool = 2,
    Driver = 3,
}

impl TryFrom<u8> for Component {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            0 => Ok(Component::Unknown),
            1 => Ok(Component::Server),
            2 => Ok(Component::Tool),
            3 => Ok(Component::Driver),
            other => Err(CodecError::UnknownValue {
                kind: "component",
                value: other as u32,
            }),
        }
    }
}

/// Client status bit set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StatusFlags(pub u16);

impl StatusFlags {
    pub const NONE: StatusFlags = StatusFlags(0);
    pub const DEVELOPER_MODE_ENABLED: StatusFlags = StatusFlags(1 << 0);
    pub const HALT_ON_CONNECT: StatusFlags = StatusFlags(1 << 1);
    pub const GPU_CRASH_DUMPS_ENABLED: StatusFlags = StatusFlags(1 << 2);
    pub const PIPELINE_DUMPS_ENABLED: StatusFlags = StatusFlags(1 << 3);

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn contains(self, other: StatusFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for StatusFlags {
    type Output = StatusFlags;

    fn bitor(self, rhs: StatusFlags) -> StatusFlags {
        StatusFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for StatusFlags {
    fn bitor_assign(&mut self, rhs: StatusFlags) {
        self.0 |= rhs.0;
    }
}

/// Read a little-endian u16 at `offset`; caller guarantees bounds
pub(crate) fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

pub(crate) fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

/// Check that `bytes` holds exactly `expected` bytes
pub(crate) fn expect_len(bytes: &[u8], expected: usize) -> Result<(), CodecError> {
    if bytes.len() != expected {
        return Err(CodecError::PayloadSizeMismatch {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

/// Write `value` as a NUL-terminated string into `field`, truncating on a char boundary
pub(crate) fn write_fixed_str(field: &mut [u8], value: &str) {
    let limit = field.len().saturating_sub(1);
    let mut end = value.len().min(limit);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    field[..end].copy_from_slice(&value.as_bytes()[..end]);
    field[end..].fill(0);
}

/// Read a NUL-terminated string out of a fixed field
pub(crate) fn read_fixed_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}
