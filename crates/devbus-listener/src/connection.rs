// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Transport-specific peer addressing

use devbus_protocol::{MessageBuffer, TransportHandle, INVALID_TRANSPORT_HANDLE};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Capacity of the opaque address bytes
pub const CONNECTION_INFO_CAPACITY: usize = 128;

/// Opaque peer address plus the transport that owns it
///
/// The byte payload is whatever the owning transport needs to reach the
/// peer again (a connection id, an encoded socket address, a path).
#[derive(Clone, Copy)]
pub struct ConnectionInfo {
    handle: TransportHandle,
    size: usize,
    data: [u8; CONNECTION_INFO_CAPACITY],
}

impl ConnectionInfo {
    /// Returns `None` if `bytes` exceeds [`CONNECTION_INFO_CAPACITY`]
    pub fn new(handle: TransportHandle, bytes: &[u8]) -> Option<Self> {
        if bytes.len() > CONNECTION_INFO_CAPACITY {
            return None;
        }
        let mut data = [0u8; CONNECTION_INFO_CAPACITY];
        data[..bytes.len()].copy_from_slice(bytes);
        Some(Self {
            handle,
            size: bytes.len(),
            data,
        })
    }

    /// Address bytes for a numeric connection id
    pub fn from_id(handle: TransportHandle, id: u64) -> Self {
        let mut data = [0u8; CONNECTION_INFO_CAPACITY];
        data[..8].copy_from_slice(&id.to_le_bytes());
        Self {
            handle,
            size: 8,
            data,
        }
    }

    /// Inverse of [`ConnectionInfo::from_id`]
    pub fn id(&self) -> Option<u64> {
        if self.size != 8 {
            return None;
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.data[..8]);
        Some(u64::from_le_bytes(raw))
    }

    pub fn handle(&self) -> TransportHandle {
        self.handle
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.size]
    }

    pub fn is_valid(&self) -> bool {
        self.handle != INVALID_TRANSPORT_HANDLE
    }
}

impl PartialEq for ConnectionInfo {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle && self.as_bytes() == other.as_bytes()
    }
}

impl Eq for ConnectionInfo {}

impl Hash for ConnectionInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.handle.hash(state);
        self.as_bytes().hash(state);
    }
}

impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionInfo(transport={}, ", self.handle)?;
        for byte in self.as_bytes() {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

/// A received message with the connection it arrived on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContext {
    pub connection: ConnectionInfo,
    pub message: MessageBuffer,
}

impl MessageContext {
    pub fn new(connection: ConnectionInfo, message: MessageBuffer) -> Self {
        Self {
            connection,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_equality_ignores_unused_bytes() {
        let a = ConnectionInfo::new(1, b"peer").unwrap();
        let b = ConnectionInfo::new(1, b"peer").unwrap();
        let other_transport = ConnectionInfo::new(2, b"peer").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, other_transport);

        let set: HashSet<_> = [a, b, other_transport].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_capacity_enforced() {
        assert!(ConnectionInfo::new(1, &[0u8; CONNECTION_INFO_CAPACITY]).is_some());
        assert!(ConnectionInfo::new(1, &[0u8; CONNECTION_INFO_CAPACITY + 1]).is_none());
    }

    #[test]
    fn test_id_round_trip() {
        let info = ConnectionInfo::from_id(3, 0xdead_beef);
        assert_eq!(info.id(), Some(0xdead_beef));
        assert_eq!(info.handle(), 3);
        assert!(info.is_valid());
        assert_eq!(ConnectionInfo::new(3, b"abc").unwrap().id(), None);
    }
}
