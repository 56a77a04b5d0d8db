// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Transport trait and backends
//!
//! A transport owns an OS resource (socket, pipe listener, in-process queue)
//! from `enable` to `disable` and feeds everything it receives into the
//! router through a [`ReceiveLoop`](crate::router::ReceiveLoop). Outbound
//! traffic is sent inline on the caller's thread.

use devbus_protocol::{MessageBuffer, TransportHandle};
use std::sync::Arc;

use crate::connection::ConnectionInfo;
use crate::error::TransportResult;
use crate::router::RouterCore;

pub mod host;
#[cfg(unix)]
pub mod pipe;
pub mod socket;

pub use host::{HostEndpoint, HostTransport};
#[cfg(unix)]
pub use pipe::PipeTransport;
pub use socket::{SocketEndpoint, SocketTransport};

/// Base trait implemented by every listener transport
pub trait ListenerTransport: Send + Sync {
    /// Acquire the resource and start receiving into `router`
    ///
    /// Returns `TransportError::Unavailable` when the resource is taken or
    /// not permitted, so the caller can fall back to another endpoint.
    fn enable(&self, router: &Arc<RouterCore>, handle: TransportHandle) -> TransportResult<()>;

    /// Stop receive threads and release the resource
    ///
    /// Safe to call repeatedly and from `Drop`.
    fn disable(&self) -> TransportResult<()>;

    fn is_enabled(&self) -> bool;

    /// Send to one previously seen peer
    fn transmit_message(
        &self,
        connection: &ConnectionInfo,
        message: &MessageBuffer,
    ) -> TransportResult<()>;

    /// Send to the sub-network behind a forwarding transport
    fn transmit_broadcast_message(&self, message: &MessageBuffer) -> TransportResult<()>;

    /// True when broadcasts go out once, verbatim, instead of per tracked peer
    fn forwarding_connection(&self) -> bool {
        false
    }

    fn transport_name(&self) -> &str;
}
