// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # devbus-listener
//!
//! Message router for developer tools and the processes they inspect:
//! - Transports: local pipe, UDP / Unix datagram sockets, in-process host loopback
//! - Client identity management ([`ClientManager`])
//! - The router itself with liveness sweeps and per-connection routing caches
//! - An in-process message channel with a bus logging server
//! - [`ListenerCore`], which composes all of the above
//!
//! ## Usage
//!
//! ```rust,no_run
//! use devbus_listener::{ListenerCore, ListenerCreateInfo};
//!
//! let listener = ListenerCore::new();
//! listener
//!     .initialize(&ListenerCreateInfo::default())
//!     .expect("listener failed to start");
//! for client in listener.connected_clients() {
//!     println!("{} {}", client.client_id, client.name);
//! }
//! ```

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod channel;
pub mod client_manager;
pub mod connection;
pub mod error;
pub mod listener_core;
pub mod logging;
pub mod router;
pub mod transports;

pub use channel::{ChannelSender, MessageChannel, ProtocolServer};
pub use client_manager::{ClientManager, ListenerClientManager};
pub use connection::{ConnectionInfo, MessageContext};
pub use error::{
    ChannelError, ClientManagerError, ListenerError, RouterError, TransportError,
    TransportResult,
};
pub use listener_core::{ListenerCore, ListenerCreateInfo, ListenerState};
pub use logging::{LogSink, LoggingServer};
pub use router::{ClientInfo, RouterCore, RouterSettings, RoutingCache};
#[cfg(unix)]
pub use transports::PipeTransport;
pub use transports::{HostEndpoint, HostTransport, ListenerTransport, SocketEndpoint, SocketTransport};
