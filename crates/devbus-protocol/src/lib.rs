// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # devbus-protocol
//!
//! Wire model shared by every devbus participant:
//! - Identifiers, protocol ids and result codes ([`types`])
//! - The fixed-layout message envelope and its codec ([`message`])
//! - System, client-management and logging message ids with payload codecs
//! - Out-of-band detection and version negotiation ([`management`])
//!
//! All multi-byte fields are little-endian.

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod error;
pub mod logging;
pub mod management;
pub mod message;
pub mod system;
pub mod types;

pub use error::{CodecError, CodecResult};
pub use logging::{LogLevel, LogMessagePayload, LoggingMessage};
pub use management::{
    is_out_of_band, negotiate_version, out_of_band_message, ConnectRequestPayload,
    ConnectResponsePayload, ManagementMessage, QueryStatusResponsePayload,
    SetClientFlagsPayload, SetClientFlagsResponsePayload, StatusFlagsMode,
};
pub use message::{MessageBuffer, MessageHeader, HEADER_SIZE, MAX_MESSAGE_SIZE, MAX_PAYLOAD_SIZE};
pub use system::{ClientInfoPayload, ClientMetadata, SystemMessage};
pub use types::*;
