// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Error types for the listener crate

use devbus_protocol::{ClientId, CodecError, ResultCode};
use thiserror::Error;

/// Result type alias for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Transport-level failures
///
/// `NotReady` is transient and never changes router state. `Unavailable`
/// means a transport could not acquire its resource and the caller may try
/// another one. Every other variant is fatal for the connection involved.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not ready")]
    NotReady,

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("no route to client {0}")]
    NoRoute(ClientId),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("transport is not running")]
    NotRunning,

    #[error("transport is already running")]
    AlreadyRunning,

    #[error("invalid message: {0}")]
    InvalidMessage(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn is_not_ready(&self) -> bool {
        matches!(self, TransportError::NotReady)
    }

    /// True when the connection the operation targeted should be torn down
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            TransportError::NotReady | TransportError::Unavailable(_) | TransportError::NoRoute(_)
        )
    }

    /// Wire result code equivalent
    pub fn result_code(&self) -> ResultCode {
        match self {
            TransportError::NotReady => ResultCode::NotReady,
            TransportError::Unavailable(_) | TransportError::NoRoute(_) => ResultCode::Unavailable,
            _ => ResultCode::Error,
        }
    }
}

/// Client manager failures, reported to clients through `ConnectResponse`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientManagerError {
    #[error("client id space exhausted ({0} clients registered)")]
    Exhausted(usize),

    #[error("invalid component type {0}")]
    InvalidComponent(u8),

    #[error("unknown client {0}")]
    UnknownClient(ClientId),

    #[error("host already registered as client {0}")]
    HostAlreadyRegistered(ClientId),

    #[error("no host registered")]
    NoHost,
}

impl ClientManagerError {
    pub fn result_code(&self) -> ResultCode {
        match self {
            ClientManagerError::Exhausted(_) => ResultCode::InsufficientMemory,
            ClientManagerError::InvalidComponent(_) => ResultCode::Rejected,
            _ => ResultCode::Error,
        }
    }
}

/// Router lifecycle and registration failures
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no client manager registered")]
    NoClientManager,

    #[error("no transports registered")]
    NoTransports,

    #[error("router is already running")]
    AlreadyRunning,

    #[error("unknown transport handle {0}")]
    UnknownTransport(u32),

    #[error("client manager error: {0}")]
    ClientManager(#[from] ClientManagerError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("failed to spawn router thread: {0}")]
    Thread(std::io::Error),
}

/// Failures of the in-process message channel
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("connection rejected with {0}")]
    Rejected(ResultCode),

    #[error("channel is not connected")]
    NotConnected,

    #[error("channel is already connected")]
    AlreadyConnected,

    #[error("router endpoint closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(TransportError),

    #[error("invalid message: {0}")]
    InvalidMessage(#[from] CodecError),

    #[error("failed to spawn channel thread: {0}")]
    Thread(std::io::Error),
}

impl From<TransportError> for ChannelError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::ConnectionClosed => ChannelError::Closed,
            other => ChannelError::Transport(other),
        }
    }
}

/// Listener lifecycle failures
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("listener is already initialized")]
    AlreadyInitialized,

    #[error("router error: {0}")]
    Router(#[from] RouterError),

    #[error("message channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("logging server requires the host client")]
    LoggingWithoutHost,
}
