//! Per-client and per-transport bookkeeping

use devbus_protocol::{ClientId, StatusFlagsMode, TransportHandle};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::connection::ConnectionInfo;
use crate::transports::ListenerTransport;

/// Router-side state of one client
#[derive(Debug, Clone)]
pub struct ClientContext {
    pub name: String,
    pub description: String,
    pub process_id: u32,
    /// Answered a `QueryClientInfo` round-trip
    pub identified: bool,
    pub connection: ConnectionInfo,
    /// Consecutive sweeps without a pong
    pub ping_retry_count: u32,
    pub received_pong: bool,
    /// Went through ConnectRequest; unregistered from the client manager on removal
    pub registered: bool,
    pub status_mode: StatusFlagsMode,
}

impl ClientContext {
    pub(crate) fn new(connection: ConnectionInfo, registered: bool, status_mode: StatusFlagsMode) -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            process_id: 0,
            identified: false,
            connection,
            ping_retry_count: 0,
            received_pong: true,
            registered,
            status_mode,
        }
    }

    pub(crate) fn info(&self, client_id: ClientId) -> ClientInfo {
        ClientInfo {
            client_id,
            name: self.name.clone(),
            description: self.description.clone(),
            process_id: self.process_id,
            identified: self.identified,
            registered: self.registered,
            transport: self.connection.handle(),
        }
    }
}

/// Snapshot of a connected client for collaborators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub name: String,
    pub description: String,
    pub process_id: u32,
    pub identified: bool,
    pub registered: bool,
    pub transport: TransportHandle,
}

/// A registered transport and the peers seen on it
pub(crate) struct TransportContext {
    pub transport: Arc<dyn ListenerTransport>,
    pub clients: HashMap<ClientId, ConnectionInfo>,
}

impl TransportContext {
    pub fn new(transport: Arc<dyn ListenerTransport>) -> Self {
        Self {
            transport,
            clients: HashMap::new(),
        }
    }
}
