// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-process bus client
//!
//! A [`MessageChannel`] talks to the router through the host transport's
//! [`HostEndpoint`]. After connecting it runs a service thread that keeps
//! the client alive (Ping/Pong, client info queries) and dispatches every
//! other protocol to the registered [`ProtocolServer`]s.

use devbus_protocol::{
    ClientId, ClientInfoPayload, ClientMetadata, Component, ConnectRequestPayload,
    ConnectResponsePayload, ManagementMessage, MessageBuffer, Protocol, StatusFlags,
    SystemMessage, BROADCAST_CLIENT_ID,
};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{ChannelError, TransportError};
use crate::transports::HostEndpoint;

/// Default wait for the router's ConnectResponse
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Default wait for the router's DisconnectResponse
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_millis(500);

const SERVICE_POLL: Duration = Duration::from_millis(10);

/// Handler for one protocol arriving on a [`MessageChannel`]
pub trait ProtocolServer: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Called on the channel's service thread
    fn handle_message(&self, message: &MessageBuffer, sender: &ChannelSender);
}

struct ChannelShared {
    endpoint: HostEndpoint,
    client_id: AtomicU16,
    connected: AtomicBool,
    info: ClientInfoPayload,
    servers: RwLock<HashMap<Protocol, Arc<dyn ProtocolServer>>>,
    disconnect_ack: Mutex<bool>,
    disconnect_signal: Condvar,
}

impl ChannelShared {
    fn send(&self, message: MessageBuffer) -> Result<(), ChannelError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(ChannelError::NotConnected);
        }
        self.endpoint.send(message).map_err(ChannelError::from)
    }

    fn client_id(&self) -> ClientId {
        self.client_id.load(Ordering::Acquire)
    }

    fn dispatch(&self, message: MessageBuffer, sender: &ChannelSender) {
        let header = &message.header;
        let me = self.client_id();
        let addressed = header.dst_client_id == me || header.dst_client_id == BROADCAST_CLIENT_ID;

        if header.protocol == Protocol::SYSTEM {
            match SystemMessage::try_from(header.message_id) {
                Ok(SystemMessage::Ping) if addressed => {
                    self.reply(SystemMessage::Pong.message(me, header.src_client_id));
                }
                Ok(SystemMessage::QueryClientInfo) if addressed => {
                    self.reply(self.info.to_message(me, header.src_client_id));
                }
                _ => {}
            }
            return;
        }

        if header.protocol == Protocol::CLIENT_MANAGEMENT {
            if header.message_id == ManagementMessage::DisconnectResponse as u8 {
                *self.disconnect_ack.lock() = true;
                self.disconnect_signal.notify_all();
            }
            return;
        }

        if !addressed {
            return;
        }
        let server = self.servers.read().get(&header.protocol).cloned();
        match server {
            Some(server) => server.handle_message(&message, sender),
            None => debug!(
                "[CHANNEL] No server for protocol {} (message {} from {})",
                header.protocol, header.message_id, header.src_client_id
            ),
        }
    }

    fn reply(&self, message: MessageBuffer) {
        if let Err(e) = self.endpoint.send(message) {
            debug!("[CHANNEL] Reply dropped: {}", e);
        }
    }
}

/// Cloneable send handle given to protocol servers
#[derive(Clone)]
pub struct ChannelSender {
    shared: Arc<ChannelShared>,
}

impl ChannelSender {
    pub fn send(&self, message: MessageBuffer) -> Result<(), ChannelError> {
        self.shared.send(message)
    }

    pub fn client_id(&self) -> ClientId {
        self.shared.client_id()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }
}

/// In-process client of the router
pub struct MessageChannel {
    shared: Arc<ChannelShared>,
    service: Mutex<Option<JoinHandle<()>>>,
}

impl MessageChannel {
    /// # Arguments
    /// * `endpoint` - In-process end of the host transport
    /// * `description` - Reported to peers that query this client
    pub fn new(endpoint: HostEndpoint, description: &str) -> Self {
        let info = ClientInfoPayload {
            name: "devbus-channel".to_string(),
            description: description.to_string(),
            metadata: ClientMetadata {
                protocols: 0,
                component: Component::Server,
                status: StatusFlags::NONE,
            },
            process_id: std::process::id(),
        };
        Self {
            shared: Arc::new(ChannelShared {
                endpoint,
                client_id: AtomicU16::new(BROADCAST_CLIENT_ID),
                connected: AtomicBool::new(false),
                info,
                servers: RwLock::new(HashMap::new()),
                disconnect_ack: Mutex::new(false),
                disconnect_signal: Condvar::new(),
            }),
            service: Mutex::new(None),
        }
    }

    /// Route messages of `server.protocol()` to `server`
    pub fn register_server(&self, server: Arc<dyn ProtocolServer>) {
        let protocol = server.protocol();
        if self
            .shared
            .servers
            .write()
            .insert(protocol, server)
            .is_some()
        {
            warn!("[CHANNEL] Replaced server for protocol {}", protocol);
        }
    }

    pub fn sender(&self) -> ChannelSender {
        ChannelSender {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.shared.client_id()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Register with the router and start the service thread
    pub fn connect(&self, timeout: Duration) -> Result<ClientId, ChannelError> {
        let mut service = self.service.lock();
        if service.is_some() || self.is_connected() {
            return Err(ChannelError::AlreadyConnected);
        }

        let deadline = Instant::now() + timeout;
        let request = ConnectRequestPayload::new(Component::Server, StatusFlags::NONE).to_message();
        loop {
            match self.shared.endpoint.send(request.clone()) {
                Ok(()) => break,
                Err(TransportError::NotReady) if Instant::now() < deadline => thread::yield_now(),
                Err(TransportError::NotReady) => return Err(ChannelError::Timeout("router queue")),
                Err(e) => return Err(e.into()),
            }
        }

        let client_id = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ChannelError::Timeout("ConnectResponse"));
            }
            let message = match self.shared.endpoint.recv_timeout(remaining) {
                Ok(message) => message,
                Err(TransportError::NotReady) => continue,
                Err(e) => return Err(e.into()),
            };
            if message.header.protocol != Protocol::CLIENT_MANAGEMENT
                || message.header.message_id != ManagementMessage::ConnectResponse as u8
            {
                continue;
            }
            let response = ConnectResponsePayload::decode(message.payload())?;
            if !response.result.is_success() {
                return Err(ChannelError::Rejected(response.result));
            }
            break response.client_id;
        };

        self.shared.client_id.store(client_id, Ordering::Release);
        *self.shared.disconnect_ack.lock() = false;
        self.shared.connected.store(true, Ordering::Release);

        let sender = self.sender();
        let spawned = thread::Builder::new()
            .name("devbus-channel".to_string())
            .spawn(move || run_service(sender));
        match spawned {
            Ok(handle) => *service = Some(handle),
            Err(e) => {
                self.shared.connected.store(false, Ordering::Release);
                return Err(ChannelError::Thread(e));
            }
        }

        info!("[CHANNEL] Connected as client {}", client_id);
        Ok(client_id)
    }

    pub fn send(&self, message: MessageBuffer) -> Result<(), ChannelError> {
        self.shared.send(message)
    }

    /// Leave the bus, waiting up to `timeout` for the router to confirm
    ///
    /// Does nothing when not connected.
    pub fn disconnect(&self, timeout: Duration) -> Result<(), ChannelError> {
        let Some(service) = self.service.lock().take() else {
            return Ok(());
        };

        let client_id = self.client_id();
        let notification =
            ManagementMessage::DisconnectNotification.message(client_id, BROADCAST_CLIENT_ID);
        let acknowledged = match self.shared.send(notification) {
            Ok(()) => {
                let mut ack = self.shared.disconnect_ack.lock();
                if !*ack {
                    self.shared.disconnect_signal.wait_for(&mut ack, timeout);
                }
                *ack
            }
            Err(e) => {
                debug!("[CHANNEL] Disconnect notification not sent: {}", e);
                false
            }
        };

        self.shared.connected.store(false, Ordering::Release);
        if service.join().is_err() {
            warn!("[CHANNEL] Service thread panicked");
        }
        self.shared
            .client_id
            .store(BROADCAST_CLIENT_ID, Ordering::Release);

        if acknowledged {
            info!("[CHANNEL] Client {} disconnected", client_id);
            Ok(())
        } else {
            Err(ChannelError::Timeout("DisconnectResponse"))
        }
    }
}

impl Drop for MessageChannel {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect(DEFAULT_DISCONNECT_TIMEOUT) {
            debug!("[CHANNEL] Disconnect on drop: {}", e);
        }
    }
}

fn run_service(sender: ChannelSender) {
    let shared = Arc::clone(&sender.shared);
    while shared.connected.load(Ordering::Acquire) {
        match shared.endpoint.recv_timeout(SERVICE_POLL) {
            Ok(message) => shared.dispatch(message, &sender),
            Err(TransportError::NotReady) => {}
            Err(e) => {
                warn!("[CHANNEL] Router endpoint lost: {}", e);
                shared.connected.store(false, Ordering::Release);
                break;
            }
        }
    }
    debug!("[CHANNEL] Service thread exiting");
}
