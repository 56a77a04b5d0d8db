// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Listener composition and lifecycle
//!
//! [`ListenerCore`] wires a client manager, the router, the configured
//! transports and (optionally) an in-process message channel with a logging
//! server into one running listener, and tears them down in reverse order.

use devbus_config::DevbusConfig;
use devbus_protocol::ClientId;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::channel::{MessageChannel, DEFAULT_CONNECT_TIMEOUT, DEFAULT_DISCONNECT_TIMEOUT};
use crate::client_manager::ListenerClientManager;
use crate::error::ListenerError;
use crate::logging::{LogSink, LoggingServer};
use crate::router::{ClientInfo, RouterCore, RouterSettings};
use crate::transports::{HostTransport, ListenerTransport, SocketTransport};

/// UDP port of the local transport where Unix-domain sockets are missing
#[cfg(not(unix))]
pub const FALLBACK_LOCAL_PORT: u16 = 27300;

/// Lifecycle state of a [`ListenerCore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenerState {
    #[default]
    Uninitialized,
    Initializing,
    Started,
    Destroying,
}

/// Everything needed to bring a listener up
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerCreateInfo {
    pub description: String,
    /// Register the in-process host transport
    pub host_client: bool,
    /// Connect a message channel with a logging server (needs `host_client`)
    pub logging_server: bool,
    pub local_enabled: bool,
    pub local_path: PathBuf,
    pub remote_addresses: Vec<SocketAddr>,
    pub router: RouterSettings,
    pub max_clients: usize,
}

impl Default for ListenerCreateInfo {
    fn default() -> Self {
        Self::from(&DevbusConfig::default())
    }
}

impl From<&DevbusConfig> for ListenerCreateInfo {
    fn from(config: &DevbusConfig) -> Self {
        let remote_addresses = config
            .transports
            .remote_addresses
            .iter()
            .filter_map(|address| match address.parse() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    warn!("[LISTENER] Ignoring remote address '{}': {}", address, e);
                    None
                }
            })
            .collect();

        Self {
            description: config.listener.description.clone(),
            host_client: config.listener.host_client,
            logging_server: config.listener.logging_server,
            local_enabled: config.transports.local_enabled,
            local_path: PathBuf::from(&config.transports.local_path),
            remote_addresses,
            router: RouterSettings::from(&config.router),
            max_clients: config.router.max_clients,
        }
    }
}

/// Resources owned by a started listener
struct Running {
    router: Arc<RouterCore>,
    channel: Option<MessageChannel>,
    logging: Option<Arc<LoggingServer>>,
}

impl Running {
    fn shutdown(self) {
        if let Some(channel) = self.channel {
            if let Err(e) = channel.disconnect(DEFAULT_DISCONNECT_TIMEOUT) {
                warn!("[LISTENER] Message channel did not disconnect cleanly: {}", e);
            }
        }
        drop(self.logging);
        self.router.stop();
    }
}

/// A running (or idle) listener
pub struct ListenerCore {
    state: RwLock<ListenerState>,
    running: Mutex<Option<Running>>,
}

impl ListenerCore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ListenerState::Uninitialized),
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ListenerState {
        *self.state.read()
    }

    /// Bring up the client manager, router, transports and message channel
    ///
    /// Transports that cannot be enabled are logged and skipped. Any other
    /// failure undoes everything done so far and leaves the listener
    /// `Uninitialized`.
    pub fn initialize(&self, info: &ListenerCreateInfo) -> Result<(), ListenerError> {
        let mut running = self.running.lock();
        {
            let mut state = self.state.write();
            if *state != ListenerState::Uninitialized {
                return Err(ListenerError::AlreadyInitialized);
            }
            *state = ListenerState::Initializing;
        }
        info!("[LISTENER] Initializing '{}'", info.description);

        let router = RouterCore::new(info.router);
        match Self::bring_up(&router, info) {
            Ok((channel, logging)) => {
                *running = Some(Running {
                    router,
                    channel,
                    logging,
                });
                *self.state.write() = ListenerState::Started;
                info!("[LISTENER] Started");
                Ok(())
            }
            Err(e) => {
                warn!("[LISTENER] Initialization failed: {}", e);
                router.stop();
                *self.state.write() = ListenerState::Uninitialized;
                Err(e)
            }
        }
    }

    fn bring_up(
        router: &Arc<RouterCore>,
        info: &ListenerCreateInfo,
    ) -> Result<(Option<MessageChannel>, Option<Arc<LoggingServer>>), ListenerError> {
        let mut manager = ListenerClientManager::new(info.max_clients.max(1));
        if info.host_client {
            manager = manager.with_host_transport(HostTransport::new());
        }
        let host_endpoint = manager.host_endpoint();
        let manager = Arc::new(manager);
        router.set_client_manager(manager)?;

        if info.local_enabled {
            register_or_skip(router, local_transport(info));
        }
        for address in &info.remote_addresses {
            register_or_skip(router, Arc::new(SocketTransport::udp(*address)));
        }

        router.start(&info.description)?;

        if !info.logging_server {
            return Ok((None, None));
        }
        let endpoint = host_endpoint.ok_or(ListenerError::LoggingWithoutHost)?;
        let channel = MessageChannel::new(endpoint, &info.description);
        let logging = Arc::new(LoggingServer::new(channel.sender()));
        channel.register_server(logging.clone());
        channel.connect(DEFAULT_CONNECT_TIMEOUT)?;
        Ok((Some(channel), Some(logging)))
    }

    /// Stop everything started by [`initialize`](Self::initialize)
    ///
    /// Idempotent.
    pub fn destroy(&self) {
        let mut running = self.running.lock();
        let Some(resources) = running.take() else {
            return;
        };
        *self.state.write() = ListenerState::Destroying;
        info!("[LISTENER] Destroying");
        resources.shutdown();
        *self.state.write() = ListenerState::Uninitialized;
        info!("[LISTENER] Destroyed");
    }

    /// Connected external clients, sorted by id
    pub fn connected_clients(&self) -> Vec<ClientInfo> {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.router.connected_clients())
            .unwrap_or_default()
    }

    /// Bus log sink, when the logging server is running
    pub fn log_sink(&self) -> Option<Arc<dyn LogSink>> {
        self.running
            .lock()
            .as_ref()
            .and_then(|r| r.logging.clone())
            .map(|logging| logging as Arc<dyn LogSink>)
    }

    pub fn router(&self) -> Option<Arc<RouterCore>> {
        self.running.lock().as_ref().map(|r| Arc::clone(&r.router))
    }

    pub fn host_client_id(&self) -> Option<ClientId> {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.router.host_client_id())
    }

    /// Client id of the in-process message channel
    pub fn channel_client_id(&self) -> Option<ClientId> {
        self.running
            .lock()
            .as_ref()
            .and_then(|r| r.channel.as_ref().map(|c| c.client_id()))
    }
}

impl Default for ListenerCore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ListenerCore {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn register_or_skip(router: &Arc<RouterCore>, transport: Arc<dyn ListenerTransport>) {
    let name = transport.transport_name().to_string();
    match router.register_transport(transport) {
        Ok(handle) => debug!("[LISTENER] Transport '{}' registered as {}", name, handle),
        Err(e) => warn!("[LISTENER] Skipping transport '{}': {}", name, e),
    }
}

#[cfg(unix)]
fn local_transport(info: &ListenerCreateInfo) -> Arc<dyn ListenerTransport> {
    Arc::new(crate::transports::PipeTransport::new(&info.local_path))
}

#[cfg(not(unix))]
fn local_transport(_info: &ListenerCreateInfo) -> Arc<dyn ListenerTransport> {
    Arc::new(SocketTransport::udp(SocketAddr::from((
        [127, 0, 0, 1],
        FALLBACK_LOCAL_PORT,
    ))))
}
