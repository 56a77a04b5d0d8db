// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Client identity management
//!
//! The router never allocates ids itself; it asks a [`ClientManager`]. The
//! default [`ListenerClientManager`] hands out ids from a rotating counter
//! so that a freed id is only reused after the counter wraps around.

use devbus_protocol::{ClientId, Component, StatusFlags, CLIENT_ID_MASK};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::ClientManagerError;
use crate::transports::{HostEndpoint, HostTransport, ListenerTransport};

/// Default limit on concurrently registered clients
pub const DEFAULT_MAX_CLIENTS: usize = 1024;

/// Identity provider used by the router
pub trait ClientManager: Send + Sync {
    /// Claim the single host identity of this process
    fn register_host(&self) -> Result<ClientId, ClientManagerError>;

    fn unregister_host(&self) -> Result<(), ClientManagerError>;

    /// Allocate an id for an external client
    ///
    /// Fails when the id space is exhausted or the component is invalid.
    fn register_client(
        &self,
        component: Component,
        initial_flags: StatusFlags,
    ) -> Result<ClientId, ClientManagerError>;

    fn unregister_client(&self, client_id: ClientId) -> Result<(), ClientManagerError>;

    /// Store status flags of a client (centralized status mode)
    fn update_client_status(
        &self,
        client_id: ClientId,
        flags: StatusFlags,
    ) -> Result<(), ClientManagerError>;

    /// Status flags reported to centralized-mode `QueryStatus`
    fn query_status(&self) -> StatusFlags;

    /// Loopback transport for in-process clients, if configured
    fn host_transport(&self) -> Option<Arc<dyn ListenerTransport>>;

    fn name(&self) -> &str;
}

#[derive(Debug, Clone, Copy)]
struct RegisteredClient {
    component: Component,
    flags: StatusFlags,
}

#[derive(Debug)]
struct ManagerState {
    host: Option<ClientId>,
    clients: HashMap<ClientId, RegisteredClient>,
    next_id: ClientId,
    host_status: StatusFlags,
}

impl ManagerState {
    fn in_use(&self, id: ClientId) -> bool {
        self.host == Some(id) || self.clients.contains_key(&id)
    }

    /// Next free id at or after the counter, wrapping within `1..=CLIENT_ID_MASK`
    fn allocate(&mut self) -> Option<ClientId> {
        for _ in 0..CLIENT_ID_MASK {
            let candidate = self.next_id;
            self.next_id = if candidate >= CLIENT_ID_MASK {
                1
            } else {
                candidate + 1
            };
            if !self.in_use(candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

/// Default client manager used by the listener
pub struct ListenerClientManager {
    state: Mutex<ManagerState>,
    max_clients: usize,
    host_transport: Option<Arc<HostTransport>>,
}

impl ListenerClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            state: Mutex::new(ManagerState {
                host: None,
                clients: HashMap::new(),
                next_id: 1,
                host_status: StatusFlags::DEVELOPER_MODE_ENABLED,
            }),
            max_clients,
            host_transport: None,
        }
    }

    /// Attach an in-process loopback transport
    pub fn with_host_transport(mut self, transport: HostTransport) -> Self {
        self.host_transport = Some(Arc::new(transport));
        self
    }

    /// Take the in-process end of the host transport (first call only)
    pub fn host_endpoint(&self) -> Option<HostEndpoint> {
        self.host_transport.as_ref().and_then(|t| t.endpoint())
    }

    /// Replace the status reported to centralized-mode queries
    pub fn set_host_status(&self, flags: StatusFlags) {
        self.state.lock().host_status = flags;
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().clients.len()
    }

    /// Component a client registered with
    pub fn client_component(&self, client_id: ClientId) -> Option<Component> {
        self.state.lock().clients.get(&client_id).map(|c| c.component)
    }

    pub fn client_status(&self, client_id: ClientId) -> Option<StatusFlags> {
        self.state.lock().clients.get(&client_id).map(|c| c.flags)
    }
}

impl Default for ListenerClientManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CLIENTS)
    }
}

impl ClientManager for ListenerClientManager {
    fn register_host(&self) -> Result<ClientId, ClientManagerError> {
        let mut state = self.state.lock();
        if let Some(host) = state.host {
            return Err(ClientManagerError::HostAlreadyRegistered(host));
        }
        let id = state
            .allocate()
            .ok_or(ClientManagerError::Exhausted(state.clients.len()))?;
        state.host = Some(id);
        info!("[CLIENT-MANAGER] Host registered as client {}", id);
        Ok(id)
    }

    fn unregister_host(&self) -> Result<(), ClientManagerError> {
        let mut state = self.state.lock();
        match state.host.take() {
            Some(id) => {
                info!("[CLIENT-MANAGER] Host client {} unregistered", id);
                Ok(())
            }
            None => Err(ClientManagerError::NoHost),
        }
    }

    fn register_client(
        &self,
        component: Component,
        initial_flags: StatusFlags,
    ) -> Result<ClientId, ClientManagerError> {
        if component == Component::Unknown {
            return Err(ClientManagerError::InvalidComponent(component as u8));
        }

        let mut state = self.state.lock();
        if state.clients.len() >= self.max_clients {
            warn!(
                "[CLIENT-MANAGER] Rejecting {:?}: limit of {} clients reached",
                component, self.max_clients
            );
            return Err(ClientManagerError::Exhausted(state.clients.len()));
        }

        let id = state
            .allocate()
            .ok_or(ClientManagerError::Exhausted(state.clients.len()))?;
        state.clients.insert(
            id,
            RegisteredClient {
                component,
                flags: initial_flags,
            },
        );
        debug!(
            "[CLIENT-MANAGER] Registered {:?} as client {} (flags {:#06x})",
            component,
            id,
            initial_flags.bits()
        );
        Ok(id)
    }

    fn unregister_client(&self, client_id: ClientId) -> Result<(), ClientManagerError> {
        let mut state = self.state.lock();
        if state.clients.remove(&client_id).is_none() {
            return Err(ClientManagerError::UnknownClient(client_id));
        }
        debug!("[CLIENT-MANAGER] Unregistered client {}", client_id);
        Ok(())
    }

    fn update_client_status(
        &self,
        client_id: ClientId,
        flags: StatusFlags,
    ) -> Result<(), ClientManagerError> {
        let mut state = self.state.lock();
        let client = state
            .clients
            .get_mut(&client_id)
            .ok_or(ClientManagerError::UnknownClient(client_id))?;
        client.flags = flags;
        Ok(())
    }

    fn query_status(&self) -> StatusFlags {
        self.state.lock().host_status
    }

    fn host_transport(&self) -> Option<Arc<dyn ListenerTransport>> {
        self.host_transport
            .as_ref()
            .map(|t| Arc::clone(t) as Arc<dyn ListenerTransport>)
    }

    fn name(&self) -> &str {
        "listener"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_rotate() {
        let manager = ListenerClientManager::new(16);
        let host = manager.register_host().unwrap();
        let a = manager
            .register_client(Component::Tool, StatusFlags::NONE)
            .unwrap();
        let b = manager
            .register_client(Component::Driver, StatusFlags::NONE)
            .unwrap();
        assert_ne!(host, a);
        assert_ne!(a, b);

        manager.unregister_client(a).unwrap();
        let c = manager
            .register_client(Component::Tool, StatusFlags::NONE)
            .unwrap();
        // freed id is not immediately reused
        assert_ne!(c, a);
        assert_eq!(manager.client_count(), 2);
    }

    #[test]
    fn test_allocation_wraps_and_skips_used_ids() {
        let manager = ListenerClientManager::new(16);
        manager.state.lock().next_id = CLIENT_ID_MASK;
        let last = manager
            .register_client(Component::Tool, StatusFlags::NONE)
            .unwrap();
        assert_eq!(last, CLIENT_ID_MASK);

        manager.state.lock().clients.insert(
            1,
            RegisteredClient {
                component: Component::Tool,
                flags: StatusFlags::NONE,
            },
        );
        let wrapped = manager
            .register_client(Component::Tool, StatusFlags::NONE)
            .unwrap();
        assert_eq!(wrapped, 2);
    }

    #[test]
    fn test_limit_and_invalid_component() {
        let manager = ListenerClientManager::new(1);
        assert_eq!(
            manager.register_client(Component::Unknown, StatusFlags::NONE),
            Err(ClientManagerError::InvalidComponent(0))
        );
        manager
            .register_client(Component::Tool, StatusFlags::NONE)
            .unwrap();
        assert_eq!(
            manager.register_client(Component::Tool, StatusFlags::NONE),
            Err(ClientManagerError::Exhausted(1))
        );
    }

    #[test]
    fn test_single_host() {
        let manager = ListenerClientManager::default();
        let host = manager.register_host().unwrap();
        assert_eq!(
            manager.register_host(),
            Err(ClientManagerError::HostAlreadyRegistered(host))
        );
        manager.unregister_host().unwrap();
        assert_eq!(manager.unregister_host(), Err(ClientManagerError::NoHost));
    }

    #[test]
    fn test_status_updates() {
        let manager = ListenerClientManager::default();
        let id = manager
            .register_client(Component::Driver, StatusFlags::NONE)
            .unwrap();
        manager
            .update_client_status(id, StatusFlags::HALT_ON_CONNECT)
            .unwrap();
        assert_eq!(manager.client_status(id), Some(StatusFlags::HALT_ON_CONNECT));
        assert!(manager
            .update_client_status(id + 1, StatusFlags::NONE)
            .is_err());
        assert_eq!(manager.query_status(), StatusFlags::DEVELOPER_MODE_ENABLED);
    }

    #[test]
    fn test_host_transport_exposed() {
        assert!(ListenerClientManager::default().host_transport().is_none());
        let manager = ListenerClientManager::default().with_host_transport(HostTransport::new());
        assert!(manager.host_transport().is_some());
        assert!(manager.host_endpoint().is_some());
        assert!(manager.host_endpoint().is_none());
    }
}
