//! Per-thread routing cache
//!
//! Remembers `client id -> (connection, transport)` so the receive fast path
//! only touches the router's tables on a miss. Entries are discarded
//! wholesale whenever the router's client generation moves, which happens on
//! every client removal.

use devbus_protocol::{ClientId, BROADCAST_CLIENT_ID};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::core::{Disposition, RouterCore};
use crate::connection::{ConnectionInfo, MessageContext};
use crate::error::{TransportError, TransportResult};
use crate::transports::ListenerTransport;

#[derive(Clone)]
struct Route {
    connection: ConnectionInfo,
    transport: Arc<dyn ListenerTransport>,
}

pub struct RoutingCache {
    router: Arc<RouterCore>,
    routes: HashMap<ClientId, Route>,
    generation: u64,
    enabled: bool,
}

impl RoutingCache {
    pub fn new(router: Arc<RouterCore>) -> Self {
        let generation = router.client_generation();
        Self {
            router,
            routes: HashMap::new(),
            generation,
            enabled: true,
        }
    }

    /// Cache that resolves every message through the router
    pub fn disabled(router: Arc<RouterCore>) -> Self {
        Self {
            enabled: false,
            ..Self::new(router)
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Route one received message
    ///
    /// Returns `NotReady` when the destination could not take the message
    /// right now; the caller decides whether to retry.
    pub fn route_message(&mut self, context: &MessageContext) -> TransportResult<()> {
        let dst = context.message.header.dst_client_id;

        match self.router.accept_message(context) {
            Disposition::Consumed => return Ok(()),
            Disposition::Drop => return Err(TransportError::NoRoute(dst)),
            Disposition::Forward => {}
        }

        if dst == BROADCAST_CLIENT_ID {
            self.router.route_broadcast_message(context);
            return Ok(());
        }

        let route = self.lookup(dst).ok_or(TransportError::NoRoute(dst))?;
        match route.transport.transmit_message(&route.connection, &context.message) {
            Err(e) if e.is_fatal() => {
                debug!("[ROUTER] Delivery to client {} failed: {}", dst, e);
                self.routes.remove(&dst);
                self.router.remove_client(dst);
                Err(e)
            }
            other => other,
        }
    }

    fn lookup(&mut self, client_id: ClientId) -> Option<Route> {
        let generation = self.router.client_generation();
        if generation != self.generation {
            self.routes.clear();
            self.generation = generation;
        }

        if let Some(route) = self.routes.get(&client_id) {
            return Some(route.clone());
        }

        let (connection, transport) = self.router.resolve_route(client_id)?;
        let route = Route {
            connection,
            transport,
        };
        if self.enabled {
            self.routes.insert(client_id, route.clone());
        }
        Some(route)
    }
}
