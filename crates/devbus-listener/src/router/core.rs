// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Router core
//!
//! Owns the client table and the transport table. Each table has its own
//! mutex; code that needs both always locks `clients` before `transports`,
//! and no transport I/O ever happens while either lock is held.
//!
//! Client-management and system messages are queued by the receive threads
//! and processed on the router's own thread, which also runs the liveness
//! sweep. All mutations of the tables caused by protocol traffic are
//! therefore serialized on that one thread.

use devbus_protocol::{
    is_out_of_band, negotiate_version, ClientId, ClientInfoPayload, ClientMetadata, Component,
    ConnectRequestPayload, ConnectResponsePayload, ManagementMessage, MessageBuffer, Protocol,
    QueryStatusResponsePayload, ResultCode, SetClientFlagsPayload,
    SetClientFlagsResponsePayload, StatusFlags, StatusFlagsMode, SystemMessage, TransportHandle,
    BROADCAST_CLIENT_ID, INVALID_TRANSPORT_HANDLE,
};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::context::{ClientContext, ClientInfo, TransportContext};
use super::RouterSettings;
use crate::client_manager::ClientManager;
use crate::connection::{ConnectionInfo, MessageContext};
use crate::error::{ClientManagerError, RouterError, TransportResult};
use crate::transports::ListenerTransport;

/// Messages waiting for the processing thread beyond this are dropped
const MAX_PENDING_MESSAGES: usize = 4096;

/// What a receive thread should do with a message it just read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Queued for the router thread; nothing to forward
    Consumed,
    /// Forward to the destination (or fan out if broadcast)
    Forward,
    /// Not routable
    Drop,
}

struct TransportTable {
    entries: HashMap<TransportHandle, TransportContext>,
    next_handle: TransportHandle,
}

/// Central message router
///
/// The processing thread and every enabled transport's receive threads hold
/// an `Arc` to the router, so dropping the last outside handle does not stop
/// it. Call [`RouterCore::stop`] before releasing the router; `ListenerCore`
/// does this on destroy.
pub struct RouterCore {
    settings: RouterSettings,
    clients: Mutex<HashMap<ClientId, ClientContext>>,
    transports: Mutex<TransportTable>,
    client_manager: RwLock<Option<Arc<dyn ClientManager>>>,
    host_client_id: AtomicU16,
    host_info: RwLock<ClientInfoPayload>,
    queue: Mutex<VecDeque<MessageContext>>,
    queue_signal: Condvar,
    active: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    last_ping: Mutex<Option<Instant>>,
    generation: AtomicU64,
}

impl RouterCore {
    pub fn new(settings: RouterSettings) -> Arc<Self> {
        Arc::new(Self {
            settings: settings.normalized(),
            clients: Mutex::new(HashMap::new()),
            transports: Mutex::new(TransportTable {
                entries: HashMap::new(),
                next_handle: INVALID_TRANSPORT_HANDLE + 1,
            }),
            client_manager: RwLock::new(None),
            host_client_id: AtomicU16::new(BROADCAST_CLIENT_ID),
            host_info: RwLock::new(ClientInfoPayload::default()),
            queue: Mutex::new(VecDeque::new()),
            queue_signal: Condvar::new(),
            active: AtomicBool::new(false),
            thread: Mutex::new(None),
            last_ping: Mutex::new(None),
            generation: AtomicU64::new(0),
        })
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Client id the router uses for its own messages
    pub fn host_client_id(&self) -> ClientId {
        self.host_client_id.load(Ordering::Acquire)
    }

    /// Bumped on every client removal; lets routing caches drop stale entries
    pub fn client_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn client_manager(&self) -> Option<Arc<dyn ClientManager>> {
        self.client_manager.read().clone()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Install the client manager, claim the host id and register its
    /// loopback transport (if any)
    pub fn set_client_manager(
        self: &Arc<Self>,
        manager: Arc<dyn ClientManager>,
    ) -> Result<(), RouterError> {
        if self.is_running() {
            return Err(RouterError::AlreadyRunning);
        }
        if self.client_manager.read().is_some() {
            self.release_client_manager();
        }

        let host_id = manager.register_host()?;
        self.host_client_id.store(host_id, Ordering::Release);
        *self.client_manager.write() = Some(Arc::clone(&manager));

        if let Some(host_transport) = manager.host_transport() {
            if let Err(e) = self.register_transport(host_transport) {
                self.release_client_manager();
                return Err(e);
            }
        }

        info!(
            "[ROUTER] Client manager '{}' installed, host client id {}",
            manager.name(),
            host_id
        );
        Ok(())
    }

    fn release_client_manager(&self) {
        if let Some(manager) = self.client_manager.write().take() {
            if let Err(e) = manager.unregister_host() {
                warn!("[ROUTER] Failed to unregister host: {}", e);
            }
        }
        self.host_client_id
            .store(BROADCAST_CLIENT_ID, Ordering::Release);
    }

    /// Enable `transport` and add it to the transport table
    pub fn register_transport(
        self: &Arc<Self>,
        transport: Arc<dyn ListenerTransport>,
    ) -> Result<TransportHandle, RouterError> {
        let mut transports = self.transports.lock();
        let handle = transports.next_handle;
        transport.enable(self, handle)?;
        transports.next_handle = handle.wrapping_add(1).max(INVALID_TRANSPORT_HANDLE + 1);
        info!(
            "[ROUTER] Registered transport '{}' as handle {}",
            transport.transport_name(),
            handle
        );
        transports
            .entries
            .insert(handle, TransportContext::new(transport));
        Ok(handle)
    }

    /// Evict every client of the transport, drop it, then disable it
    pub fn remove_transport(&self, handle: TransportHandle) -> Result<(), RouterError> {
        let (transport, notices) = {
            let mut clients = self.clients.lock();
            let mut transports = self.transports.lock();
            let ids: Vec<ClientId> = match transports.entries.get(&handle) {
                Some(context) => context.clients.keys().copied().collect(),
                None => return Err(RouterError::UnknownTransport(handle)),
            };
            let notices: Vec<MessageBuffer> = ids
                .into_iter()
                .filter_map(|id| self.detach_client(&mut clients, &mut transports.entries, id))
                .collect();
            let context = transports
                .entries
                .remove(&handle)
                .ok_or(RouterError::UnknownTransport(handle))?;
            (context.transport, notices)
        };

        if let Err(e) = transport.disable() {
            warn!(
                "[ROUTER] Transport '{}' failed to disable cleanly: {}",
                transport.transport_name(),
                e
            );
        }
        info!(
            "[ROUTER] Removed transport '{}' (handle {})",
            transport.transport_name(),
            handle
        );

        for notice in notices {
            self.broadcast(&notice, None);
        }
        Ok(())
    }

    pub fn transport_count(&self) -> usize {
        self.transports.lock().entries.len()
    }

    /// Start the processing/maintenance thread
    ///
    /// The thread keeps the router alive until [`RouterCore::stop`].
    ///
    /// # Arguments
    /// * `description` - Reported to peers querying the host's client info
    pub fn start(self: &Arc<Self>, description: &str) -> Result<(), RouterError> {
        if self.is_running() {
            return Err(RouterError::AlreadyRunning);
        }
        if self.client_manager.read().is_none() {
            return Err(RouterError::NoClientManager);
        }
        if self.transports.lock().entries.is_empty() {
            return Err(RouterError::NoTransports);
        }

        *self.host_info.write() = ClientInfoPayload {
            name: process_name(),
            description: description.to_string(),
            metadata: ClientMetadata {
                protocols: 0,
                component: Component::Server,
                status: StatusFlags::NONE,
            },
            process_id: std::process::id(),
        };
        *self.last_ping.lock() = None;

        self.active.store(true, Ordering::Release);
        let router = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("devbus-router".to_string())
            .spawn(move || router.run_processing_loop());

        match spawned {
            Ok(handle) => {
                *self.thread.lock() = Some(handle);
                info!("[ROUTER] Started (host client {})", self.host_client_id());
                Ok(())
            }
            Err(e) => {
                self.active.store(false, Ordering::Release);
                Err(RouterError::Thread(e))
            }
        }
    }

    /// Remove all transports, stop the processing thread, release the host id
    ///
    /// Idempotent.
    pub fn stop(&self) {
        let handles: Vec<TransportHandle> =
            self.transports.lock().entries.keys().copied().collect();
        for handle in handles {
            if let Err(e) = self.remove_transport(handle) {
                debug!("[ROUTER] Transport {} already gone: {}", handle, e);
            }
        }

        let was_running = self.active.swap(false, Ordering::AcqRel);
        self.queue_signal.notify_all();
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!("[ROUTER] Processing thread panicked");
            }
        }
        self.queue.lock().clear();
        self.release_client_manager();

        if was_running {
            info!("[ROUTER] Stopped");
        }
    }

    fn run_processing_loop(&self) {
        debug!("[ROUTER] Processing thread running");
        while self.is_running() {
            {
                let mut queue = self.queue.lock();
                if queue.is_empty() && self.is_running() {
                    self.queue_signal
                        .wait_for(&mut queue, self.settings.queue_wait);
                }
            }
            self.process_pending();
            self.update_clients();
        }
        debug!("[ROUTER] Processing thread exiting");
    }

    // ------------------------------------------------------------------
    // Receive-side entry points
    // ------------------------------------------------------------------

    /// Classify a received message, queueing the ones the router handles
    pub fn accept_message(&self, context: &MessageContext) -> Disposition {
        let header = &context.message.header;

        if header.protocol == Protocol::CLIENT_MANAGEMENT || is_out_of_band(header) {
            self.enqueue(context.clone());
            return Disposition::Consumed;
        }
        if header.src_client_id == BROADCAST_CLIENT_ID {
            return Disposition::Drop;
        }
        if header.protocol == Protocol::SYSTEM {
            if header.dst_client_id == self.host_client_id() {
                self.enqueue(context.clone());
                return Disposition::Consumed;
            }
            if header.dst_client_id == BROADCAST_CLIENT_ID {
                self.enqueue(context.clone());
            }
        }
        Disposition::Forward
    }

    fn enqueue(&self, context: MessageContext) {
        let mut queue = self.queue.lock();
        if queue.len() >= MAX_PENDING_MESSAGES {
            warn!(
                "[ROUTER] Processing queue full, dropping {} message {} from client {}",
                context.message.header.protocol,
                context.message.header.message_id,
                context.message.header.src_client_id
            );
            return;
        }
        queue.push_back(context);
        self.queue_signal.notify_one();
    }

    /// Process everything queued so far on the calling thread
    pub fn process_pending(&self) {
        let batch = std::mem::take(&mut *self.queue.lock());
        for context in batch {
            self.process_message(&context);
        }
    }

    fn process_message(&self, context: &MessageContext) {
        let header = &context.message.header;
        if header.protocol == Protocol::CLIENT_MANAGEMENT || is_out_of_band(header) {
            self.process_management_message(context);
        } else if header.protocol == Protocol::SYSTEM {
            self.process_system_message(context);
        }
    }

    /// Fan a broadcast message out to everyone except its sender
    pub fn route_broadcast_message(&self, context: &MessageContext) {
        self.broadcast(&context.message, Some(context.connection.handle()));
    }

    /// Look up how to reach `client_id`
    pub fn resolve_route(
        &self,
        client_id: ClientId,
    ) -> Option<(ConnectionInfo, Arc<dyn ListenerTransport>)> {
        let clients = self.clients.lock();
        let connection = clients.get(&client_id)?.connection;
        let transports = self.transports.lock();
        let transport = Arc::clone(&transports.entries.get(&connection.handle())?.transport);
        Some((connection, transport))
    }

    pub fn connection_info_for_client(&self, client_id: ClientId) -> Option<ConnectionInfo> {
        self.clients.lock().get(&client_id).map(|c| c.connection)
    }

    pub fn transport_for_handle(
        &self,
        handle: TransportHandle,
    ) -> Option<Arc<dyn ListenerTransport>> {
        self.transports
            .lock()
            .entries
            .get(&handle)
            .map(|c| Arc::clone(&c.transport))
    }

    // ------------------------------------------------------------------
    // Client table
    // ------------------------------------------------------------------

    /// Connected clients, host excluded, ordered by id
    pub fn connected_clients(&self) -> Vec<ClientInfo> {
        let host = self.host_client_id();
        let clients = self.clients.lock();
        let mut list: Vec<ClientInfo> = clients
            .iter()
            .filter(|(id, _)| **id != host)
            .map(|(id, context)| context.info(*id))
            .collect();
        list.sort_by_key(|c| c.client_id);
        list
    }

    pub fn client_info(&self, client_id: ClientId) -> Option<ClientInfo> {
        self.clients.lock().get(&client_id).map(|c| c.info(client_id))
    }

    /// Client registered on `connection`, if the transport tracks peers
    fn find_client_by_connection(&self, connection: &ConnectionInfo) -> Option<ClientId> {
        let transports = self.transports.lock();
        let context = transports.entries.get(&connection.handle())?;
        if context.transport.forwarding_connection() {
            return None;
        }
        context
            .clients
            .iter()
            .find(|(_, peer)| *peer == connection)
            .map(|(id, _)| *id)
    }

    fn add_client(
        &self,
        clients: &mut HashMap<ClientId, ClientContext>,
        transports: &mut HashMap<TransportHandle, TransportContext>,
        client_id: ClientId,
        connection: ConnectionInfo,
        registered: bool,
        status_mode: StatusFlagsMode,
    ) -> bool {
        let Some(transport) = transports.get_mut(&connection.handle()) else {
            return false;
        };
        transport.clients.insert(client_id, connection);
        clients.insert(
            client_id,
            ClientContext::new(connection, registered, status_mode),
        );
        info!(
            "[ROUTER] Client {} connected on '{}'{}",
            client_id,
            transport.transport.transport_name(),
            if registered { " (registered)" } else { "" }
        );
        true
    }

    /// Drop a client from both tables
    ///
    /// Returns the `ClientDisconnected` notice to broadcast when the client
    /// was registered. Caller holds both locks and sends the notice after
    /// releasing them.
    fn detach_client(
        &self,
        clients: &mut HashMap<ClientId, ClientContext>,
        transports: &mut HashMap<TransportHandle, TransportContext>,
        client_id: ClientId,
    ) -> Option<MessageBuffer> {
        let context = clients.remove(&client_id)?;
        self.generation.fetch_add(1, Ordering::AcqRel);

        if let Some(transport) = transports.get_mut(&context.connection.handle()) {
            transport.clients.remove(&client_id);
        }
        info!("[ROUTER] Client {} disconnected", client_id);

        if !context.registered {
            return None;
        }
        if let Some(manager) = self.client_manager() {
            if let Err(e) = manager.unregister_client(client_id) {
                warn!("[ROUTER] Failed to unregister client {}: {}", client_id, e);
            }
        }
        Some(SystemMessage::ClientDisconnected.message(client_id, BROADCAST_CLIENT_ID))
    }

    /// Remove every client reached through `connection`
    ///
    /// Called by stream transports when a peer's connection closes.
    pub fn remove_connection(&self, connection: &ConnectionInfo) {
        let ids: Vec<ClientId> = {
            let transports = self.transports.lock();
            match transports.entries.get(&connection.handle()) {
                Some(context) => context
                    .clients
                    .iter()
                    .filter(|(_, peer)| *peer == connection)
                    .map(|(id, _)| *id)
                    .collect(),
                None => return,
            }
        };
        if !ids.is_empty() {
            debug!(
                "[ROUTER] Connection closed, removing clients {:?}",
                ids
            );
            self.remove_clients(ids);
        }
    }

    /// Remove a client and announce it if it was registered
    pub fn remove_client(&self, client_id: ClientId) {
        self.remove_clients(vec![client_id]);
    }

    /// Removals triggered by failed notices are handled by the same worklist
    fn remove_clients(&self, mut pending: Vec<ClientId>) {
        while let Some(client_id) = pending.pop() {
            let notice = {
                let mut clients = self.clients.lock();
                let mut transports = self.transports.lock();
                self.detach_client(&mut clients, &mut transports.entries, client_id)
            };
            if let Some(notice) = notice {
                pending.extend(self.fan_out(&notice, None));
            }
        }
    }

    // ------------------------------------------------------------------
    // Transmission
    // ------------------------------------------------------------------

    fn broadcast(&self, message: &MessageBuffer, source: Option<TransportHandle>) {
        let failed = self.fan_out(message, source);
        if !failed.is_empty() {
            self.remove_clients(failed);
        }
    }

    /// Send to every forwarding transport except `source` and to every
    /// tracked peer except the sender. Returns peers whose send failed.
    fn fan_out(&self, message: &MessageBuffer, source: Option<TransportHandle>) -> Vec<ClientId> {
        enum Target {
            Forward(Arc<dyn ListenerTransport>),
            Peer(ClientId, ConnectionInfo, Arc<dyn ListenerTransport>),
        }

        let sender = message.header.src_client_id;
        let targets: Vec<Target> = {
            let transports = self.transports.lock();
            let mut targets = Vec::new();
            for (handle, context) in &transports.entries {
                if context.transport.forwarding_connection() {
                    if source != Some(*handle) {
                        targets.push(Target::Forward(Arc::clone(&context.transport)));
                    }
                    continue;
                }
                for (client_id, connection) in &context.clients {
                    if *client_id != sender {
                        targets.push(Target::Peer(
                            *client_id,
                            *connection,
                            Arc::clone(&context.transport),
                        ));
                    }
                }
            }
            targets
        };

        let mut failed = Vec::new();
        for target in targets {
            match target {
                Target::Forward(transport) => {
                    if let Err(e) = transport.transmit_broadcast_message(message) {
                        debug!(
                            "[ROUTER] Broadcast to '{}' failed: {}",
                            transport.transport_name(),
                            e
                        );
                    }
                }
                Target::Peer(client_id, connection, transport) => {
                    match transport.transmit_message(&connection, message) {
                        Ok(()) => {}
                        Err(e) if e.is_fatal() => {
                            warn!("[ROUTER] Broadcast to client {} failed: {}", client_id, e);
                            failed.push(client_id);
                        }
                        Err(e) => debug!("[ROUTER] Broadcast to client {} skipped: {}", client_id, e),
                    }
                }
            }
        }
        failed
    }

    /// Send a router-originated reply, retrying while the transport is busy
    fn transmit_with_retry(
        &self,
        transport: &Arc<dyn ListenerTransport>,
        connection: &ConnectionInfo,
        message: &MessageBuffer,
    ) -> TransportResult<()> {
        let deadline = Instant::now() + self.settings.transmit_retry_timeout;
        loop {
            match transport.transmit_message(connection, message) {
                Err(e) if e.is_not_ready() && Instant::now() < deadline => thread::yield_now(),
                other => return other,
            }
        }
    }

    /// Reply on `connection`; a fatal failure removes `client` (if known)
    fn respond(
        &self,
        transport: &Arc<dyn ListenerTransport>,
        connection: &ConnectionInfo,
        client: Option<ClientId>,
        message: &MessageBuffer,
    ) -> bool {
        match self.transmit_with_retry(transport, connection, message) {
            Ok(()) => true,
            Err(e) if e.is_fatal() => {
                warn!(
                    "[ROUTER] Reply on '{}' failed: {}",
                    transport.transport_name(),
                    e
                );
                if let Some(client_id) = client.filter(|id| *id != BROADCAST_CLIENT_ID) {
                    self.remove_client(client_id);
                }
                false
            }
            Err(e) => {
                debug!("[ROUTER] Reply dropped: {}", e);
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Client management protocol
    // ------------------------------------------------------------------

    fn process_management_message(&self, context: &MessageContext) {
        let Some(transport) = self.transport_for_handle(context.connection.handle()) else {
            return;
        };
        let header = &context.message.header;
        let connection = &context.connection;

        let negotiated = if is_out_of_band(header) {
            match negotiate_version(header) {
                Some(mode) => Some(mode),
                None => {
                    debug!(
                        "[ROUTER] Rejecting out-of-band message with version {}",
                        header.sequence
                    );
                    let mut response = ConnectResponsePayload {
                        result: ResultCode::VersionMismatch,
                        client_id: BROADCAST_CLIENT_ID,
                    }
                    .to_message();
                    response.header.protocol = header.protocol;
                    self.respond(&transport, connection, None, &response);
                    return;
                }
            }
        } else {
            None
        };

        let Ok(kind) = ManagementMessage::try_from(header.message_id) else {
            debug!("[ROUTER] Unknown management message {}", header.message_id);
            return;
        };

        match kind {
            ManagementMessage::KeepAlive if negotiated.is_some() => {
                let mut echo = ManagementMessage::KeepAlive.out_of_band();
                echo.header.session_id = header.session_id;
                self.respond(&transport, connection, None, &echo);
            }
            ManagementMessage::ConnectRequest => {
                let mode = negotiated.unwrap_or(StatusFlagsMode::Distributed);
                self.handle_connect_request(&transport, context, mode);
            }
            ManagementMessage::DisconnectNotification => {
                self.handle_disconnect_notification(&transport, context);
            }
            ManagementMessage::SetClientFlags => {
                self.handle_set_client_flags(&transport, context);
            }
            ManagementMessage::QueryStatus => {
                self.handle_query_status(&transport, context, negotiated);
            }
            other => debug!("[ROUTER] Ignoring management message {:?}", other),
        }
    }

    fn handle_connect_request(
        &self,
        transport: &Arc<dyn ListenerTransport>,
        context: &MessageContext,
        mode: StatusFlagsMode,
    ) {
        let connection = context.connection;
        let (result, client_id, announce) = match ConnectRequestPayload::decode(
            context.message.payload(),
        ) {
            Err(e) => {
                debug!("[ROUTER] Malformed ConnectRequest: {}", e);
                (ResultCode::VersionMismatch, BROADCAST_CLIENT_ID, false)
            }
            Ok(request) => match self.find_client_by_connection(&connection) {
                Some(existing) => (ResultCode::Success, existing, false),
                None => match self.register_connection(connection, request, mode) {
                    Ok(client_id) => (ResultCode::Success, client_id, true),
                    Err(e) => {
                        warn!("[ROUTER] Client registration failed: {}", e);
                        (e.result_code(), BROADCAST_CLIENT_ID, false)
                    }
                },
            },
        };

        if announce {
            let notice = SystemMessage::ClientConnected.message(client_id, BROADCAST_CLIENT_ID);
            self.broadcast(&notice, None);
        }

        let response = ConnectResponsePayload { result, client_id }.to_message();
        self.respond(transport, &connection, Some(client_id), &response);
    }

    fn register_connection(
        &self,
        connection: ConnectionInfo,
        request: ConnectRequestPayload,
        mode: StatusFlagsMode,
    ) -> Result<ClientId, ClientManagerError> {
        let component = Component::try_from(request.component)
            .map_err(|_| ClientManagerError::InvalidComponent(request.component))?;
        let manager = self.client_manager().ok_or(ClientManagerError::NoHost)?;

        let mut clients = self.clients.lock();
        let mut transports = self.transports.lock();
        let client_id = manager.register_client(component, request.initial_flags)?;
        if !self.add_client(
            &mut clients,
            &mut transports.entries,
            client_id,
            connection,
            true,
            mode,
        ) {
            // transport went away while the request was queued
            if let Err(e) = manager.unregister_client(client_id) {
                warn!("[ROUTER] Failed to unregister client {}: {}", client_id, e);
            }
            return Err(ClientManagerError::UnknownClient(client_id));
        }
        Ok(client_id)
    }

    fn handle_disconnect_notification(
        &self,
        transport: &Arc<dyn ListenerTransport>,
        context: &MessageContext,
    ) {
        let src = context.message.header.src_client_id;
        match self.find_client_by_connection(&context.connection) {
            Some(client_id) if client_id == src => {
                let mut response =
                    ManagementMessage::DisconnectResponse.message(self.host_client_id(), src);
                response.header.session_id = context.message.header.session_id;
                self.respond(transport, &context.connection, None, &response);
                self.remove_client(client_id);
            }
            Some(client_id) => warn!(
                "[ROUTER] Connection of client {} sent a disconnect for client {}; ignored",
                client_id, src
            ),
            None => debug!("[ROUTER] Disconnect from unknown connection ignored"),
        }
    }

    fn handle_set_client_flags(
        &self,
        transport: &Arc<dyn ListenerTransport>,
        context: &MessageContext,
    ) {
        let header = &context.message.header;
        let src = header.src_client_id;
        if self.find_client_by_connection(&context.connection) != Some(src) {
            warn!("[ROUTER] SetClientFlags for client {} from a foreign connection", src);
            return;
        }

        let mode = self
            .clients
            .lock()
            .get(&src)
            .map(|c| c.status_mode)
            .unwrap_or(StatusFlagsMode::Distributed);

        let result = match (mode, SetClientFlagsPayload::decode(context.message.payload())) {
            (StatusFlagsMode::Distributed, _) => ResultCode::Error,
            (StatusFlagsMode::Centralized, Err(_)) => ResultCode::Error,
            (StatusFlagsMode::Centralized, Ok(request)) => match self.client_manager() {
                Some(manager) => match manager.update_client_status(src, request.flags) {
                    Ok(()) => ResultCode::Success,
                    Err(e) => e.result_code(),
                },
                None => ResultCode::Error,
            },
        };

        let mut response =
            ManagementMessage::SetClientFlagsResponse.message(self.host_client_id(), src);
        response.header.session_id = header.session_id;
        let _ = response.set_payload(&SetClientFlagsResponsePayload { result }.encode());
        self.respond(transport, &context.connection, Some(src), &response);
    }

    fn handle_query_status(
        &self,
        transport: &Arc<dyn ListenerTransport>,
        context: &MessageContext,
        negotiated: Option<StatusFlagsMode>,
    ) {
        let known = self.find_client_by_connection(&context.connection);
        let mode = negotiated
            .or_else(|| {
                known.and_then(|id| self.clients.lock().get(&id).map(|c| c.status_mode))
            })
            .unwrap_or(StatusFlagsMode::Distributed);

        let payload = match (mode, self.client_manager()) {
            (StatusFlagsMode::Centralized, Some(manager)) => QueryStatusResponsePayload {
                result: ResultCode::Success,
                flags: manager.query_status(),
            },
            (StatusFlagsMode::Centralized, None) => QueryStatusResponsePayload {
                result: ResultCode::Error,
                flags: StatusFlags::NONE,
            },
            (StatusFlagsMode::Distributed, _) => QueryStatusResponsePayload {
                result: ResultCode::Success,
                flags: StatusFlags::DEVELOPER_MODE_ENABLED,
            },
        };

        let mut response = ManagementMessage::QueryStatusResponse.out_of_band();
        response.header.session_id = context.message.header.session_id;
        let _ = response.set_payload(&payload.encode());
        self.respond(transport, &context.connection, known, &response);
    }

    // ------------------------------------------------------------------
    // System protocol
    // ------------------------------------------------------------------

    fn process_system_message(&self, context: &MessageContext) {
        let header = &context.message.header;
        let src = header.src_client_id;
        let host = self.host_client_id();
        if src == BROADCAST_CLIENT_ID || src == host {
            return;
        }
        let Ok(kind) = SystemMessage::try_from(header.message_id) else {
            debug!("[ROUTER] Unknown system message {} from {}", header.message_id, src);
            return;
        };

        let mut query = false;
        let mut remove = false;
        {
            let mut clients = self.clients.lock();
            let known = clients.contains_key(&src);
            if !known && kind != SystemMessage::ClientDisconnected {
                let mut transports = self.transports.lock();
                query = self.add_client(
                    &mut clients,
                    &mut transports.entries,
                    src,
                    context.connection,
                    false,
                    StatusFlagsMode::Distributed,
                );
            }

            match kind {
                SystemMessage::ClientConnected => {
                    if let Some(client) = clients.get(&src) {
                        query |= !client.identified;
                    }
                }
                SystemMessage::ClientDisconnected => remove = known,
                SystemMessage::Pong => {
                    if let Some(client) = clients.get_mut(&src) {
                        client.received_pong = true;
                        query |= !client.identified;
                    }
                }
                SystemMessage::ClientInfo => {
                    if let Some(client) = clients.get_mut(&src) {
                        match ClientInfoPayload::decode(context.message.payload()) {
                            Ok(info) => {
                                client.name = info.name;
                                client.description = info.description;
                                client.process_id = info.process_id;
                                client.ping_retry_count = 0;
                                client.received_pong = true;
                                client.identified = true;
                                query = false;
                                debug!(
                                    "[ROUTER] Client {} identified as '{}' (pid {})",
                                    src, client.name, client.process_id
                                );
                            }
                            Err(e) => debug!("[ROUTER] Bad ClientInfo from {}: {}", src, e),
                        }
                    }
                }
                _ => {}
            }
        }

        if remove {
            self.remove_client(src);
            return;
        }

        if let Some(transport) = self.transport_for_handle(context.connection.handle()) {
            match kind {
                SystemMessage::QueryClientInfo if header.dst_client_id == host => {
                    let reply = self.host_info.read().to_message(host, src);
                    self.respond(&transport, &context.connection, Some(src), &reply);
                }
                SystemMessage::Ping => {
                    let pong = SystemMessage::Pong.message(host, src);
                    self.respond(&transport, &context.connection, Some(src), &pong);
                }
                _ => {}
            }

            if query {
                let request = SystemMessage::QueryClientInfo.message(host, src);
                if let Err(e) = transport.transmit_message(&context.connection, &request) {
                    if e.is_fatal() {
                        self.remove_client(src);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Liveness
    // ------------------------------------------------------------------

    /// Run a liveness sweep if the ping interval has elapsed
    pub fn update_clients(&self) {
        let due = match *self.last_ping.lock() {
            Some(last) => last.elapsed() >= self.settings.ping_interval,
            None => true,
        };
        if due {
            self.ping_clients();
        }
    }

    /// Age every client, evict the silent ones, then broadcast a ping
    pub fn ping_clients(&self) {
        let limit = self.settings.client_timeout_count;
        let notices: Vec<MessageBuffer> = {
            let mut clients = self.clients.lock();
            let mut transports = self.transports.lock();

            let mut expired = Vec::new();
            for (client_id, client) in clients.iter_mut() {
                if client.received_pong {
                    client.ping_retry_count = 0;
                    client.received_pong = false;
                } else {
                    client.ping_retry_count += 1;
                }
                if client.ping_retry_count > limit {
                    expired.push(*client_id);
                }
            }

            expired
                .into_iter()
                .filter_map(|client_id| {
                    info!(
                        "[ROUTER] Client {} timed out after {} missed pings",
                        client_id, limit
                    );
                    self.detach_client(&mut clients, &mut transports.entries, client_id)
                })
                .collect()
        };

        for notice in notices {
            self.broadcast(&notice, None);
        }

        let ping = SystemMessage::Ping.message(self.host_client_id(), BROADCAST_CLIENT_ID);
        self.broadcast(&ping, None);
        *self.last_ping.lock() = Some(Instant::now());
    }
}

impl Drop for RouterCore {
    fn drop(&mut self) {
        if self.active.load(Ordering::Acquire) {
            warn!("[ROUTER] Dropped while running");
        }
    }
}

fn process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "devbus".to_string())
}
