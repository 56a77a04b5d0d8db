//! Shared fixtures for router unit tests

use devbus_protocol::{
    ClientId, Component, ConnectRequestPayload, ConnectResponsePayload, ManagementMessage,
    MessageBuffer, Protocol, StatusFlags, TransportHandle,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use super::{RouterCore, RouterSettings};
use crate::client_manager::{ClientManager, ListenerClientManager};
use crate::connection::{ConnectionInfo, MessageContext};
use crate::error::{TransportError, TransportResult};
use crate::transports::ListenerTransport;

/// Records everything the router sends through it
pub(crate) struct MockTransport {
    name: String,
    forwarding: bool,
    enabled: AtomicBool,
    handle: AtomicU32,
    sent: Mutex<Vec<(ConnectionInfo, MessageBuffer)>>,
    broadcasts: Mutex<Vec<MessageBuffer>>,
    failures: Mutex<VecDeque<TransportError>>,
}

impl MockTransport {
    pub fn new(name: &str) -> Arc<Self> {
        Self::build(name, false)
    }

    pub fn forwarding(name: &str) -> Arc<Self> {
        Self::build(name, true)
    }

    fn build(name: &str, forwarding: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            forwarding,
            enabled: AtomicBool::new(false),
            handle: AtomicU32::new(0),
            sent: Mutex::new(Vec::new()),
            broadcasts: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
        })
    }

    pub fn handle(&self) -> TransportHandle {
        self.handle.load(Ordering::Acquire)
    }

    /// Connection info of peer `id` on this transport
    pub fn peer(&self, id: u64) -> ConnectionInfo {
        ConnectionInfo::from_id(self.handle(), id)
    }

    /// Fail the next unicast transmit with `error`
    pub fn fail_next(&self, error: TransportError) {
        self.failures.lock().push_back(error);
    }

    pub fn take_sent(&self) -> Vec<(ConnectionInfo, MessageBuffer)> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn take_broadcasts(&self) -> Vec<MessageBuffer> {
        std::mem::take(&mut *self.broadcasts.lock())
    }

    /// Messages sent to `peer` with the given protocol and id
    pub fn sent_to(
        &self,
        peer: ConnectionInfo,
        protocol: Protocol,
        message_id: u8,
    ) -> Vec<MessageBuffer> {
        self.sent
            .lock()
            .iter()
            .filter(|(c, m)| {
                *c == peer && m.header.protocol == protocol && m.header.message_id == message_id
            })
            .map(|(_, m)| m.clone())
            .collect()
    }
}

impl ListenerTransport for MockTransport {
    fn enable(&self, _router: &Arc<RouterCore>, handle: TransportHandle) -> TransportResult<()> {
        self.handle.store(handle, Ordering::Release);
        self.enabled.store(true, Ordering::Release);
        Ok(())
    }

    fn disable(&self) -> TransportResult<()> {
        self.enabled.store(false, Ordering::Release);
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn transmit_message(
        &self,
        connection: &ConnectionInfo,
        message: &MessageBuffer,
    ) -> TransportResult<()> {
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        self.sent.lock().push((*connection, message.clone()));
        Ok(())
    }

    fn transmit_broadcast_message(&self, message: &MessageBuffer) -> TransportResult<()> {
        if !self.forwarding {
            return Err(TransportError::Unavailable("not forwarding".into()));
        }
        self.broadcasts.lock().push(message.clone());
        Ok(())
    }

    fn forwarding_connection(&self) -> bool {
        self.forwarding
    }

    fn transport_name(&self) -> &str {
        &self.name
    }
}

/// Route `tracing` output through the test harness (`RUST_LOG` filters it)
pub(crate) fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Router with a client manager and one mock transport; not started
pub(crate) fn router_with(
    manager: Arc<dyn ClientManager>,
    settings: RouterSettings,
) -> (Arc<RouterCore>, Arc<MockTransport>) {
    init_test_logging();
    let router = RouterCore::new(settings);
    router.set_client_manager(manager).unwrap();
    let transport = MockTransport::new("mock");
    router.register_transport(transport.clone()).unwrap();
    (router, transport)
}

pub(crate) fn connected_router() -> (Arc<RouterCore>, Arc<MockTransport>) {
    router_with(
        Arc::new(ListenerClientManager::default()),
        RouterSettings::default(),
    )
}

/// Run a ConnectRequest from `peer` through the router and return the reply
pub(crate) fn request_connection(
    router: &RouterCore,
    transport: &MockTransport,
    peer: ConnectionInfo,
    request: MessageBuffer,
) -> ConnectResponsePayload {
    router.accept_message(&MessageContext::new(peer, request));
    router.process_pending();
    let responses = transport.sent_to(
        peer,
        Protocol::CLIENT_MANAGEMENT,
        ManagementMessage::ConnectResponse as u8,
    );
    let last = responses.last().expect("no ConnectResponse sent");
    ConnectResponsePayload::decode(last.payload()).unwrap()
}

/// Connect a tool client on `peer` and return its id
pub(crate) fn connect_client(
    router: &RouterCore,
    transport: &MockTransport,
    peer: ConnectionInfo,
) -> ClientId {
    let request = ConnectRequestPayload::new(Component::Tool, StatusFlags::NONE).to_message();
    let response = request_connection(router, transport, peer, request);
    assert!(response.result.is_success());
    response.client_id
}
