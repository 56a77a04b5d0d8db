// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-process loopback transport
//!
//! Connects exactly one in-process peer (the [`HostEndpoint`]) to the router
//! over a pair of bounded crossbeam channels.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use devbus_protocol::{MessageBuffer, TransportHandle};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::ListenerTransport;
use crate::connection::{ConnectionInfo, MessageContext};
use crate::error::{TransportError, TransportResult};
use crate::router::{MessageSource, ReceiveWorker, RouterCore};

/// Capacity of each direction of the loopback
pub const HOST_QUEUE_CAPACITY: usize = 1024;

/// Connection id of the single in-process peer
const HOST_PEER_ID: u64 = 1;

/// The in-process side of a [`HostTransport`]
pub struct HostEndpoint {
    to_router: Sender<MessageBuffer>,
    from_router: Receiver<MessageBuffer>,
}

impl HostEndpoint {
    /// Queue a message for the router without blocking
    pub fn send(&self, message: MessageBuffer) -> TransportResult<()> {
        self.to_router.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::NotReady,
            TrySendError::Disconnected(_) => TransportError::ConnectionClosed,
        })
    }

    /// Wait up to `timeout` for a message from the router
    pub fn recv_timeout(&self, timeout: Duration) -> TransportResult<MessageBuffer> {
        self.from_router.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => TransportError::NotReady,
            RecvTimeoutError::Disconnected => TransportError::ConnectionClosed,
        })
    }

    pub fn try_recv(&self) -> TransportResult<MessageBuffer> {
        self.from_router.try_recv().map_err(|e| match e {
            TryRecvError::Empty => TransportError::NotReady,
            TryRecvError::Disconnected => TransportError::ConnectionClosed,
        })
    }
}

/// Router side of the loopback
pub struct HostTransport {
    to_endpoint: Sender<MessageBuffer>,
    from_endpoint: Receiver<MessageBuffer>,
    endpoint: Mutex<Option<HostEndpoint>>,
    worker: Mutex<Option<ReceiveWorker>>,
    handle: AtomicU32,
    enabled: AtomicBool,
}

impl HostTransport {
    pub fn new() -> Self {
        Self::with_capacity(HOST_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (to_endpoint, from_router) = channel::bounded(capacity);
        let (to_router, from_endpoint) = channel::bounded(capacity);
        Self {
            to_endpoint,
            from_endpoint,
            endpoint: Mutex::new(Some(HostEndpoint {
                to_router,
                from_router,
            })),
            worker: Mutex::new(None),
            handle: AtomicU32::new(0),
            enabled: AtomicBool::new(false),
        }
    }

    /// Hand out the in-process endpoint; only the first call succeeds
    pub fn endpoint(&self) -> Option<HostEndpoint> {
        self.endpoint.lock().take()
    }

    /// Connection info the router records for the host peer
    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo::from_id(self.handle.load(Ordering::Acquire), HOST_PEER_ID)
    }
}

impl Default for HostTransport {
    fn default() -> Self {
        Self::new()
    }
}

struct HostSource {
    inbound: Receiver<MessageBuffer>,
    connection: ConnectionInfo,
}

impl MessageSource for HostSource {
    fn receive_message(&mut self, timeout: Duration) -> TransportResult<MessageContext> {
        let message = if timeout.is_zero() {
            self.inbound.try_recv().map_err(|e| match e {
                TryRecvError::Empty => TransportError::NotReady,
                TryRecvError::Disconnected => TransportError::ConnectionClosed,
            })?
        } else {
            self.inbound.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => TransportError::NotReady,
                RecvTimeoutError::Disconnected => TransportError::ConnectionClosed,
            })?
        };
        Ok(MessageContext::new(self.connection, message))
    }
}

impl ListenerTransport for HostTransport {
    fn enable(&self, router: &Arc<RouterCore>, handle: TransportHandle) -> TransportResult<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(TransportError::AlreadyRunning);
        }
        self.handle.store(handle, Ordering::Release);

        let source = HostSource {
            inbound: self.from_endpoint.clone(),
            connection: self.connection_info(),
        };
        *worker = Some(ReceiveWorker::spawn(
            "devbus-host-rx",
            source,
            Arc::clone(router),
        )?);
        self.enabled.store(true, Ordering::Release);
        info!("[HOST] Loopback transport enabled (handle {})", handle);
        Ok(())
    }

    fn disable(&self) -> TransportResult<()> {
        self.enabled.store(false, Ordering::Release);
        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            worker.stop();
            debug!("[HOST] Loopback transport disabled");
        }
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
        if !self.is_enabled() {
            return Err(TransportError::NotRunning);
        }
        if connection.id() != Some(HOST_PEER_ID) {
            return Err(TransportError::NoRoute(message.header.dst_client_id));
        }
        self.to_endpoint
            .try_send(message.clone())
            .map_err(|e| match e {
                TrySendError::Full(_) => TransportError::NotReady,
                TrySendError::Disconnected(_) => TransportError::ConnectionClosed,
            })
    }

    fn transmit_broadcast_message(&self, _message: &MessageBuffer) -> TransportResult<()> {
        Err(TransportError::Unavailable(
            "host transport does not forward broadcasts".to_string(),
        ))
    }

    fn transport_name(&self) -> &str {
        "host"
    }
}

impl Drop for HostTransport {
    fn drop(&mut self) {
        let _ = self.disable();
    }
}
