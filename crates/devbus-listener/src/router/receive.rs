// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Transport receive loops
//!
//! Every transport owns one [`ReceiveLoop`] per receive thread. A loop pulls
//! a batch from its [`MessageSource`], routes it through a thread-local
//! [`RoutingCache`], and carries messages whose destination was busy into
//! the next batch. A message is carried at most once.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

use super::cache::RoutingCache;
use super::core::RouterCore;
use crate::connection::MessageContext;
use crate::error::{TransportError, TransportResult};

/// Upper bound on messages drained in one batch
const MAX_BATCH: usize = 64;

/// Blocking receive side of a transport
pub trait MessageSource: Send {
    /// Wait up to `timeout` for one message
    ///
    /// `Duration::ZERO` polls without blocking. Returns
    /// `TransportError::NotReady` when nothing arrived in time.
    fn receive_message(&mut self, timeout: Duration) -> TransportResult<MessageContext>;
}

/// Receive/route loop for one source
pub struct ReceiveLoop<S: MessageSource> {
    source: S,
    cache: RoutingCache,
    retry: VecDeque<MessageContext>,
    receive_delay: Duration,
}

impl<S: MessageSource> ReceiveLoop<S> {
    pub fn new(source: S, router: Arc<RouterCore>) -> Self {
        let receive_delay = router.settings().receive_delay;
        Self {
            source,
            cache: RoutingCache::new(router),
            retry: VecDeque::new(),
            receive_delay,
        }
    }

    /// Messages waiting for a second routing attempt
    pub fn pending_retries(&self) -> usize {
        self.retry.len()
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Receive and route one batch
    ///
    /// Returns the number of messages routed (retries included). A fatal
    /// receive error is reported after the batch collected so far has been
    /// routed.
    pub fn run_once(&mut self) -> TransportResult<usize> {
        let carried = self.retry.len();
        let mut batch: Vec<MessageContext> = self.retry.drain(..).collect();

        let mut failure = None;
        let mut timeout = self.receive_delay;
        while batch.len() < MAX_BATCH + carried {
            match self.source.receive_message(timeout) {
                Ok(context) => {
                    batch.push(context);
                    timeout = Duration::ZERO;
                }
                Err(TransportError::NotReady) => break,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let routed = batch.len();
        for (index, context) in batch.into_iter().enumerate() {
            match self.cache.route_message(&context) {
                Ok(()) => {}
                Err(TransportError::NotReady) if index + 1 > carried => {
                    self.retry.push_back(context);
                }
                Err(TransportError::NotReady) => debug!(
                    "[TRANSPORT] Dropping message for busy client {} after retry",
                    context.message.header.dst_client_id
                ),
                Err(e) => debug!(
                    "[TRANSPORT] Message {}:{} from client {} not routed: {}",
                    context.message.header.protocol,
                    context.message.header.message_id,
                    context.message.header.src_client_id,
                    e
                ),
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(routed),
        }
    }

    /// Run batches until `active` is cleared or the source fails
    pub fn run(&mut self, active: &AtomicBool) -> TransportResult<()> {
        while active.load(Ordering::Acquire) {
            self.run_once()?;
        }
        Ok(())
    }
}

/// Dedicated thread driving a [`ReceiveLoop`]
///
/// Joins its thread on drop.
pub struct ReceiveWorker {
    handle: Option<JoinHandle<()>>,
    active: Arc<AtomicBool>,
    name: String,
}

impl ReceiveWorker {
    /// Spawn a named receive thread over `source`
    pub fn spawn<S>(name: &str, source: S, router: Arc<RouterCore>) -> TransportResult<Self>
    where
        S: MessageSource + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        let active_clone = Arc::clone(&active);
        let thread_name = name.to_string();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut receive_loop = ReceiveLoop::new(source, router);
                match receive_loop.run(&active_clone) {
                    Ok(()) => debug!("[TRANSPORT] {} stopped", thread_name),
                    Err(TransportError::ConnectionClosed) => {
                        debug!("[TRANSPORT] {} source closed", thread_name)
                    }
                    Err(e) => error!("[TRANSPORT] {} receive failed: {}", thread_name, e),
                }
                active_clone.store(false, Ordering::Release);
            })?;

        Ok(Self {
            handle: Some(handle),
            active,
            name: name.to_string(),
        })
    }

    /// Signal the loop to exit and wait for it
    pub fn stop(&mut self) {
        self.active.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            // dropped from its own thread once the source closed
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("[TRANSPORT] {} panicked", self.name);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::Acquire)
            && self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }
}

impl Drop for ReceiveWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionInfo;
    use crate::router::test_support::{connect_client, connected_router};
    use devbus_protocol::{MessageBuffer, MessageHeader, Protocol, BROADCAST_CLIENT_ID};

    /// Yields queued results, then NotReady
    struct ScriptedSource {
        script: VecDeque<TransportResult<MessageContext>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<TransportResult<MessageContext>>) -> Self {
            Self {
                script: script.into(),
            }
        }
    }

    impl MessageSource for ScriptedSource {
        fn receive_message(&mut self, _timeout: Duration) -> TransportResult<MessageContext> {
            self.script.pop_front().unwrap_or(Err(TransportError::NotReady))
        }
    }

    fn unicast(peer: ConnectionInfo, src: u16, dst: u16, tag: u8) -> MessageContext {
        let mut message = MessageBuffer::new(MessageHeader::new(src, dst, Protocol::LOGGING, 1));
        message.set_payload(&[tag]).unwrap();
        MessageContext::new(peer, message)
    }

    #[test]
    fn test_busy_destination_retried_once() {
        let (router, transport) = connected_router();
        let sender_peer = transport.peer(1);
        let target_peer = transport.peer(2);
        let sender = connect_client(&router, &transport, sender_peer);
        let target = connect_client(&router, &transport, target_peer);
        transport.take_sent();

        let source = ScriptedSource::new(vec![Ok(unicast(sender_peer, sender, target, 7))]);
        let mut receive_loop = ReceiveLoop::new(source, Arc::clone(&router));

        transport.fail_next(TransportError::NotReady);
        assert_eq!(receive_loop.run_once().unwrap(), 1);
        assert_eq!(receive_loop.pending_retries(), 1);
        assert!(transport.take_sent().is_empty());

        // carried message is attempted again and dropped on a second NotReady
        transport.fail_next(TransportError::NotReady);
        assert_eq!(receive_loop.run_once().unwrap(), 1);
        assert_eq!(receive_loop.pending_retries(), 0);
        assert!(transport.take_sent().is_empty());
    }

    #[test]
    fn test_retry_delivered_in_order_before_new_messages() {
        let (router, transport) = connected_router();
        let sender_peer = transport.peer(1);
        let target_peer = transport.peer(2);
        let sender = connect_client(&router, &transport, sender_peer);
        let target = connect_client(&router, &transport, target_peer);
        transport.take_sent();

        let mut source = ScriptedSource::new(vec![Ok(unicast(sender_peer, sender, target, 1))]);
        source.script.push_back(Err(TransportError::NotReady));
        source
            .script
            .push_back(Ok(unicast(sender_peer, sender, target, 2)));
        let mut receive_loop = ReceiveLoop::new(source, Arc::clone(&router));

        transport.fail_next(TransportError::NotReady);
        receive_loop.run_once().unwrap();
        assert_eq!(receive_loop.run_once().unwrap(), 2);

        let tags: Vec<u8> = transport
            .take_sent()
            .into_iter()
            .map(|(_, m)| m.payload()[0])
            .collect();
        assert_eq!(tags, vec![1, 2]);
    }

    #[test]
    fn test_fatal_receive_error_after_routing_batch() {
        let (router, transport) = connected_router();
        let sender_peer = transport.peer(1);
        let target_peer = transport.peer(2);
        let sender = connect_client(&router, &transport, sender_peer);
        let target = connect_client(&router, &transport, target_peer);
        transport.take_sent();

        let source = ScriptedSource::new(vec![
            Ok(unicast(sender_peer, sender, target, 3)),
            Err(TransportError::ConnectionClosed),
        ]);
        let mut receive_loop = ReceiveLoop::new(source, Arc::clone(&router));
        assert!(matches!(
            receive_loop.run_once(),
            Err(TransportError::ConnectionClosed)
        ));
        assert_eq!(transport.take_sent().len(), 1);
    }

    #[test]
    fn test_unroutable_message_dropped() {
        let (router, transport) = connected_router();
        let peer = transport.peer(1);
        let source = ScriptedSource::new(vec![Ok(unicast(peer, BROADCAST_CLIENT_ID, 9, 0))]);
        let mut receive_loop = ReceiveLoop::new(source, router);
        assert_eq!(receive_loop.run_once().unwrap(), 1);
        assert_eq!(receive_loop.pending_retries(), 0);
    }

    #[test]
    fn test_worker_stops_on_request() {
        let (router, _transport) = connected_router();
        let mut worker =
            ReceiveWorker::spawn("test-receive", ScriptedSource::new(Vec::new()), router).unwrap();
        assert!(worker.is_running());
        worker.stop();
        assert!(!worker.is_running());
    }

    #[test]
    fn test_worker_exits_when_source_closes() {
        let (router, _transport) = connected_router();
        let source = ScriptedSource::new(vec![Err(TransportError::ConnectionClosed)]);
        let worker = ReceiveWorker::spawn("test-closed", source, router).unwrap();
        for _ in 0..100 {
            if !worker.is_running() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!worker.is_running());
    }
}
