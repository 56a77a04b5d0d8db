// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Local IPC transport over a Unix-domain stream socket
//!
//! The accept thread owns a `std::thread::scope`; every accepted connection
//! runs its own scoped receive loop, so `disable` returning means every
//! connection thread has been joined. Messages are framed by the header's
//! payload size.

use devbus_protocol::{MessageBuffer, MessageHeader, TransportHandle, HEADER_SIZE};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::ListenerTransport;
use crate::connection::{ConnectionInfo, MessageContext};
use crate::error::{TransportError, TransportResult};
use crate::router::{MessageSource, ReceiveLoop, RouterCore};

/// Default path of the local listener socket
pub const DEFAULT_PIPE_PATH: &str = "/tmp/com.devbus.listener";

/// Sleep between accept polls
const ACCEPT_POLL: Duration = Duration::from_millis(10);

const READ_CHUNK: usize = 4096;

struct PipeConnection {
    writer: Mutex<UnixStream>,
    alive: AtomicBool,
}

type ConnectionTable = RwLock<HashMap<u64, Arc<PipeConnection>>>;

struct Supervisor {
    active: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Local stream-socket transport
pub struct PipeTransport {
    path: PathBuf,
    connections: Arc<ConnectionTable>,
    supervisor: Mutex<Option<Supervisor>>,
    handle: AtomicU32,
}

impl PipeTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            connections: Arc::new(RwLock::new(HashMap::new())),
            supervisor: Mutex::new(None),
            handle: AtomicU32::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }
}

impl Default for PipeTransport {
    fn default() -> Self {
        Self::new(DEFAULT_PIPE_PATH)
    }
}

fn map_bind_error(path: &Path, error: io::Error) -> TransportError {
    match error.kind() {
        io::ErrorKind::AddrInUse
        | io::ErrorKind::AddrNotAvailable
        | io::ErrorKind::PermissionDenied => {
            TransportError::Unavailable(format!("{}: {}", path.display(), error))
        }
        _ => TransportError::Io(error),
    }
}

/// Bind the listener socket, reclaiming a path left behind by a dead process
fn bind_listener(path: &Path) -> TransportResult<UnixListener> {
    match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            if UnixStream::connect(path).is_ok() {
                return Err(TransportError::Unavailable(format!(
                    "{} is served by a running listener",
                    path.display()
                )));
            }
            warn!("[PIPE] Removing stale socket file {}", path.display());
            std::fs::remove_file(path).map_err(|e| map_bind_error(path, e))?;
            UnixListener::bind(path).map_err(|e| map_bind_error(path, e))
        }
        Err(e) => Err(map_bind_error(path, e)),
    }
}

/// Reads framed messages off one connection
///
/// Bytes of a partially received frame stay in `pending` across timeouts.
struct PipeSource {
    stream: UnixStream,
    connection: ConnectionInfo,
    pending: Vec<u8>,
    read_timeout: Option<Duration>,
}

impl PipeSource {
    fn take_frame(&mut self) -> TransportResult<Option<MessageBuffer>> {
        if self.pending.len() < HEADER_SIZE {
            return Ok(None);
        }
        let header = MessageHeader::decode(&self.pending[..HEADER_SIZE])?;
        let total = HEADER_SIZE + header.payload_size as usize;
        if self.pending.len() < total {
            return Ok(None);
        }
        let message = MessageBuffer::decode(&self.pending[..total])?;
        self.pending.drain(..total);
        Ok(Some(message))
    }
}

impl MessageSource for PipeSource {
    fn receive_message(&mut self, timeout: Duration) -> TransportResult<MessageContext> {
        loop {
            if let Some(message) = self.take_frame()? {
                return Ok(MessageContext::new(self.connection, message));
            }
            // the writer shares this socket, so it never goes nonblocking;
            // a zero timeout only drains what is already buffered
            if timeout.is_zero() {
                return Err(TransportError::NotReady);
            }
            if self.read_timeout != Some(timeout) {
                self.stream.set_read_timeout(Some(timeout))?;
                self.read_timeout = Some(timeout);
            }

            let mut chunk = [0u8; READ_CHUNK];
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(TransportError::ConnectionClosed),
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Err(TransportError::NotReady)
                }
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }
}

fn run_connection(
    stream: UnixStream,
    connection: ConnectionInfo,
    router: Arc<RouterCore>,
    active: &AtomicBool,
    connections: &ConnectionTable,
) {
    let id = connection.id().unwrap_or_default();
    let source = PipeSource {
        stream,
        connection,
        pending: Vec::new(),
        read_timeout: None,
    };
    let mut receive_loop = ReceiveLoop::new(source, Arc::clone(&router));
    match receive_loop.run(active) {
        Ok(()) => {}
        Err(TransportError::ConnectionClosed) => debug!("[PIPE] Connection {} closed", id),
        Err(e) => warn!("[PIPE] Connection {} failed: {}", id, e),
    }

    if let Some(entry) = connections.write().remove(&id) {
        entry.alive.store(false, Ordering::Release);
    }
    router.remove_connection(&connection);
}

fn accept_loop(
    listener: UnixListener,
    handle: TransportHandle,
    router: Arc<RouterCore>,
    active: &AtomicBool,
    connections: &ConnectionTable,
) {
    let mut next_id: u64 = 1;
    thread::scope(|scope| {
        while active.load(Ordering::Acquire) {
            let stream = match listener.accept() {
                Ok((stream, _)) => stream,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                    continue;
                }
                Err(e) => {
                    warn!("[PIPE] Accept failed: {}", e);
                    thread::sleep(ACCEPT_POLL);
                    continue;
                }
            };

            let id = next_id;
            next_id += 1;
            let writer = match stream.set_nonblocking(false).and_then(|_| stream.try_clone()) {
                Ok(writer) => writer,
                Err(e) => {
                    warn!("[PIPE] Failed to set up connection {}: {}", id, e);
                    continue;
                }
            };
            connections.write().insert(
                id,
                Arc::new(PipeConnection {
                    writer: Mutex::new(writer),
                    alive: AtomicBool::new(true),
                }),
            );

            let connection = ConnectionInfo::from_id(handle, id);
            let router = Arc::clone(&router);
            let spawned = thread::Builder::new()
                .name(format!("devbus-pipe-{}", id))
                .spawn_scoped(scope, move || {
                    run_connection(stream, connection, router, active, connections)
                });
            match spawned {
                Ok(_) => debug!("[PIPE] Accepted connection {}", id),
                Err(e) => {
                    error!("[PIPE] Failed to spawn connection thread: {}", e);
                    connections.write().remove(&id);
                }
            }
        }
        debug!("[PIPE] Accept loop exiting, joining connection threads");
    });
}

impl ListenerTransport for PipeTransport {
    fn enable(&self, router: &Arc<RouterCore>, handle: TransportHandle) -> TransportResult<()> {
        let mut supervisor = self.supervisor.lock();
        if supervisor.is_some() {
            return Err(TransportError::AlreadyRunning);
        }

        let listener = bind_listener(&self.path)?;
        listener.set_nonblocking(true)?;
        self.handle.store(handle, Ordering::Release);

        let active = Arc::new(AtomicBool::new(true));
        let thread_active = Arc::clone(&active);
        let connections = Arc::clone(&self.connections);
        let router = Arc::clone(router);
        let thread = thread::Builder::new()
            .name("devbus-pipe-accept".to_string())
            .spawn(move || accept_loop(listener, handle, router, &thread_active, &connections));

        match thread {
            Ok(thread) => {
                *supervisor = Some(Supervisor { active, thread });
                info!("[PIPE] Listening on {} (handle {})", self.path.display(), handle);
                Ok(())
            }
            Err(e) => {
                let _ = std::fs::remove_file(&self.path);
                Err(TransportError::Io(e))
            }
        }
    }

    fn disable(&self) -> TransportResult<()> {
        let supervisor = self.supervisor.lock().take();
        let Some(supervisor) = supervisor else {
            return Ok(());
        };

        supervisor.active.store(false, Ordering::Release);
        for connection in self.connections.read().values() {
            let _ = connection.writer.lock().shutdown(Shutdown::Both);
        }
        if supervisor.thread.join().is_err() {
            error!("[PIPE] Accept thread panicked");
        }
        self.connections.write().clear();

        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!("[PIPE] Could not remove {}: {}", self.path.display(), e);
        }
        info!("[PIPE] Closed {}", self.path.display());
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.supervisor.lock().is_some()
    }

    fn transmit_message(
        &self,
        connection: &ConnectionInfo,
        message: &MessageBuffer,
    ) -> TransportResult<()> {
        let id = connection
            .id()
            .ok_or(TransportError::NoRoute(message.header.dst_client_id))?;
        let entry = self
            .connections
            .read()
            .get(&id)
            .cloned()
            .ok_or(TransportError::ConnectionClosed)?;
        if !entry.alive.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }

        let bytes = message.encode();
        let mut writer = entry.writer.lock();
        if let Err(e) = writer.write_all(&bytes) {
            debug!("[PIPE] Write to connection {} failed: {}", id, e);
            entry.alive.store(false, Ordering::Release);
            let _ = writer.shutdown(Shutdown::Both);
            return Err(TransportError::ConnectionClosed);
        }
        Ok(())
    }

    fn transmit_broadcast_message(&self, _message: &MessageBuffer) -> TransportResult<()> {
        Err(TransportError::Unavailable(
            "pipe transport does not forward broadcasts".to_string(),
        ))
    }

    fn transport_name(&self) -> &str {
        "pipe"
    }
}

impl Drop for PipeTransport {
    fn drop(&mut self) {
        let _ = self.disable();
    }
}
