// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Datagram socket transport
//!
//! One datagram carries exactly one encoded message. Peers are identified by
//! their source address, which is packed into the [`ConnectionInfo`] bytes:
//!
//! ```text
//! [4][ipv4: 4][port: 2]
//! [6][ipv6: 16][port: 2]
//! [1][path bytes]        (unix datagram peers)
//! ```
//!
//! A transport built with an upstream address is a forwarding transport:
//! broadcasts go to the upstream once instead of to every tracked peer.

use devbus_protocol::{MessageBuffer, TransportHandle, MAX_MESSAGE_SIZE};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
#[cfg(unix)]
use std::os::unix::net::UnixDatagram;
#[cfg(unix)]
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::ListenerTransport;
use crate::connection::{ConnectionInfo, MessageContext, CONNECTION_INFO_CAPACITY};
use crate::error::{TransportError, TransportResult};
use crate::router::{MessageSource, ReceiveWorker, RouterCore};

const TAG_V4: u8 = 4;
const TAG_V6: u8 = 6;
#[cfg(unix)]
const TAG_PATH: u8 = 1;

/// Address a socket transport binds to or forwards to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEndpoint {
    Udp(SocketAddr),
    #[cfg(unix)]
    Local(PathBuf),
}

impl fmt::Display for SocketEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketEndpoint::Udp(addr) => write!(f, "udp:{}", addr),
            #[cfg(unix)]
            SocketEndpoint::Local(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

impl From<SocketAddr> for SocketEndpoint {
    fn from(addr: SocketAddr) -> Self {
        SocketEndpoint::Udp(addr)
    }
}

/// Pack a peer address into connection bytes
pub(crate) fn encode_peer(handle: TransportHandle, peer: &SocketEndpoint) -> Option<ConnectionInfo> {
    let mut bytes = Vec::with_capacity(19);
    match peer {
        SocketEndpoint::Udp(SocketAddr::V4(addr)) => {
            bytes.push(TAG_V4);
            bytes.extend_from_slice(&addr.ip().octets());
            bytes.extend_from_slice(&addr.port().to_le_bytes());
        }
        SocketEndpoint::Udp(SocketAddr::V6(addr)) => {
            bytes.push(TAG_V6);
            bytes.extend_from_slice(&addr.ip().octets());
            bytes.extend_from_slice(&addr.port().to_le_bytes());
        }
        #[cfg(unix)]
        SocketEndpoint::Local(path) => {
            use std::os::unix::ffi::OsStrExt;
            let raw = path.as_os_str().as_bytes();
            if raw.len() + 1 > CONNECTION_INFO_CAPACITY {
                return None;
            }
            bytes.push(TAG_PATH);
            bytes.extend_from_slice(raw);
        }
    }
    ConnectionInfo::new(handle, &bytes)
}

/// Inverse of [`encode_peer`]
pub(crate) fn decode_peer(connection: &ConnectionInfo) -> Option<SocketEndpoint> {
    let bytes = connection.as_bytes();
    let (tag, rest) = bytes.split_first()?;
    match *tag {
        TAG_V4 if rest.len() == 6 => {
            let ip = Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3]);
            let port = u16::from_le_bytes([rest[4], rest[5]]);
            Some(SocketEndpoint::Udp(SocketAddr::new(IpAddr::V4(ip), port)))
        }
        TAG_V6 if rest.len() == 18 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&rest[..16]);
            let port = u16::from_le_bytes([rest[16], rest[17]]);
            Some(SocketEndpoint::Udp(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(octets)),
                port,
            )))
        }
        #[cfg(unix)]
        TAG_PATH if !rest.is_empty() => {
            use std::os::unix::ffi::OsStrExt;
            Some(SocketEndpoint::Local(PathBuf::from(std::ffi::OsStr::from_bytes(rest))))
        }
        _ => None,
    }
}

enum BoundSocket {
    Udp(UdpSocket),
    #[cfg(unix)]
    Local(UnixDatagram),
}

impl BoundSocket {
    fn bind(endpoint: &SocketEndpoint) -> io::Result<Self> {
        match endpoint {
            SocketEndpoint::Udp(addr) => UdpSocket::bind(addr).map(BoundSocket::Udp),
            #[cfg(unix)]
            SocketEndpoint::Local(path) => bind_local(path).map(BoundSocket::Local),
        }
    }

    fn send_to(&self, bytes: &[u8], peer: &SocketEndpoint) -> io::Result<usize> {
        match (self, peer) {
            (BoundSocket::Udp(socket), SocketEndpoint::Udp(addr)) => socket.send_to(bytes, addr),
            #[cfg(unix)]
            (BoundSocket::Local(socket), SocketEndpoint::Local(path)) => {
                socket.send_to(bytes, path)
            }
            #[cfg(unix)]
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "peer address family does not match socket",
            )),
        }
    }

    fn recv_from(&self, buffer: &mut [u8]) -> io::Result<(usize, Option<SocketEndpoint>)> {
        match self {
            BoundSocket::Udp(socket) => socket
                .recv_from(buffer)
                .map(|(n, addr)| (n, Some(SocketEndpoint::Udp(addr)))),
            #[cfg(unix)]
            BoundSocket::Local(socket) => socket.recv_from(buffer).map(|(n, addr)| {
                (
                    n,
                    addr.as_pathname()
                        .map(|p| SocketEndpoint::Local(p.to_path_buf())),
                )
            }),
        }
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            BoundSocket::Udp(socket) => socket.set_nonblocking(nonblocking),
            #[cfg(unix)]
            BoundSocket::Local(socket) => socket.set_nonblocking(nonblocking),
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            BoundSocket::Udp(socket) => socket.set_read_timeout(timeout),
            #[cfg(unix)]
            BoundSocket::Local(socket) => socket.set_read_timeout(timeout),
        }
    }

    fn local_addr(&self) -> Option<SocketEndpoint> {
        match self {
            BoundSocket::Udp(socket) => socket.local_addr().ok().map(SocketEndpoint::Udp),
            #[cfg(unix)]
            BoundSocket::Local(socket) => socket
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| SocketEndpoint::Local(p.to_path_buf()))),
        }
    }
}

/// Bind a unix datagram socket, reclaiming the path from a dead owner
#[cfg(unix)]
fn bind_local(path: &Path) -> io::Result<UnixDatagram> {
    match UnixDatagram::bind(path) {
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            let probe = UnixDatagram::unbound()?;
            if probe.connect(path).is_ok() {
                return Err(e);
            }
            warn!("[SOCKET] Removing stale socket file {}", path.display());
            std::fs::remove_file(path)?;
            UnixDatagram::bind(path)
        }
        other => other,
    }
}

fn map_bind_error(endpoint: &SocketEndpoint, error: io::Error) -> TransportError {
    match error.kind() {
        io::ErrorKind::AddrInUse
        | io::ErrorKind::AddrNotAvailable
        | io::ErrorKind::PermissionDenied => {
            TransportError::Unavailable(format!("{}: {}", endpoint, error))
        }
        _ => TransportError::Io(error),
    }
}

fn map_io_error(error: io::Error) -> TransportError {
    match error.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
            TransportError::NotReady
        }
        // ICMP port unreachable from an earlier send surfaces on the next call
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused => {
            TransportError::NotReady
        }
        _ => TransportError::Io(error),
    }
}

/// Datagram listener transport
pub struct SocketTransport {
    name: String,
    endpoint: SocketEndpoint,
    upstream: Option<SocketEndpoint>,
    socket: RwLock<Option<Arc<BoundSocket>>>,
    worker: Mutex<Option<ReceiveWorker>>,
    handle: AtomicU32,
}

impl SocketTransport {
    pub fn new(endpoint: SocketEndpoint) -> Self {
        Self {
            name: endpoint.to_string(),
            endpoint,
            upstream: None,
            socket: RwLock::new(None),
            worker: Mutex::new(None),
            handle: AtomicU32::new(0),
        }
    }

    pub fn udp(addr: SocketAddr) -> Self {
        Self::new(SocketEndpoint::Udp(addr))
    }

    #[cfg(unix)]
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::new(SocketEndpoint::Local(path.into()))
    }

    /// Forward broadcasts to `upstream`
    pub fn with_upstream(mut self, upstream: SocketEndpoint) -> Self {
        self.name = format!("{} -> {}", self.endpoint, upstream);
        self.upstream = Some(upstream);
        self
    }

    pub fn endpoint(&self) -> &SocketEndpoint {
        &self.endpoint
    }

    /// Address actually bound (resolves port 0), while enabled
    pub fn local_endpoint(&self) -> Option<SocketEndpoint> {
        self.socket.read().as_ref().and_then(|s| s.local_addr())
    }

    fn send(&self, peer: &SocketEndpoint, message: &MessageBuffer) -> TransportResult<()> {
        let socket = self
            .socket
            .read()
            .as_ref()
            .map(Arc::clone)
            .ok_or(TransportError::NotRunning)?;
        let bytes = message.encode();
        let sent = socket.send_to(&bytes, peer).map_err(map_io_error)?;
        if sent != bytes.len() {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                "datagram truncated",
            )));
        }
        Ok(())
    }
}

struct SocketSource {
    socket: Arc<BoundSocket>,
    handle: TransportHandle,
    buffer: Vec<u8>,
    nonblocking: bool,
    read_timeout: Option<Duration>,
}

impl SocketSource {
    fn prepare(&mut self, timeout: Duration) -> io::Result<()> {
        let nonblocking = timeout.is_zero();
        if nonblocking != self.nonblocking {
            self.socket.set_nonblocking(nonblocking)?;
            self.nonblocking = nonblocking;
        }
        if !nonblocking && self.read_timeout != Some(timeout) {
            self.socket.set_read_timeout(Some(timeout))?;
            self.read_timeout = Some(timeout);
        }
        Ok(())
    }
}

impl MessageSource for SocketSource {
    fn receive_message(&mut self, timeout: Duration) -> TransportResult<MessageContext> {
        self.prepare(timeout)?;
        let (size, peer) = self.socket.recv_from(&mut self.buffer).map_err(map_io_error)?;

        let Some(peer) = peer else {
            warn!("[SOCKET] Ignoring datagram from unnamed peer");
            return Err(TransportError::NotReady);
        };
        let Some(connection) = encode_peer(self.handle, &peer) else {
            warn!("[SOCKET] Peer address {} does not fit connection info", peer);
            return Err(TransportError::NotReady);
        };
        match MessageBuffer::decode(&self.buffer[..size]) {
            Ok(message) => Ok(MessageContext::new(connection, message)),
            Err(e) => {
                debug!("[SOCKET] Discarding malformed datagram from {}: {}", peer, e);
                Err(TransportError::NotReady)
            }
        }
    }
}

impl ListenerTransport for SocketTransport {
    fn enable(&self, router: &Arc<RouterCore>, handle: TransportHandle) -> TransportResult<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(TransportError::AlreadyRunning);
        }

        let socket = Arc::new(
            BoundSocket::bind(&self.endpoint).map_err(|e| map_bind_error(&self.endpoint, e))?,
        );
        self.handle.store(handle, Ordering::Release);

        let source = SocketSource {
            socket: Arc::clone(&socket),
            handle,
            buffer: vec![0u8; MAX_MESSAGE_SIZE],
            nonblocking: false,
            read_timeout: None,
        };
        *self.socket.write() = Some(socket);
        match ReceiveWorker::spawn("devbus-socket-rx", source, Arc::clone(router)) {
            Ok(spawned) => *worker = Some(spawned),
            Err(e) => {
                self.socket.write().take();
                return Err(e);
            }
        }

        info!(
            "[SOCKET] Listening on {} (handle {})",
            self.local_endpoint()
                .map(|e| e.to_string())
                .unwrap_or_else(|| self.endpoint.to_string()),
            handle
        );
        Ok(())
    }

    fn disable(&self) -> TransportResult<()> {
        let worker = self.worker.lock().take();
        let Some(mut worker) = worker else {
            return Ok(());
        };
        worker.stop();
        self.socket.write().take();

        #[cfg(unix)]
        if let SocketEndpoint::Local(path) = &self.endpoint {
            if let Err(e) = std::fs::remove_file(path) {
                debug!("[SOCKET] Could not remove {}: {}", path.display(), e);
            }
        }
        info!("[SOCKET] Closed {}", self.endpoint);
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.socket.read().is_some()
    }

    fn transmit_message(
        &self,
        connection: &ConnectionInfo,
        message: &MessageBuffer,
    ) -> TransportResult<()> {
        let peer = decode_peer(connection)
            .ok_or(TransportError::NoRoute(message.header.dst_client_id))?;
        self.send(&peer, message)
    }

    fn transmit_broadcast_message(&self, message: &MessageBuffer) -> TransportResult<()> {
        match &self.upstream {
            Some(upstream) => self.send(upstream, message),
            None => Err(TransportError::Unavailable(format!(
                "{} has no upstream",
                self.name
            ))),
        }
    }

    fn forwarding_connection(&self) -> bool {
        self.upstream.is_some()
    }

    fn transport_name(&self) -> &str {
        &self.name
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        let _ = self.disable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_encoding() {
        let v4: SocketEndpoint = "127.0.0.1:27300".parse::<SocketAddr>().unwrap().into();
        let info = encode_peer(3, &v4).unwrap();
        assert_eq!(info.as_bytes()[0], TAG_V4);
        assert_eq!(info.as_bytes().len(), 7);
        assert_eq!(decode_peer(&info), Some(v4));

        let v6: SocketEndpoint = "[::1]:9000".parse::<SocketAddr>().unwrap().into();
        let info = encode_peer(3, &v6).unwrap();
        assert_eq!(decode_peer(&info), Some(v6));

        assert_eq!(decode_peer(&ConnectionInfo::new(3, &[9, 1]).unwrap()), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_path_peer_encoding() {
        let peer = SocketEndpoint::Local(PathBuf::from("/tmp/devbus-peer"));
        let info = encode_peer(1, &peer).unwrap();
        assert_eq!(decode_peer(&info), Some(peer));

        let long = SocketEndpoint::Local(PathBuf::from("x".repeat(CONNECTION_INFO_CAPACITY)));
        assert!(encode_peer(1, &long).is_none());
    }

    #[test]
    fn test_bind_conflict_is_unavailable() {
        let taken = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();
        let endpoint = SocketEndpoint::Udp(addr);
        let error = BoundSocket::bind(&endpoint)
            .map(|_| ())
            .map_err(|e| map_bind_error(&endpoint, e))
            .unwrap_err();
        assert!(matches!(error, TransportError::Unavailable(_)));
    }

    #[test]
    fn test_broadcast_requires_upstream() {
        let plain = SocketTransport::udp("127.0.0.1:0".parse().unwrap());
        assert!(!plain.forwarding_connection());
        assert!(matches!(
            plain.transmit_broadcast_message(&devbus_protocol::out_of_band_message()),
            Err(TransportError::Unavailable(_))
        ));

        let forwarding = SocketTransport::udp("127.0.0.1:0".parse().unwrap())
            .with_upstream(SocketEndpoint::Udp("127.0.0.1:9".parse().unwrap()));
        assert!(forwarding.forwarding_connection());
        // not enabled yet
        assert!(matches!(
            forwarding.transmit_broadcast_message(&devbus_protocol::out_of_band_message()),
            Err(TransportError::NotRunning)
        ));
    }

    #[test]
    fn test_timeouts_are_not_ready() {
        assert!(map_io_error(io::ErrorKind::WouldBlock.into()).is_not_ready());
        assert!(map_io_error(io::ErrorKind::TimedOut.into()).is_not_ready());
        assert!(map_io_error(io::ErrorKind::BrokenPipe.into()).is_fatal());
    }
}
