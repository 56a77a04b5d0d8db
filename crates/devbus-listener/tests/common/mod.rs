// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Wire-level tool clients shared by the integration tests

#![allow(dead_code, unused_imports)]

use devbus_protocol::{
    ClientId, Component, ConnectRequestPayload, ConnectResponsePayload, ManagementMessage,
    MessageBuffer, MessageHeader, Protocol, StatusFlags, SystemMessage, HEADER_SIZE,
    MAX_MESSAGE_SIZE,
};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

pub const WAIT: Duration = Duration::from_secs(3);

/// Anything that can exchange whole messages with the listener
pub trait WireClient {
    fn send(&mut self, message: &MessageBuffer);

    fn recv(&mut self, timeout: Duration) -> Option<MessageBuffer>;

    /// Wait for the next message of `protocol`/`message_id`, skipping others
    fn recv_matching(
        &mut self,
        protocol: Protocol,
        message_id: u8,
        timeout: Duration,
    ) -> Option<MessageBuffer> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let message = self.recv(remaining)?;
            if message.header.protocol == protocol && message.header.message_id == message_id {
                return Some(message);
            }
        }
    }

    /// Register as a tool and return the assigned id
    fn connect(&mut self) -> ClientId {
        let request = ConnectRequestPayload::new(Component::Tool, StatusFlags::NONE).to_message();
        self.send(&request);
        let response = self
            .recv_matching(
                Protocol::CLIENT_MANAGEMENT,
                ManagementMessage::ConnectResponse as u8,
                WAIT,
            )
            .expect("no ConnectResponse");
        let response = ConnectResponsePayload::decode(response.payload()).unwrap();
        assert!(response.result.is_success(), "{:?}", response.result);
        response.client_id
    }

    /// Answer pings until `timeout` passes; returns everything else received
    fn answer_pings(&mut self, own_id: ClientId, timeout: Duration) -> Vec<MessageBuffer> {
        let deadline = Instant::now() + timeout;
        let mut others = Vec::new();
        while let Some(message) =
            self.recv(deadline.saturating_duration_since(Instant::now()))
        {
            if message.header.protocol == Protocol::SYSTEM
                && message.header.message_id == SystemMessage::Ping as u8
            {
                self.send(&SystemMessage::Pong.message(own_id, message.header.src_client_id));
            } else {
                others.push(message);
            }
            if Instant::now() >= deadline {
                break;
            }
        }
        others
    }
}

pub struct UdpClient {
    socket: UdpSocket,
    listener: SocketAddr,
}

impl UdpClient {
    pub fn new(listener: SocketAddr) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        Self { socket, listener }
    }
}

impl WireClient for UdpClient {
    fn send(&mut self, message: &MessageBuffer) {
        self.socket.send_to(&message.encode(), self.listener).unwrap();
    }

    fn recv(&mut self, timeout: Duration) -> Option<MessageBuffer> {
        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        self.socket
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))
            .unwrap();
        match self.socket.recv_from(&mut buf) {
            Ok((len, _)) => Some(MessageBuffer::decode(&buf[..len]).unwrap()),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                None
            }
            Err(e) => panic!("udp receive failed: {}", e),
        }
    }
}

#[cfg(unix)]
pub struct PipeClient {
    stream: std::os::unix::net::UnixStream,
}

#[cfg(unix)]
impl PipeClient {
    pub fn connect_to(path: &std::path::Path) -> Self {
        Self {
            stream: std::os::unix::net::UnixStream::connect(path).unwrap(),
        }
    }
}

#[cfg(unix)]
impl WireClient for PipeClient {
    fn send(&mut self, message: &MessageBuffer) {
        self.stream.write_all(&message.encode()).unwrap();
    }

    fn recv(&mut self, timeout: Duration) -> Option<MessageBuffer> {
        self.stream
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))
            .unwrap();
        let mut header = [0u8; HEADER_SIZE];
        match self.stream.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return None
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return None,
            Err(e) => panic!("pipe receive failed: {}", e),
        }
        let decoded = MessageHeader::decode(&header).unwrap();
        let mut frame = header.to_vec();
        frame.resize(HEADER_SIZE + decoded.payload_size as usize, 0);
        self.stream.set_read_timeout(Some(WAIT)).unwrap();
        self.stream.read_exact(&mut frame[HEADER_SIZE..]).unwrap();
        Some(MessageBuffer::decode(&frame).unwrap())
    }
}

/// An address on loopback that nothing is bound to right now
pub fn free_udp_addr() -> SocketAddr {
    UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap()
}

/// `count` distinct free loopback addresses
pub fn free_udp_addrs(count: usize) -> Vec<SocketAddr> {
    let held: Vec<UdpSocket> = (0..count)
        .map(|_| UdpSocket::bind("127.0.0.1:0").unwrap())
        .collect();
    held.iter().map(|s| s.local_addr().unwrap()).collect()
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
