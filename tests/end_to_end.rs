// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

/*!
End-to-end test of a configured listener.

Tests:
1. Write devbus_configuration.toml and load it
2. Start a listener from the loaded configuration
3. Connect tools over UDP (and the local pipe on Unix)
4. Exchange messages, enable bus logging, then shut down
*/

use devbus::config::{load_config, DevbusConfig};
use devbus::prelude::*;
use devbus::protocol::{
    ConnectRequestPayload, ConnectResponsePayload, LogMessagePayload, LoggingMessage,
    ManagementMessage, MAX_MESSAGE_SIZE,
};
use std::fs;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(3);

struct Tool {
    socket: UdpSocket,
    listener: SocketAddr,
    id: ClientId,
}

impl Tool {
    fn connect(listener: SocketAddr) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut tool = Self {
            socket,
            listener,
            id: 0,
        };
        tool.send(&ConnectRequestPayload::new(Component::Tool, StatusFlags::NONE).to_message());
        let response = tool
            .wait_for(
                Protocol::CLIENT_MANAGEMENT,
                ManagementMessage::ConnectResponse as u8,
                WAIT,
            )
            .expect("no ConnectResponse");
        let response = ConnectResponsePayload::decode(response.payload()).unwrap();
        assert!(response.result.is_success());
        tool.id = response.client_id;
        tool
    }

    fn send(&self, message: &MessageBuffer) {
        self.socket.send_to(&message.encode(), self.listener).unwrap();
    }

    fn wait_for(&self, protocol: Protocol, message_id: u8, timeout: Duration) -> Option<MessageBuffer> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        while Instant::now() < deadline {
            self.socket
                .set_read_timeout(Some(Duration::from_millis(50)))
                .unwrap();
            match self.socket.recv_from(&mut buf) {
                Ok((len, _)) => {
                    let message = MessageBuffer::decode(&buf[..len]).unwrap();
                    if message.header.protocol == protocol
                        && message.header.message_id == message_id
                    {
                        return Some(message);
                    }
                }
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                Err(e) => panic!("receive failed: {}", e),
            }
        }
        None
    }
}

fn free_addr() -> SocketAddr {
    UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap()
}

fn write_config(dir: &tempfile::TempDir, remote: SocketAddr) -> DevbusConfig {
    let local_path = dir.path().join("devbus.sock");
    let path = dir.path().join("devbus_configuration.toml");
    fs::write(
        &path,
        format!(
            r#"
            [listener]
            description = "end-to-end listener"

            [transports]
            local_enabled = {local}
            local_path = {path:?}
            remote_addresses = ["{remote}"]

            [router]
            ping_interval_ms = 30000
            "#,
            local = cfg!(unix),
            path = local_path,
            remote = remote,
        ),
    )
    .unwrap();
    load_config(Some(path.as_path()), None).unwrap()
}

#[test]
fn test_configured_listener_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let remote = free_addr();
    let config = write_config(&dir, remote);
    assert_eq!(config.listener.description, "end-to-end listener");
    assert_eq!(config.router.ping_interval_ms, 30000);

    let listener = ListenerCore::new();
    listener.initialize(&ListenerCreateInfo::from(&config)).unwrap();
    assert_eq!(listener.state(), ListenerState::Started);

    let profiler = Tool::connect(remote);
    let debugger = Tool::connect(remote);

    let mut capture = MessageBuffer::new(MessageHeader::new(
        profiler.id,
        debugger.id,
        Protocol::RGP,
        2,
    ));
    capture.set_payload(b"trace 1").unwrap();
    profiler.send(&capture);
    let received = debugger.wait_for(Protocol::RGP, 2, WAIT).expect("capture not routed");
    assert_eq!(received.payload(), b"trace 1");

    // bus logging, enabled by the debugger
    let channel_id = listener
        .connected_clients()
        .into_iter()
        .map(|c| c.client_id)
        .find(|id| *id != profiler.id && *id != debugger.id)
        .expect("message channel is not connected");
    let mut enable = MessageBuffer::new(MessageHeader::new(
        debugger.id,
        channel_id,
        Protocol::LOGGING,
        LoggingMessage::Enable as u8,
    ));
    enable.set_payload(&[LogLevel::Info as u8]).unwrap();
    debugger.send(&enable);

    let sink = listener.log_sink().expect("logging server not running");
    let deadline = Instant::now() + WAIT;
    let line = loop {
        sink.log(LogLevel::Info, 3, "capture complete");
        let short = Duration::from_millis(100);
        if let Some(message) = debugger.wait_for(Protocol::LOGGING, LoggingMessage::LogMessage as u8, short) {
            break LogMessagePayload::decode(message.payload()).unwrap();
        }
        assert!(Instant::now() < deadline, "no log line arrived");
    };
    assert_eq!(line.text, "capture complete");

    #[cfg(unix)]
    {
        use std::io::Write;
        let local_path = std::path::Path::new(&config.transports.local_path);
        let mut stream = std::os::unix::net::UnixStream::connect(local_path).unwrap();
        stream
            .write_all(&ConnectRequestPayload::new(Component::Driver, StatusFlags::NONE).to_message().encode())
            .unwrap();
        let driver_connected = debugger.wait_for(
            Protocol::SYSTEM,
            devbus::protocol::SystemMessage::ClientConnected as u8,
            WAIT,
        );
        assert!(driver_connected.is_some());
    }

    listener.destroy();
    assert_eq!(listener.state(), ListenerState::Uninitialized);
    UdpSocket::bind(remote).expect("remote port still bound");
}
