// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Teardown with clients still attached

mod common;

use common::{free_udp_addrs, UdpClient, WireClient};
use devbus_listener::{ListenerCore, ListenerCreateInfo, ListenerState};
use std::net::UdpSocket;
use std::time::{Duration, Instant};

fn create_info() -> ListenerCreateInfo {
    ListenerCreateInfo {
        description: "shutdown test".to_string(),
        local_enabled: false,
        remote_addresses: free_udp_addrs(2),
        ..Default::default()
    }
}

#[test]
fn test_destroy_with_connected_clients() {
    let info = create_info();
    let listener = ListenerCore::new();
    listener.initialize(&info).unwrap();

    let mut tools: Vec<UdpClient> = info
        .remote_addresses
        .iter()
        .map(|addr| UdpClient::new(*addr))
        .collect();
    for tool in &mut tools {
        tool.connect();
    }
    // the message channel plus both tools
    assert_eq!(listener.connected_clients().len(), 3);

    let started = Instant::now();
    listener.destroy();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(listener.state(), ListenerState::Uninitialized);

    for addr in &info.remote_addresses {
        UdpSocket::bind(addr).expect("port still held after destroy");
    }
}

#[test]
fn test_drop_while_started() {
    let info = create_info();
    {
        let listener = ListenerCore::new();
        listener.initialize(&info).unwrap();
        UdpClient::new(info.remote_addresses[0]).connect();
    }
    for addr in &info.remote_addresses {
        UdpSocket::bind(addr).expect("port still held after drop");
    }
}

#[cfg(unix)]
#[test]
fn test_reinitialize_after_destroy() {
    let dir = tempfile::tempdir().unwrap();
    let info = ListenerCreateInfo {
        local_enabled: true,
        local_path: dir.path().join("devbus.sock"),
        ..create_info()
    };
    let listener = ListenerCore::new();
    for _ in 0..3 {
        listener.initialize(&info).unwrap();
        assert_eq!(listener.router().unwrap().transport_count(), 4);
        listener.destroy();
        assert!(!info.local_path.exists());
    }
}
