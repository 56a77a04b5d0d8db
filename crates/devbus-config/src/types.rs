// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration type definitions
//!
//! Each struct maps to one section of `devbus_configuration.toml`. Every
//! field has a default so a partial file (or no file at all) is valid.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DevbusConfig {
    pub listener: ListenerConfig,
    pub transports: TransportsConfig,
    pub router: RouterConfig,
    pub logging: LoggingConfig,
}

/// Listener-level configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Description reported in the host's client info
    pub description: String,
    /// Register the in-process host transport
    pub host_client: bool,
    /// Start the logging server on the host transport
    pub logging_server: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            description: "devbus listener".to_string(),
            host_client: true,
            logging_server: true,
        }
    }
}

/// Transport endpoints
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportsConfig {
    /// Bind the local pipe transport
    pub local_enabled: bool,
    /// Well-known path of the local pipe
    pub local_path: String,
    /// UDP bind addresses (`host:port`), one transport each
    pub remote_addresses: Vec<String>,
}

impl Default for TransportsConfig {
    fn default() -> Self {
        Self {
            local_enabled: true,
            local_path: "/tmp/com.devbus.listener".to_string(),
            remote_addresses: Vec::new(),
        }
    }
}

/// Router timing and limits
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Interval between liveness sweeps
    pub ping_interval_ms: u64,
    /// Missed pongs tolerated before a client is evicted
    pub client_timeout_count: u32,
    /// Maximum wait of the processing thread for queued messages
    pub queue_wait_ms: u64,
    /// Poll timeout of transport receive loops
    pub receive_delay_ms: u64,
    /// Upper bound on concurrently registered clients
    pub max_clients: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 1000,
            client_timeout_count: 3,
            queue_wait_ms: 10,
            receive_delay_ms: 10,
            max_clients: 1024,
        }
    }
}

impl RouterConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn queue_wait(&self) -> Duration {
        Duration::from_millis(self.queue_wait_ms)
    }

    pub fn receive_delay(&self) -> Duration {
        Duration::from_millis(self.receive_delay_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter level (trace, debug, info, warn, error)
    pub level: String,
    /// Base directory for run logs
    pub log_dir: PathBuf,
    /// Write rolling log files in addition to the console
    pub file_logging: bool,
    pub retention_days: u64,
    pub retention_runs: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: PathBuf::from("./logs"),
            file_logging: false,
            retention_days: 30,
            retention_runs: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: DevbusConfig = toml::from_str(
            r#"
            [router]
            ping_interval_ms = 250

            [transports]
            remote_addresses = ["127.0.0.1:27300"]
            "#,
        )
        .unwrap();

        assert_eq!(config.router.ping_interval_ms, 250);
        assert_eq!(config.router.client_timeout_count, 3);
        assert_eq!(config.transports.remote_addresses, vec!["127.0.0.1:27300"]);
        assert!(config.transports.local_enabled);
        assert_eq!(config.listener, ListenerConfig::default());
    }

    #[test]
    fn test_durations() {
        let router = RouterConfig::default();
        assert_eq!(router.ping_interval(), Duration::from_secs(1));
        assert_eq!(router.queue_wait(), Duration::from_millis(10));
    }

    #[test]
    fn test_serializes_to_json() {
        let json = serde_json::to_value(DevbusConfig::default()).unwrap();
        assert_eq!(json["router"]["client_timeout_count"], 3);
    }
}
