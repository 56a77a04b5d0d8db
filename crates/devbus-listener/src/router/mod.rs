// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Router: client/transport tables, system protocol handling, liveness,
//! and the receive-side fast path.

mod cache;
mod context;
mod core;
mod receive;
#[cfg(test)]
pub(crate) mod test_support;

pub use self::cache::RoutingCache;
pub use self::context::{ClientContext, ClientInfo};
pub use self::core::{Disposition, RouterCore};
pub use self::receive::{MessageSource, ReceiveLoop, ReceiveWorker};

use devbus_config::RouterConfig;
use std::time::Duration;

/// Default interval between liveness sweeps
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(1000);

/// Default number of missed pongs tolerated before eviction
pub const DEFAULT_CLIENT_TIMEOUT_COUNT: u32 = 3;

/// Default wait of the processing thread for queued messages
pub const DEFAULT_QUEUE_WAIT: Duration = Duration::from_millis(10);

/// Default poll timeout of transport receive loops
pub const RECEIVE_DELAY: Duration = Duration::from_millis(10);

/// Default time a router response keeps retrying a busy transport
pub const DEFAULT_TRANSMIT_RETRY_TIMEOUT: Duration = Duration::from_millis(100);

/// Shortest wait used by the processing thread and receive loops
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Router timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterSettings {
    pub ping_interval: Duration,
    pub client_timeout_count: u32,
    pub queue_wait: Duration,
    pub receive_delay: Duration,
    pub transmit_retry_timeout: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            client_timeout_count: DEFAULT_CLIENT_TIMEOUT_COUNT,
            queue_wait: DEFAULT_QUEUE_WAIT,
            receive_delay: RECEIVE_DELAY,
            transmit_retry_timeout: DEFAULT_TRANSMIT_RETRY_TIMEOUT,
        }
    }
}

impl RouterSettings {
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_client_timeout_count(mut self, count: u32) -> Self {
        self.client_timeout_count = count;
        self
    }

    pub fn with_receive_delay(mut self, delay: Duration) -> Self {
        self.receive_delay = delay;
        self
    }

    /// Raise zero waits to [`MIN_POLL_INTERVAL`]
    ///
    /// A zero receive delay never blocks on a read, so a stream source would
    /// only see bytes that were already buffered.
    pub fn normalized(mut self) -> Self {
        self.queue_wait = self.queue_wait.max(MIN_POLL_INTERVAL);
        self.receive_delay = self.receive_delay.max(MIN_POLL_INTERVAL);
        self
    }
}

impl From<&RouterConfig> for RouterSettings {
    fn from(config: &RouterConfig) -> Self {
        Self {
            ping_interval: config.ping_interval(),
            client_timeout_count: config.client_timeout_count,
            queue_wait: config.queue_wait(),
            receive_delay: config.receive_delay(),
            ..Default::default()
        }
        .normalized()
    }
}
