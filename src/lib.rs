//! # devbus - developer-tool message bus
//!
//! devbus connects developer tools (profilers, debuggers, settings panels)
//! with the drivers and applications they inspect. A listener process runs a
//! router that assigns every participant a client id and forwards messages
//! between them over local pipes, UDP sockets and an in-process loopback.
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! devbus = "0.3"
//! ```
//!
//! ## Crates
//!
//! - **[`protocol`]**: message envelope, ids, payload codecs
//! - **[`config`]**: `devbus_configuration.toml` loading with env/CLI overrides
//! - **[`observability`]**: `tracing` subscriber setup and debug flags
//! - **[`listener`]**: transports, router, message channel, listener core
//!
//! ## Usage Examples
//!
//! ### Embedded listener
//!
//! ```rust,no_run
//! use devbus::prelude::*;
//!
//! let config = devbus::config::load_config_or_default(None, None)?;
//! let listener = ListenerCore::new();
//! listener.initialize(&ListenerCreateInfo::from(&config))?;
//!
//! if let Some(sink) = listener.log_sink() {
//!     sink.log(LogLevel::Info, 0, "listener up");
//! }
//! for client in listener.connected_clients() {
//!     println!("{:>5} {}", client.client_id, client.description);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Standalone
//!
//! ```bash
//! devbus-listener --remote 0.0.0.0:27300 --status-interval-secs 5 --json
//! ```

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use devbus_config as config;
pub use devbus_listener as listener;
pub use devbus_observability as observability;
pub use devbus_protocol as protocol;

/// Commonly used types
pub mod prelude {
    pub use devbus_config::DevbusConfig;
    pub use devbus_listener::{
        ClientInfo, ListenerCore, ListenerCreateInfo, ListenerState, LogSink, MessageChannel,
        ProtocolServer, RouterCore, RouterSettings,
    };
    pub use devbus_protocol::{
        ClientId, Component, LogLevel, MessageBuffer, MessageHeader, Protocol, ResultCode,
        StatusFlags,
    };
}
