// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # devbus-observability
//!
//! Logging setup shared by devbus binaries and tests, with per-crate debug
//! flag support.
//!
//! ## Features
//! - `file-logging`: rolling log files per run (desktop only)

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod cli;
pub mod config;
pub mod init;

pub use cli::*;
pub use config::*;
pub use init::*;

/// Known devbus crate names for debug flags
pub const KNOWN_CRATES: &[&str] = &[
    "devbus",
    "devbus-config",
    "devbus-listener",
    "devbus-protocol",
];
