// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Standalone devbus listener.
//!
//! Loads `devbus_configuration.toml` (plus `DEVBUS_*` and command-line
//! overrides), starts a listener and reports the connected clients until
//! Ctrl-C.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{CommandFactory, FromArgMatches, Parser};
use serde::Serialize;
use tracing::{info, warn};

use devbus::config::load_config_or_default;
use devbus::listener::{ClientInfo, ListenerCore, ListenerCreateInfo};
use devbus::observability::{debug_flags_help, init_logging, CrateDebugFlags, LogSettings};
use devbus::protocol::ClientId;

/// devbus listener - routes messages between developer tools and their targets
#[derive(Parser, Debug)]
#[command(name = "devbus-listener", version, author, long_about = None)]
struct Args {
    /// Path to devbus_configuration.toml (searched for when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Description reported to tools querying the listener
    #[arg(long)]
    description: Option<String>,

    /// UDP address to listen on (repeatable)
    #[arg(long = "remote", value_name = "ADDR")]
    remote: Vec<String>,

    /// Path of the local pipe
    #[arg(long)]
    local_path: Option<String>,

    /// Do not open the local pipe
    #[arg(long, default_value_t = false)]
    no_local: bool,

    /// Do not register the in-process host client
    #[arg(long, default_value_t = false)]
    no_host_client: bool,

    /// Interval between liveness sweeps
    #[arg(long)]
    ping_interval_ms: Option<u64>,

    /// Seconds between client list reports (0 = never)
    #[arg(long, default_value_t = 10)]
    status_interval_secs: u64,

    /// Print client list reports as JSON on stdout
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    /// Overrides in the key format understood by `devbus_config`
    fn overrides(&self) -> HashMap<String, String> {
        let mut overrides = HashMap::new();
        if let Some(description) = &self.description {
            overrides.insert("description".to_string(), description.clone());
        }
        if !self.remote.is_empty() {
            overrides.insert("remote_addresses".to_string(), self.remote.join(","));
        }
        if let Some(path) = &self.local_path {
            overrides.insert("local_path".to_string(), path.clone());
        }
        if self.no_local {
            overrides.insert("local_enabled".to_string(), "false".to_string());
        }
        if self.no_host_client {
            overrides.insert("host_client".to_string(), "false".to_string());
            overrides.insert("logging_server".to_string(), "false".to_string());
        }
        if let Some(interval) = self.ping_interval_ms {
            overrides.insert("ping_interval_ms".to_string(), interval.to_string());
        }
        if let Some(level) = &self.log_level {
            overrides.insert("log_level".to_string(), level.clone());
        }
        overrides
    }
}

#[derive(Serialize)]
struct StatusReport<'a> {
    description: &'a str,
    host_client_id: Option<ClientId>,
    uptime_secs: u64,
    clients: Vec<ClientInfo>,
}

fn main() -> Result<()> {
    // --debug-* flags are handled by devbus-observability, not clap
    let (debug_args, cli_args): (Vec<String>, Vec<String>) =
        env::args().partition(|arg| arg.starts_with("--debug-"));
    let matches = Args::command()
        .after_help(debug_flags_help())
        .get_matches_from(cli_args);
    let args = Args::from_arg_matches(&matches)?;

    let mut debug_flags = CrateDebugFlags::from_args(debug_args);
    if let Ok(value) = env::var("DEVBUS_DEBUG") {
        debug_flags.merge_env_value(&value);
    }

    let config = load_config_or_default(args.config.as_deref(), Some(&args.overrides()))
        .context("Failed to load devbus configuration")?;

    let log_settings = LogSettings {
        level: config.logging.level.clone(),
        file_logging: config.logging.file_logging,
        log_dir: config.logging.log_dir.clone(),
        retention_days: config.logging.retention_days,
        retention_runs: config.logging.retention_runs,
    };
    let _logging = init_logging(&debug_flags, &log_settings).context("Failed to initialize logging")?;

    let listener = ListenerCore::new();
    listener
        .initialize(&ListenerCreateInfo::from(&config))
        .context("Failed to start listener")?;
    info!(
        "Listener '{}' running (host client {:?})",
        config.listener.description,
        listener.host_client_id()
    );

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to install Ctrl-C handler")?;

    let started = Instant::now();
    let status_interval = Duration::from_secs(args.status_interval_secs);
    let mut last_report = Instant::now();
    while running.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(100));
        if status_interval.is_zero() || last_report.elapsed() < status_interval {
            continue;
        }
        last_report = Instant::now();

        let report = StatusReport {
            description: &config.listener.description,
            host_client_id: listener.host_client_id(),
            uptime_secs: started.elapsed().as_secs(),
            clients: listener.connected_clients(),
        };
        if args.json {
            match serde_json::to_string(&report) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Failed to serialize status report: {}", e),
            }
        } else {
            report_clients(&report.clients);
        }
    }

    info!("Shutdown signal received");
    listener.destroy();
    info!("Listener stopped");
    Ok(())
}

fn report_clients(clients: &[ClientInfo]) {
    info!("{} client(s) connected", clients.len());
    for client in clients {
        info!(
            "  {:>5}  {:<24} {:<32} pid {:<8} transport {}",
            client.client_id,
            client.name,
            client.description,
            client.process_id,
            client.transport
        );
    }
}
