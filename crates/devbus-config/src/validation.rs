//! Configuration validation
//!
//! Ensures values are within range and consistent with each other. All
//! problems are collected before reporting so a user sees every issue at once.

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::{ConfigError, ConfigResult, DevbusConfig};

/// Number of routable client ids (13-bit id space, broadcast excluded)
const CLIENT_ID_SPACE: usize = (1 << 13) - 1;

/// Validation errors that can occur during config validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValidationError {
    InvalidAddress { address: String, reason: String },
    DuplicateAddress { address: String },
    MissingRequired { field: String },
    InvalidValue { field: String, reason: String },
    NoTransports,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidAddress { address, reason } => {
                write!(f, "Invalid remote address '{}': {}", address, reason)
            }
            Self::DuplicateAddress { address } => {
                write!(f, "Remote address {} is configured more than once", address)
            }
            Self::MissingRequired { field } => {
                write!(f, "Missing required configuration: {}", field)
            }
            Self::InvalidValue { field, reason } => {
                write!(f, "Invalid configuration value for {}: {}", field, reason)
            }
            Self::NoTransports => write!(
                f,
                "No transport enabled (host_client, local_enabled and remote_addresses are all off)"
            ),
        }
    }
}

/// Validate the complete configuration
///
/// # Errors
///
/// Returns `ConfigError::ValidationError` listing every problem found
pub fn validate_config(config: &DevbusConfig) -> ConfigResult<()> {
    let mut errors = Vec::new();

    validate_router(config, &mut errors);
    validate_transports(config, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        let message = errors
            .iter()
            .map(|e| format!("  - {}", e))
            .collect::<Vec<_>>()
            .join("\n");
        Err(ConfigError::ValidationError(format!(
            "Configuration has {} error(s):\n{}",
            errors.len(),
            message
        )))
    }
}

fn validate_router(config: &DevbusConfig, errors: &mut Vec<ConfigValidationError>) {
    let router = &config.router;

    if router.ping_interval_ms == 0 {
        errors.push(ConfigValidationError::InvalidValue {
            field: "router.ping_interval_ms".to_string(),
            reason: "must be greater than 0".to_string(),
        });
    }
    if router.client_timeout_count == 0 {
        errors.push(ConfigValidationError::InvalidValue {
            field: "router.client_timeout_count".to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    if router.queue_wait_ms == 0 {
        errors.push(ConfigValidationError::InvalidValue {
            field: "router.queue_wait_ms".to_string(),
            reason: "must be greater than 0".to_string(),
        });
    }
    if router.receive_delay_ms == 0 {
        errors.push(ConfigValidationError::InvalidValue {
            field: "router.receive_delay_ms".to_string(),
            reason: "must be greater than 0".to_string(),
        });
    }
    if router.queue_wait_ms > router.ping_interval_ms {
        errors.push(ConfigValidationError::InvalidValue {
            field: "router.queue_wait_ms".to_string(),
            reason: format!(
                "{} exceeds the ping interval of {} ms",
                router.queue_wait_ms, router.ping_interval_ms
            ),
        });
    }
    if router.max_clients == 0 || router.max_clients > CLIENT_ID_SPACE {
        errors.push(ConfigValidationError::InvalidValue {
            field: "router.max_clients".to_string(),
            reason: format!("must be between 1 and {}", CLIENT_ID_SPACE),
        });
    }
}

fn validate_transports(config: &DevbusConfig, errors: &mut Vec<ConfigValidationError>) {
    let transports = &config.transports;

    if !config.listener.host_client
        && !transports.local_enabled
        && transports.remote_addresses.is_empty()
    {
        errors.push(ConfigValidationError::NoTransports);
    }

    if transports.local_enabled && transports.local_path.trim().is_empty() {
        errors.push(ConfigValidationError::MissingRequired {
            field: "transports.local_path".to_string(),
        });
    }

    let mut seen = HashSet::new();
    for address in &transports.remote_addresses {
        match address.parse::<SocketAddr>() {
            Ok(parsed) => {
                if !seen.insert(parsed) {
                    errors.push(ConfigValidationError::DuplicateAddress {
                        address: address.clone(),
                    });
                }
            }
            Err(e) => errors.push(ConfigValidationError::InvalidAddress {
                address: address.clone(),
                reason: e.to_string(),
            }),
        }
    }
}
