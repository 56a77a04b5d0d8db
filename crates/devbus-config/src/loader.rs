// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration file loading with override support
//!
//! Three tiers, later ones win:
//! 1. TOML file (base values)
//! 2. Environment variables (runtime overrides)
//! 3. CLI arguments (explicit user overrides)

use crate::{validate_config, ConfigError, ConfigResult, DevbusConfig, CONFIG_FILE_NAME};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Find the devbus configuration file
///
/// Search order:
/// 1. `DEVBUS_CONFIG_PATH` environment variable
/// 2. Current working directory
/// 3. Parent directories (up to 5 levels)
///
/// # Errors
///
/// Returns `ConfigError::FileNotFound` if no config file is found in any location
pub fn find_config_file() -> ConfigResult<PathBuf> {
    if let Ok(env_path) = env::var("DEVBUS_CONFIG_PATH") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        return Err(ConfigError::FileNotFound(format!(
            "Config file specified by DEVBUS_CONFIG_PATH not found: {}",
            path.display()
        )));
    }

    let mut search_paths = Vec::new();
    if let Ok(cwd) = env::current_dir() {
        search_paths.push(cwd.join(CONFIG_FILE_NAME));
        let mut current = cwd.as_path();
        for _ in 0..5 {
            match current.parent() {
                Some(parent) => {
                    search_paths.push(parent.join(CONFIG_FILE_NAME));
                    current = parent;
                }
                None => break,
            }
        }
    }

    if let Some(found) = search_paths.iter().find(|p| p.exists()) {
        return Ok(found.clone());
    }

    let search_list = search_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    Err(ConfigError::FileNotFound(format!(
        "'{}' not found in any of these locations:\n{}\n\nSet DEVBUS_CONFIG_PATH to specify a custom location.",
        CONFIG_FILE_NAME, search_list
    )))
}

/// Load configuration from a TOML file
///
/// # Arguments
///
/// * `config_path` - Optional path to config file. If `None`, will search for config file.
/// * `cli_args` - Optional CLI argument overrides
///
/// # Errors
///
/// Returns error if config file is not found, contains invalid TOML, or fails validation
pub fn load_config(
    config_path: Option<&Path>,
    cli_args: Option<&HashMap<String, String>>,
) -> ConfigResult<DevbusConfig> {
    let config_file = match config_path {
        Some(path) => path.to_path_buf(),
        None => find_config_file()?,
    };

    let content = fs::read_to_string(&config_file)?;
    let mut config: DevbusConfig = toml::from_str(&content)?;

    apply_overrides(&mut config, cli_args)?;
    Ok(config)
}

/// Like [`load_config`], but a missing file yields the defaults
///
/// An explicitly given `config_path` must still exist.
pub fn load_config_or_default(
    config_path: Option<&Path>,
    cli_args: Option<&HashMap<String, String>>,
) -> ConfigResult<DevbusConfig> {
    if config_path.is_some() {
        return load_config(config_path, cli_args);
    }
    match find_config_file() {
        Ok(path) => load_config(Some(&path), cli_args),
        Err(ConfigError::FileNotFound(_)) => {
            let mut config = DevbusConfig::default();
            apply_overrides(&mut config, cli_args)?;
            Ok(config)
        }
        Err(e) => Err(e),
    }
}

fn apply_overrides(
    config: &mut DevbusConfig,
    cli_args: Option<&HashMap<String, String>>,
) -> ConfigResult<()> {
    apply_environment_overrides(config);
    if let Some(cli) = cli_args {
        apply_cli_overrides(config, cli);
    }
    validate_config(config)
}

fn parse_bool(value: &str) -> bool {
    let value = value.to_lowercase();
    value == "true" || value == "1" || value == "yes"
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Apply environment variable overrides to configuration
///
/// Supported environment variables:
/// - `DEVBUS_DESCRIPTION` -> `listener.description`
/// - `DEVBUS_HOST_CLIENT` -> `listener.host_client`
/// - `DEVBUS_LOGGING_SERVER` -> `listener.logging_server`
/// - `DEVBUS_LOCAL_ENABLED` -> `transports.local_enabled`
/// - `DEVBUS_LOCAL_PATH` -> `transports.local_path`
/// - `DEVBUS_REMOTE_ADDRESSES` -> `transports.remote_addresses` (comma separated)
/// - `DEVBUS_PING_INTERVAL_MS` -> `router.ping_interval_ms`
/// - `DEVBUS_CLIENT_TIMEOUT_COUNT` -> `router.client_timeout_count`
/// - `DEVBUS_MAX_CLIENTS` -> `router.max_clients`
/// - `DEVBUS_LOG_LEVEL` -> `logging.level`
/// - `DEVBUS_LOG_DIR` -> `logging.log_dir`
pub fn apply_environment_overrides(config: &mut DevbusConfig) {
    if let Ok(value) = env::var("DEVBUS_DESCRIPTION") {
        config.listener.description = value;
    }
    if let Ok(value) = env::var("DEVBUS_HOST_CLIENT") {
        config.listener.host_client = parse_bool(&value);
    }
    if let Ok(value) = env::var("DEVBUS_LOGGING_SERVER") {
        config.listener.logging_server = parse_bool(&value);
    }

    if let Ok(value) = env::var("DEVBUS_LOCAL_ENABLED") {
        config.transports.local_enabled = parse_bool(&value);
    }
    if let Ok(value) = env::var("DEVBUS_LOCAL_PATH") {
        config.transports.local_path = value;
    }
    if let Ok(value) = env::var("DEVBUS_REMOTE_ADDRESSES") {
        config.transports.remote_addresses = parse_list(&value);
    }

    if let Ok(value) = env::var("DEVBUS_PING_INTERVAL_MS") {
        if let Ok(interval) = value.parse::<u64>() {
            config.router.ping_interval_ms = interval;
        }
    }
    if let Ok(value) = env::var("DEVBUS_CLIENT_TIMEOUT_COUNT") {
        if let Ok(count) = value.parse::<u32>() {
            config.router.client_timeout_count = count;
        }
    }
    if let Ok(value) = env::var("DEVBUS_MAX_CLIENTS") {
        if let Ok(max) = value.parse::<usize>() {
            config.router.max_clients = max;
        }
    }

    if let Ok(value) = env::var("DEVBUS_LOG_LEVEL") {
        config.logging.level = value;
    }
    if let Ok(value) = env::var("DEVBUS_LOG_DIR") {
        config.logging.log_dir = PathBuf::from(value);
    }
}

/// Apply CLI argument overrides to configuration
///
/// # Arguments
///
/// * `config` - Configuration to modify
/// * `cli_args` - Map of CLI arguments (e.g., `{"local_path": "/tmp/bus", "ping_interval_ms": "500"}`)
pub fn apply_cli_overrides(config: &mut DevbusConfig, cli_args: &HashMap<String, String>) {
    if let Some(value) = cli_args.get("description") {
        config.listener.description = value.clone();
    }
    if let Some(value) = cli_args.get("host_client") {
        config.listener.host_client = parse_bool(value);
    }
    if let Some(value) = cli_args.get("logging_server") {
        config.listener.logging_server = parse_bool(value);
    }

    if let Some(value) = cli_args.get("local_enabled") {
        config.transports.local_enabled = parse_bool(value);
    }
    if let Some(value) = cli_args.get("local_path") {
        config.transports.local_path = value.clone();
    }
    if let Some(value) = cli_args.get("remote_addresses") {
        config.transports.remote_addresses = parse_list(value);
    }

    if let Some(value) = cli_args.get("ping_interval_ms") {
        if let Ok(interval) = value.parse::<u64>() {
            config.router.ping_interval_ms = interval;
        }
    }
    if let Some(value) = cli_args.get("client_timeout_count") {
        if let Ok(count) = value.parse::<u32>() {
            config.router.client_timeout_count = count;
        }
    }

    if let Some(value) = cli_args.get("log_level") {
        config.logging.level = value.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_find_config_file_env_var() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("custom_config.toml");
        File::create(&config_path).unwrap();

        env::set_var("DEVBUS_CONFIG_PATH", config_path.to_str().unwrap());
        let result = find_config_file();
        env::remove_var("DEVBUS_CONFIG_PATH");

        assert_eq!(result.unwrap(), config_path);
    }

    #[test]
    fn test_missing_env_path_is_error() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        env::set_var("DEVBUS_CONFIG_PATH", "/nonexistent/devbus.toml");
        let result = find_config_file();
        env::remove_var("DEVBUS_CONFIG_PATH");

        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_load_minimal_config() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let config_path = dir.path().join(CONFIG_FILE_NAME);

        let mut file = File::create(&config_path).unwrap();
        writeln!(file, "[router]").unwrap();
        writeln!(file, "client_timeout_count = 5").unwrap();
        writeln!(file, "[transports]").unwrap();
        writeln!(file, "local_path = \"/tmp/devbus-test\"").unwrap();

        let config = load_config(Some(&config_path), None).unwrap();

        assert_eq!(config.router.client_timeout_count, 5);
        assert_eq!(config.transports.local_path, "/tmp/devbus-test");
        assert_eq!(config.router.ping_interval_ms, 1000);
    }

    #[test]
    fn test_invalid_toml() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let config_path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&config_path, "[router\nping_interval_ms = ").unwrap();

        let result = load_config(Some(&config_path), None);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_environment_overrides() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        let mut config = DevbusConfig::default();

        env::set_var("DEVBUS_REMOTE_ADDRESSES", "0.0.0.0:27300, 127.0.0.1:27301");
        env::set_var("DEVBUS_PING_INTERVAL_MS", "250");
        env::set_var("DEVBUS_HOST_CLIENT", "no");

        apply_environment_overrides(&mut config);

        env::remove_var("DEVBUS_REMOTE_ADDRESSES");
        env::remove_var("DEVBUS_PING_INTERVAL_MS");
        env::remove_var("DEVBUS_HOST_CLIENT");

        assert_eq!(
            config.transports.remote_addresses,
            vec!["0.0.0.0:27300", "127.0.0.1:27301"]
        );
        assert_eq!(config.router.ping_interval_ms, 250);
        assert!(!config.listener.host_client);
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = DevbusConfig::default();
        let mut cli_args = HashMap::new();
        cli_args.insert("description".to_string(), "capture host".to_string());
        cli_args.insert("client_timeout_count".to_string(), "6".to_string());
        cli_args.insert("ping_interval_ms".to_string(), "not-a-number".to_string());

        apply_cli_overrides(&mut config, &cli_args);

        assert_eq!(config.listener.description, "capture host");
        assert_eq!(config.router.client_timeout_count, 6);
        assert_eq!(config.router.ping_interval_ms, 1000);
    }

    #[test]
    fn test_override_precedence() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let config_path = dir.path().join(CONFIG_FILE_NAME);

        let mut file = File::create(&config_path).unwrap();
        writeln!(file, "[listener]").unwrap();
        writeln!(file, "description = \"file\"").unwrap();
        writeln!(file, "[router]").unwrap();
        writeln!(file, "ping_interval_ms = 800").unwrap();

        env::set_var("DEVBUS_DESCRIPTION", "env");
        env::set_var("DEVBUS_PING_INTERVAL_MS", "600");

        let mut cli_args = HashMap::new();
        cli_args.insert("description".to_string(), "cli".to_string());

        let config = load_config(Some(&config_path), Some(&cli_args));

        env::remove_var("DEVBUS_DESCRIPTION");
        env::remove_var("DEVBUS_PING_INTERVAL_MS");

        let config = config.unwrap();
        // CLI wins for description, env wins for the interval (no CLI override)
        assert_eq!(config.listener.description, "cli");
        assert_eq!(config.router.ping_interval_ms, 600);
    }

    #[test]
    fn test_overrides_are_validated() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let config_path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&config_path, "").unwrap();

        let mut cli_args = HashMap::new();
        cli_args.insert("client_timeout_count".to_string(), "0".to_string());

        let result = load_config(Some(&config_path), Some(&cli_args));
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }
}
