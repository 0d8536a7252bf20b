//! Environment Configuration Loader
//!
//! Loads environment variables from `/etc/ovsnet/environment` (or `.env` during development)
//! and turns them into a [`DriverConfig`].
//!
//! ## Usage
//!
//! Call `load_environment()` early in main() before reading the config:
//!
//! ```rust
//! use ovsnet_core::config::{load_environment, DriverConfig};
//!
//! load_environment();
//! let config = DriverConfig::from_env();
//! assert!(config.connect_retry.attempts > 0);
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Default path for the environment file
pub const DEFAULT_ENV_FILE: &str = "/etc/ovsnet/environment";

/// Paths checked in order when `OVSNET_ENV_FILE` is unset
pub const ENV_FILE_PATHS: &[&str] = &[DEFAULT_ENV_FILE, ".env"];

pub const DEFAULT_OVSDB_ENDPOINT: &str = "tcp:127.0.0.1:6640";
pub const DEFAULT_PLUGIN_SOCKET: &str = "/run/docker/plugins/ovs.sock";
pub const DEFAULT_GATEWAY_SCRIPT: &str = "/usr/sbin/ovsopt.sh";
pub const DEFAULT_GATEWAY_UNIT: &str = "/etc/systemd/system/linkerGateway.service";

/// Load environment variables from the canonical configuration file.
///
/// This function:
/// 1. Honours `OVSNET_ENV_FILE` if set
/// 2. Checks `/etc/ovsnet/environment` (system-wide)
/// 3. Falls back to `.env` in current directory (development)
///
/// Existing environment variables are never overridden.
/// Returns the path that was loaded, or None if no file was found.
pub fn load_environment() -> Option<String> {
    if let Ok(custom_path) = std::env::var("OVSNET_ENV_FILE") {
        if let Some(path) = try_load_env_file(&custom_path) {
            return Some(path);
        }
    }

    for path in ENV_FILE_PATHS {
        if let Some(loaded_path) = try_load_env_file(path) {
            return Some(loaded_path);
        }
    }

    debug!("No environment file found, using existing environment");
    None
}

fn try_load_env_file(path: &str) -> Option<String> {
    let path_obj = Path::new(path);

    if !path_obj.exists() {
        return None;
    }

    match fs::read_to_string(path_obj) {
        Ok(content) => {
            let mut loaded_count = 0;
            let mut skipped_count = 0;

            for line in content.lines() {
                let line = line.trim();

                if line.is_empty() || line.starts_with('#') {
                    continue;
                }

                if let Some((key, value)) = parse_env_line(line) {
                    if std::env::var(&key).is_err() {
                        std::env::set_var(&key, &value);
                        loaded_count += 1;
                        debug!("Loaded: {}={}", key, value);
                    } else {
                        skipped_count += 1;
                        debug!("Skipped (already set): {}", key);
                    }
                }
            }

            info!(
                "Loaded {} environment variables from {} ({} skipped - already set)",
                loaded_count, path, skipped_count
            );

            Some(path.to_string())
        }
        Err(e) => {
            warn!("Failed to read environment file {}: {}", path, e);
            None
        }
    }
}

/// Parse a single environment line into key-value pair.
fn parse_env_line(line: &str) -> Option<(String, String)> {
    // KEY=VALUE, KEY="VALUE", KEY='VALUE'
    let mut parts = line.splitn(2, '=');
    let key = parts.next()?.trim();
    let value = parts.next()?.trim();

    if key.is_empty() {
        return None;
    }

    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value);

    Some((key.to_string(), value.to_string()))
}

/// Where the switch database listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OvsdbEndpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl std::str::FromStr for OvsdbEndpoint {
    type Err = ConfigError;

    /// Accepts the ovs-vsctl style `tcp:host:port` and `unix:/path`, or a bare path.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(addr) = s.strip_prefix("tcp:") {
            if addr.rsplit_once(':').map_or(true, |(host, port)| {
                host.is_empty() || port.parse::<u16>().is_err()
            }) {
                return Err(ConfigError::invalid("ovsdb endpoint", s));
            }
            Ok(OvsdbEndpoint::Tcp(addr.to_string()))
        } else if let Some(path) = s.strip_prefix("unix:") {
            Ok(OvsdbEndpoint::Unix(PathBuf::from(path)))
        } else if s.starts_with('/') {
            Ok(OvsdbEndpoint::Unix(PathBuf::from(s)))
        } else {
            Err(ConfigError::invalid("ovsdb endpoint", s))
        }
    }
}

impl std::fmt::Display for OvsdbEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OvsdbEndpoint::Tcp(addr) => write!(f, "tcp:{}", addr),
            OvsdbEndpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Runtime configuration for the driver daemon.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub ovsdb_endpoint: OvsdbEndpoint,
    /// Unix socket the remote-driver API is served on
    pub plugin_socket: PathBuf,
    pub rpc_timeout: Duration,
    /// Initial connection to the switch database
    pub connect_retry: RetryPolicy,
    /// Waiting for the root Open_vSwitch row to show up in the cache
    pub root_poll: RetryPolicy,
    /// Waiting for a freshly created bridge to appear as a kernel link
    pub link_poll: RetryPolicy,
    pub gateway_script: PathBuf,
    pub gateway_unit: PathBuf,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            ovsdb_endpoint: OvsdbEndpoint::Tcp("127.0.0.1:6640".to_string()),
            plugin_socket: PathBuf::from(DEFAULT_PLUGIN_SOCKET),
            rpc_timeout: Duration::from_secs(30),
            connect_retry: RetryPolicy::new(3, Duration::from_secs(5)),
            root_poll: RetryPolicy::new(60, Duration::from_secs(1)),
            link_poll: RetryPolicy::new(3, Duration::from_secs(2)),
            gateway_script: PathBuf::from(DEFAULT_GATEWAY_SCRIPT),
            gateway_unit: PathBuf::from(DEFAULT_GATEWAY_UNIT),
        }
    }
}

impl DriverConfig {
    /// Build from the process environment, falling back to defaults for unset keys.
    pub fn from_env() -> Self {
        match Self::from_lookup(|key| std::env::var(key).ok()) {
            Ok(config) => config,
            Err(e) => {
                warn!("Ignoring invalid environment configuration: {}", e);
                Self::default()
            }
        }
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let secs = |key: &str, default: Duration| -> Result<Duration, ConfigError> {
            match get(key) {
                Some(v) => v
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|_| ConfigError::invalid(key, &v)),
                None => Ok(default),
            }
        };
        let count = |key: &str, default: u32| -> Result<u32, ConfigError> {
            match get(key) {
                Some(v) => v.trim().parse().map_err(|_| ConfigError::invalid(key, &v)),
                None => Ok(default),
            }
        };

        let defaults = Self::default();
        let ovsdb_endpoint = match get("OVSNET_OVSDB_ENDPOINT") {
            Some(v) => v.trim().parse()?,
            None => DEFAULT_OVSDB_ENDPOINT.parse()?,
        };

        Ok(Self {
            ovsdb_endpoint,
            plugin_socket: get("OVSNET_PLUGIN_SOCKET")
                .map(PathBuf::from)
                .unwrap_or(defaults.plugin_socket),
            rpc_timeout: secs("OVSNET_RPC_TIMEOUT_SECS", defaults.rpc_timeout)?,
            connect_retry: RetryPolicy::new(
                count("OVSNET_CONNECT_ATTEMPTS", defaults.connect_retry.attempts)?,
                secs("OVSNET_CONNECT_DELAY_SECS", defaults.connect_retry.delay)?,
            ),
            root_poll: RetryPolicy::new(
                count("OVSNET_ROOT_POLL_ATTEMPTS", defaults.root_poll.attempts)?,
                secs("OVSNET_ROOT_POLL_INTERVAL_SECS", defaults.root_poll.delay)?,
            ),
            link_poll: RetryPolicy::new(
                count("OVSNET_LINK_POLL_ATTEMPTS", defaults.link_poll.attempts)?,
                secs("OVSNET_LINK_POLL_DELAY_SECS", defaults.link_poll.delay)?,
            ),
            gateway_script: get("OVSNET_GATEWAY_SCRIPT")
                .map(PathBuf::from)
                .unwrap_or(defaults.gateway_script),
            gateway_unit: get("OVSNET_GATEWAY_UNIT")
                .map(PathBuf::from)
                .unwrap_or(defaults.gateway_unit),
        })
    }
}
