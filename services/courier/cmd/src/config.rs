//! Configuration handling for the courier service.
//!
//! Settings come from the shared YAML config file, then environment
//! variables, then command-line flags (applied in `main`).

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Courier service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourierConfig {
    /// Storage backend: `memory` or `file`
    pub storage_mode: String,
    /// Session snapshot file (file storage)
    pub state_file: PathBuf,
    /// Root of the per-session credential directories (file storage)
    pub credentials_dir: PathBuf,
    /// Transport provider name
    pub transport: String,
    /// Campaign interval used when the operator gives none (seconds)
    pub default_interval: u64,
    /// Connection establishment timeout (seconds)
    pub connect_timeout: u64,
    /// Keep-alive interval passed to the transport (seconds)
    pub keepalive_interval: u64,
    /// Wait before requesting a pairing code (seconds)
    pub pairing_delay: u64,
    /// How long a login waits for its outcome (seconds)
    pub login_timeout: u64,
    /// Backoff step per reconnection attempt (milliseconds)
    pub reconnect_base_ms: u64,
    /// Backoff ceiling (milliseconds)
    pub reconnect_cap_ms: u64,
    /// Retry delay after a failed connection setup (milliseconds)
    pub reconnect_fallback_ms: u64,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            storage_mode: "file".to_string(),
            state_file: PathBuf::from("./data/sessions.json"),
            credentials_dir: PathBuf::from("./data/credentials"),
            transport: "loopback".to_string(),
            default_interval: courier_storage::DEFAULT_INTERVAL_SECS,
            connect_timeout: 120,
            keepalive_interval: 10,
            pairing_delay: 3,
            login_timeout: 180,
            reconnect_base_ms: 2000,
            reconnect_cap_ms: 30_000,
            reconnect_fallback_ms: 5000,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    courier: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    config: Option<HashMap<String, String>>,
}

fn parse_into(target: &mut u64, key: &str, value: &str) {
    match value.trim().parse::<u64>() {
        Ok(parsed) => *target = parsed,
        Err(_) => warn!("Ignoring non-numeric value {:?} for {}", value, key),
    }
}

impl CourierConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root_config) => {
                    config.apply_root_config(root_config);
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => warn!(
                    "Failed to parse config file {:?} ({}), using defaults",
                    config_path.as_ref(),
                    e
                ),
            },
            Err(_) => warn!("Config file {:?} not found, using defaults", config_path.as_ref()),
        }

        config.apply_environment_overrides();

        info!(
            "Final courier configuration: storage={}, state_file={:?}, credentials_dir={:?}, transport={}",
            config.storage_mode, config.state_file, config.credentials_dir, config.transport
        );
        Ok(config)
    }

    fn apply_root_config(&mut self, root_config: RootConfig) {
        let values = root_config
            .services
            .and_then(|services| services.courier)
            .and_then(|courier| courier.config);
        let Some(values) = values else {
            return;
        };

        for (key, value) in values {
            match key.as_str() {
                "services.courier.storage_mode" => self.storage_mode = value,
                "services.courier.state_file" => self.state_file = PathBuf::from(value),
                "services.courier.credentials_dir" => self.credentials_dir = PathBuf::from(value),
                "services.courier.transport" => self.transport = value,
                "services.courier.default_interval" => {
                    parse_into(&mut self.default_interval, &key, &value)
                }
                "services.courier.connect_timeout" => {
                    parse_into(&mut self.connect_timeout, &key, &value)
                }
                "services.courier.keepalive_interval" => {
                    parse_into(&mut self.keepalive_interval, &key, &value)
                }
                "services.courier.pairing_delay" => {
                    parse_into(&mut self.pairing_delay, &key, &value)
                }
                "services.courier.login_timeout" => {
                    parse_into(&mut self.login_timeout, &key, &value)
                }
                "services.courier.reconnect.base_ms" => {
                    parse_into(&mut self.reconnect_base_ms, &key, &value)
                }
                "services.courier.reconnect.cap_ms" => {
                    parse_into(&mut self.reconnect_cap_ms, &key, &value)
                }
                "services.courier.reconnect.fallback_ms" => {
                    parse_into(&mut self.reconnect_fallback_ms, &key, &value)
                }
                _ => {
                    // Ignore unknown configuration keys
                }
            }
        }
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        if let Ok(state_file) = std::env::var("COURIER_STATE_FILE") {
            self.state_file = PathBuf::from(state_file);
            info!("State file overridden by environment: {:?}", self.state_file);
        }

        if let Ok(credentials_dir) = std::env::var("COURIER_CREDENTIALS_DIR") {
            self.credentials_dir = PathBuf::from(credentials_dir);
            info!("Credentials directory overridden by environment: {:?}", self.credentials_dir);
        }

        if let Ok(interval) = std::env::var("COURIER_DEFAULT_INTERVAL") {
            if let Ok(secs) = interval.parse::<u64>() {
                self.default_interval = secs;
                info!("Default interval overridden by environment: {}s", secs);
            }
        }

        if let Ok(transport) = std::env::var("COURIER_TRANSPORT") {
            self.transport = transport;
            info!("Transport overridden by environment: {}", self.transport);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = CourierConfig::default();
        assert_eq!(config.storage_mode, "file");
        assert_eq!(config.transport, "loopback");
        assert_eq!(config.default_interval, 5);
        assert_eq!(config.connect_timeout, 120);
        assert_eq!(config.reconnect_cap_ms, 30_000);
    }

    #[test]
    fn test_file_values_override_defaults() {
        let yaml_content = r#"
services:
  courier:
    enabled: true
    config:
      services.courier.storage_mode: "memory"
      services.courier.credentials_dir: "/var/lib/courier/creds"
      services.courier.pairing_delay: "1"
      services.courier.reconnect.base_ms: "500"
      services.courier.login_timeout: "soon"
"#;
        let mut config = CourierConfig::default();
        let root: RootConfig = serde_yaml::from_str(yaml_content).unwrap();
        config.apply_root_config(root);

        assert_eq!(config.storage_mode, "memory");
        assert_eq!(config.credentials_dir, PathBuf::from("/var/lib/courier/creds"));
        assert_eq!(config.pairing_delay, 1);
        assert_eq!(config.reconnect_base_ms, 500);
        // Unparsable numbers keep the default
        assert_eq!(config.login_timeout, 180);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
services:
  courier:
    config:
      services.courier.state_file: "/tmp/courier-test/sessions.json"
      services.courier.connect_timeout: "30"
"#;
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = CourierConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.connect_timeout, 30);
        assert_eq!(config.keepalive_interval, 10);
    }

    #[test]
    fn test_missing_or_broken_file_uses_defaults() {
        let missing = CourierConfig::load_from_file("/nonexistent/courier.yaml").unwrap();
        assert_eq!(missing.connect_timeout, 120);

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"services: [unclosed").unwrap();
        let broken = CourierConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(broken.pairing_delay, 3);
    }
}
