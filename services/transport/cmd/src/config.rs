//! Configuration handling for the transport service.
//!
//! This module reads configuration from a YAML file and environment
//! variables, providing a unified configuration interface. Missing or
//! unparseable files fall back to defaults with a warning rather than
//! failing startup.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Transport service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Listen address for incoming replication connections
    pub listen_addr: Option<String>,
    /// Peer WebSocket URL to dial (ws:// or wss://)
    pub peer_url: Option<String>,
    /// WebSocket subprotocol to offer/accept
    pub protocol: Option<String>,
    /// Basic auth credentials for outbound connections
    pub auth: AuthConfig,
    /// TLS configuration
    pub tls: TlsFileConfig,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Basic auth credentials
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Username, empty to disable
    #[serde(default)]
    pub username: String,
    /// Password
    #[serde(default)]
    pub password: String,
}

/// TLS file locations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsFileConfig {
    /// Whether TLS is enabled
    #[serde(default)]
    pub enabled: bool,
    /// Path to certificate file (PEM format)
    #[serde(default)]
    pub cert_file: String,
    /// Path to private key file (PEM format)
    #[serde(default)]
    pub key_file: String,
    /// Path to CA certificate file (PEM format)
    #[serde(default)]
    pub ca_file: String,
    /// Path to a pinned server certificate (PEM format)
    #[serde(default)]
    pub pinned_cert_file: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_addr: None,
            peer_url: None,
            protocol: None,
            auth: AuthConfig::default(),
            tls: TlsFileConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    transport: Option<TransportConfig>,
}

impl TransportConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        if let Ok(content) = std::fs::read_to_string(&config_path) {
            match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root_config) => {
                    if let Some(transport) = root_config.transport {
                        config = transport;
                    }
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => {
                    warn!(
                        "Failed to parse config file {:?} ({}), using defaults",
                        config_path.as_ref(),
                        e
                    );
                }
            }
        } else {
            warn!(
                "Config file {:?} not found, using defaults",
                config_path.as_ref()
            );
        }

        config.apply_environment_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_environment_overrides(&mut self) {
        if let Ok(listen) = std::env::var("TRANSPORT_LISTEN_ADDR") {
            info!("Listen address overridden by environment: {}", listen);
            self.listen_addr = Some(listen);
        }

        if let Ok(peer) = std::env::var("TRANSPORT_PEER_URL") {
            info!("Peer URL overridden by environment: {}", peer);
            self.peer_url = Some(peer);
        }

        if let Ok(level) = std::env::var("TRANSPORT_LOG_LEVEL") {
            self.log_level = level;
        }

        if let Ok(username) = std::env::var("TRANSPORT_AUTH_USERNAME") {
            self.auth.username = username;
        }

        if let Ok(password) = std::env::var("TRANSPORT_AUTH_PASSWORD") {
            self.auth.password = password;
        }
    }
}
