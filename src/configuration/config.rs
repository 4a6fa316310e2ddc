use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use log::{debug, info};
use serde::Deserialize;

use super::types::*;
use crate::client_management::BridgeConfig;
use crate::error_handling::types::ConfigError;
use crate::session_management::OrchestratorOptions;

/// Command-line arguments. Every option overrides the matching value of the
/// configuration file and can also be given through a `MULTIWA_*` variable.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "multiwa")]
#[command(version)]
#[command(about = "Multi-profile WhatsApp Web session manager")]
pub struct Args {
    /// TOML configuration file. Built-in defaults are used when absent.
    #[arg(env = "MULTIWA_CONFIG")]
    pub config_file: Option<PathBuf>,

    /// Port of the web server
    #[arg(long, env = "MULTIWA_PORT")]
    pub port: Option<u16>,

    /// Address of the web server
    #[arg(long, env = "MULTIWA_BIND_ADDRESS")]
    pub bind_address: Option<String>,

    /// Directory holding the data file and client sessions
    #[arg(long, env = "MULTIWA_DATA_DIR")]
    pub data_dir: Option<PathBuf>,
}

/// Application configuration.
///
/// ```toml
/// [server]
/// port = 5000
///
/// [bridge]
/// command = "node"
/// args = ["whatsapp-bridge/index.js"]
///
/// [sessions]
/// qr_timeout_secs = 300
/// auto_initialize = true
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub storage: StorageSection,
    pub bridge: BridgeSection,
    pub sessions: SessionsSection,
}

impl Config {
    /// Loads the file named in `args` (or the defaults), then applies the
    /// command-line overrides and validates the result.
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let mut config = match &args.config_file {
            Some(path) => Self::from_file(path)?,
            None => {
                info!("No configuration file given, using defaults");
                Self::default()
            }
        };
        config.apply_overrides(args);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!("Reading configuration from {}", path.display());
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::TomlError(e.to_string()))
    }

    pub fn apply_overrides(&mut self, args: &Args) {
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(address) = &args.bind_address {
            self.server.bind_address = address.clone();
        }
        if let Some(dir) = &args.data_dir {
            self.storage.data_dir = dir.clone();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidValue(
                "server.port must not be 0".to_string(),
            ));
        }
        if self.bridge.command.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "bridge.command must not be empty".to_string(),
            ));
        }
        if self.sessions.observer_buffer == 0 {
            return Err(ConfigError::InvalidValue(
                "sessions.observer_buffer must be at least 1".to_string(),
            ));
        }
        self.socket_addr()?;
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.server.bind_address, self.server.port)
            .parse()
            .map_err(|_| {
                ConfigError::InvalidValue(format!(
                    "invalid bind address '{}'",
                    self.server.bind_address
                ))
            })
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.bridge
            .sessions_dir
            .clone()
            .unwrap_or_else(|| self.storage.data_dir.join("sessions"))
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            command: self.bridge.command.clone(),
            args: self.bridge.args.clone(),
            sessions_dir: self.sessions_dir(),
            browser_path: self
                .bridge
                .browser_path
                .clone()
                .filter(|p| !p.trim().is_empty()),
            init_timeout: Duration::from_secs(self.bridge.init_timeout_secs),
            request_timeout: Duration::from_secs(self.bridge.request_timeout_secs),
        }
    }

    /// The bridge script named in `bridge.args` when it does not exist. The
    /// script ships separately from this crate.
    pub fn missing_bridge_script(&self) -> Option<PathBuf> {
        self.bridge
            .args
            .iter()
            .map(PathBuf::from)
            .find(|arg| {
                matches!(
                    arg.extension().and_then(|e| e.to_str()),
                    Some("js" | "mjs" | "cjs")
                )
            })
            .filter(|script| !script.exists())
    }

    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            qr_timeout: match self.sessions.qr_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            destroy_timeout: Duration::from_secs(self.bridge.destroy_timeout_secs),
            observer_buffer: self.sessions.observer_buffer,
        }
    }
}
