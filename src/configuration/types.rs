//! Sections of the TOML configuration file. Every field has a default, so an
//! empty file is a valid configuration.

use std::path::PathBuf;

use serde::Deserialize;

/// Name of the per-user application directory.
pub const APP_DIR_NAME: &str = "whatsapp-manager";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind_address: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Directory holding `data.json` and, unless configured otherwise, the
    /// client credential stores.
    pub data_dir: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// `$APPDATA/whatsapp-manager` on Windows, `$HOME/whatsapp-manager` elsewhere.
pub fn default_data_dir() -> PathBuf {
    std::env::var_os("APPDATA")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

/// How the automation bridge processes are launched.
///
/// The bridge program is not part of this crate. `command` and `args` must
/// start a process speaking the newline-delimited JSON protocol described in
/// the README; the default expects it at `whatsapp-bridge/index.js` relative
/// to the working directory.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BridgeSection {
    pub command: String,
    pub args: Vec<String>,
    /// Defaults to `<data_dir>/sessions`.
    pub sessions_dir: Option<PathBuf>,
    pub browser_path: Option<String>,
    pub init_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub destroy_timeout_secs: u64,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            command: "node".to_string(),
            args: vec!["whatsapp-bridge/index.js".to_string()],
            sessions_dir: None,
            browser_path: None,
            init_timeout_secs: 120,
            request_timeout_secs: 60,
            destroy_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionsSection {
    /// Seconds a client may wait for its QR code to be scanned. `0` waits
    /// forever.
    pub qr_timeout_secs: u64,
    /// Start every saved profile of every user at boot.
    pub auto_initialize: bool,
    /// Live messages queued per observer before it is dropped.
    pub observer_buffer: usize,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            qr_timeout_secs: 0,
            auto_initialize: false,
            observer_buffer: 64,
        }
    }
}
