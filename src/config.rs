//! Configuration loading and persistence.
//!
//! Settings come from `<config dir>/fingate/config.json` (or an explicit
//! path), then `FINGATE_*` environment variables override individual fields.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::connection::{ConnectionOptions, DEFAULT_PORT, DEFAULT_WORKERS};
use crate::gateway::GatewayOptions;

/// Configuration for a gateway session.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Runtime host.
    pub host: String,
    /// Runtime WebSocket port.
    pub port: u16,
    /// Connection identity; random when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// License key sent during the handshake.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_key: Option<String>,
    /// Runtime config URL sent during the handshake.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_url: Option<String>,
    /// Open the agent's developer tools after bootstrap.
    pub show_console: bool,
    /// Seconds to wait for any correlated response.
    pub request_timeout: u64,
    /// Seconds to wait for the authorization handshake.
    pub handshake_timeout: u64,
    /// Inbound worker pool size.
    pub workers: usize,
    /// Serve the agent page from this URL instead of the embedded copy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_url: Option<String>,
    /// Application option document started after bootstrap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup_app: Option<Value>,
    /// Manifest URL started after bootstrap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup_manifest: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            uuid: None,
            license_key: None,
            config_url: None,
            show_console: false,
            request_timeout: 30,
            handshake_timeout: 30,
            workers: DEFAULT_WORKERS,
            app_url: None,
            startup_app: None,
            startup_manifest: None,
        }
    }
}

impl GatewayConfig {
    /// Returns the configuration directory path.
    ///
    /// `FINGATE_CONFIG_DIR` wins; otherwise the platform config dir
    /// (Linux: `~/.config/fingate`).
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("FINGATE_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("fingate"))
    }

    /// Default config file path.
    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Loads the default config file (defaults when absent), then applies
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            log::debug!("No config at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Reads a config file without applying overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Writes the config as pretty JSON, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write config {}", path.display()))
    }

    /// Applies `FINGATE_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from `lookup`.
    ///
    /// Unparseable numbers are logged and skipped; their variable names are
    /// returned.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Vec<&'static str> {
        let mut ignored = Vec::new();

        if let Some(host) = lookup("FINGATE_HOST") {
            self.host = host;
        }

        if let Some(port) = parse_number(&lookup, "FINGATE_PORT", &mut ignored) {
            self.port = port;
        }

        if let Some(uuid) = lookup("FINGATE_UUID") {
            self.uuid = Some(uuid);
        }

        if let Some(key) = lookup("FINGATE_LICENSE_KEY") {
            self.license_key = Some(key);
        }

        if let Some(url) = lookup("FINGATE_CONFIG_URL") {
            self.config_url = Some(url);
        }

        if let Some(flag) = lookup("FINGATE_SHOW_CONSOLE") {
            self.show_console = matches!(flag.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }

        if let Some(secs) = parse_number(&lookup, "FINGATE_REQUEST_TIMEOUT", &mut ignored) {
            self.request_timeout = secs;
        }

        if let Some(secs) = parse_number(&lookup, "FINGATE_HANDSHAKE_TIMEOUT", &mut ignored) {
            self.handshake_timeout = secs;
        }

        if let Some(n) = parse_number::<usize>(&lookup, "FINGATE_WORKERS", &mut ignored) {
            self.workers = n.max(1);
        }

        if let Some(url) = lookup("FINGATE_APP_URL") {
            self.app_url = Some(url);
        }

        ignored
    }

    /// Connection options described by this config.
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            host: self.host.clone(),
            port: self.port,
            uuid: self.uuid.clone(),
            license_key: self.license_key.clone(),
            config_url: self.config_url.clone(),
            request_timeout: Duration::from_secs(self.request_timeout),
            handshake_timeout: Duration::from_secs(self.handshake_timeout),
            workers: self.workers,
        }
    }

    /// Gateway options described by this config (no lifecycle listener).
    pub fn gateway_options(&self) -> GatewayOptions {
        GatewayOptions {
            app_url: self.app_url.clone(),
            show_console: self.show_console,
            startup_app: self.startup_app.clone(),
            startup_manifest: self.startup_manifest.clone(),
            listener: None,
        }
    }
}

/// Parses `key` from `lookup`, logging and recording it in `ignored` when the
/// value is not a valid number.
fn parse_number<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    ignored: &mut Vec<&'static str>,
) -> Option<T> {
    let raw = lookup(key)?;
    if let Ok(value) = raw.trim().parse() {
        Some(value)
    } else {
        log::warn!("Ignoring invalid {}={}", key, raw);
        ignored.push(key);
        None
    }
}
