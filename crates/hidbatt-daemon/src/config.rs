//! Configuration loading and validation

use anyhow::{Context, Result};
use hidbatt_core::{DeviceId, RegistryConfig, SelectedDevice};
use hidbatt_ghub::GHubConfig;
use hidbatt_hidpp::NativeConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{warn, Level};

use crate::mqtt::MqttConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub native: NativeConfig,
    #[serde(default)]
    pub ghub: GHubConfig,
    #[serde(default)]
    pub registry: RegistrySection,
    #[serde(default)]
    pub mqtt: MqttConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Bind address for the HTTP/WebSocket feed
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_true")]
    pub http_enabled: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            http_enabled: true,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8090".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Overrides `--log-level` when set
    #[serde(default)]
    pub level: Option<String>,
}

impl LoggingConfig {
    /// `--verbose` wins, then the config file, then the command line
    pub fn effective_level(&self, cli_level: &str, verbose: bool) -> Level {
        if verbose {
            return Level::DEBUG;
        }
        parse_level(self.level.as_deref().unwrap_or(cli_level))
    }
}

pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// `[registry]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySection {
    #[serde(default = "default_stub_expiry_secs")]
    pub stub_expiry_secs: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Devices the user selected in a previous session
    #[serde(default)]
    pub selected: Vec<SelectedEntry>,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            stub_expiry_secs: default_stub_expiry_secs(),
            event_capacity: default_event_capacity(),
            selected: Vec::new(),
        }
    }
}

fn default_stub_expiry_secs() -> u64 {
    RegistryConfig::default().stub_expiry_secs
}

fn default_event_capacity() -> usize {
    RegistryConfig::default().event_capacity
}

/// A remembered selection as written in the config file.
///
/// `id` is either `source:raw` or a bare raw id whose source is inferred.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectedEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl RegistrySection {
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            stub_expiry_secs: self.stub_expiry_secs,
            event_capacity: self.event_capacity,
        }
    }

    /// Parsed selections; empty or malformed ids are skipped
    pub fn selected_devices(&self) -> Vec<SelectedDevice> {
        self.selected
            .iter()
            .filter(|entry| !entry.id.trim().is_empty())
            .filter_map(|entry| match entry.id.parse::<DeviceId>() {
                Ok(id) => Some(SelectedDevice::new(
                    id,
                    entry.name.clone().filter(|n| !n.is_empty()),
                )),
                Err(e) => {
                    warn!(id = %entry.id, error = %e, "Skipping malformed selected device");
                    None
                }
            })
            .collect()
    }
}

impl Config {
    /// Checks that must pass before any device I/O starts
    pub fn validate(&self) -> Result<()> {
        self.native
            .validate()
            .context("invalid [native] configuration")?;
        self.ghub
            .reconnect_backoff
            .validate()
            .context("invalid [ghub.reconnect_backoff] configuration")?;
        if self.mqtt.enabled {
            self.mqtt.validate().context("invalid [mqtt] configuration")?;
        }
        Ok(())
    }
}

/// Load configuration from file; a missing file yields defaults
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    } else {
        Ok(Config::default())
    }
}
