//! Configuration system for the PacketViz sensor
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Native backends that may appear in `capture.backends`
pub const KNOWN_BACKENDS: [&str; 2] = ["libpcap", "datalink"];

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete sensor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketVizConfig {
    /// Process-level settings
    pub server: ServerSettings,

    /// Capture pipeline settings
    pub capture: CaptureSettings,

    /// Real-time transport settings
    pub web: WebSettings,
}

/// Process-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Capture settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Native backends to probe, in priority order. Connection polling is
    /// always appended as the terminal fallback.
    pub backends: Vec<String>,

    /// Fallback poller tick interval
    pub poll_interval_ms: u64,

    /// Upper bound on one connection-table query
    pub query_timeout_ms: u64,

    /// Kernel-side filter for native sessions that support one
    pub bpf_filter: String,

    /// Kernel capture buffer size in bytes
    pub buffer_size: usize,

    /// How long one native read may block before re-checking for stop
    pub read_timeout_ms: u64,

    /// Bytes captured per frame
    pub snaplen: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            backends: KNOWN_BACKENDS.iter().map(|b| b.to_string()).collect(),
            poll_interval_ms: 2000,
            query_timeout_ms: 5000,
            bpf_filter: "tcp and (not host 127.0.0.1)".to_string(),
            buffer_size: 10 * 1024 * 1024,
            read_timeout_ms: 10,
            snaplen: 65535,
        }
    }
}

/// Real-time transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSettings {
    /// Serve the WebSocket transport
    pub enabled: bool,

    /// Host to bind
    pub host: String,

    /// Port to bind
    pub port: u16,

    /// Broadcast slots per subscriber before it starts lagging
    pub buffer_size: usize,
}

impl Default for WebSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 4000,
            buffer_size: 1024,
        }
    }
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. PACKETVIZ_CONFIG environment variable
    /// 3. ~/.config/packetviz/config.toml
    /// 4. /etc/packetviz/config.toml
    /// 5. Default values
    pub fn load(&self) -> ConfigResult<PacketVizConfig> {
        let config_path = self.find_config_file();

        let mut config = if let Some(path) = config_path {
            info!("Loading configuration from: {}", path.display());
            self.load_from_file(&path)?
        } else {
            debug!("No config file found, using defaults");
            PacketVizConfig::default()
        };

        self.apply_env_overrides(&mut config);
        self.validate(&config)?;

        Ok(config)
    }

    /// Find the config file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("CLI config path does not exist: {}", path.display());
        }

        if let Ok(env_path) = std::env::var("PACKETVIZ_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("PACKETVIZ_CONFIG path does not exist: {}", env_path);
        }

        if let Some(path) = Self::default_config_path() {
            if path.exists() {
                return Some(path);
            }
        }

        #[cfg(unix)]
        {
            let path = PathBuf::from("/etc/packetviz/config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Load configuration from a TOML file
    fn load_from_file(&self, path: &Path) -> ConfigResult<PacketVizConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: PacketVizConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut PacketVizConfig) {
        if let Ok(val) = std::env::var("PACKETVIZ_LOG_LEVEL") {
            config.server.log_level = val;
        }

        // PORT is honoured for compatibility with hosted environments
        for key in ["PORT", "PACKETVIZ_WEB_PORT"] {
            if let Ok(val) = std::env::var(key) {
                match val.parse() {
                    Ok(port) => config.web.port = port,
                    Err(_) => warn!("Ignoring non-numeric {}: {}", key, val),
                }
            }
        }
        if let Ok(val) = std::env::var("PACKETVIZ_WEB_HOST") {
            config.web.host = val;
        }
        if let Ok(val) = std::env::var("PACKETVIZ_WEB_ENABLED") {
            config.web.enabled = val.parse().unwrap_or(config.web.enabled);
        }

        if let Ok(val) = std::env::var("PACKETVIZ_POLL_INTERVAL_MS") {
            if let Ok(ms) = val.parse() {
                config.capture.poll_interval_ms = ms;
            }
        }
        if let Ok(val) = std::env::var("PACKETVIZ_QUERY_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                config.capture.query_timeout_ms = ms;
            }
        }
        if let Ok(val) = std::env::var("PACKETVIZ_BACKENDS") {
            config.capture.backends = val
                .split(',')
                .map(|b| b.trim().to_lowercase())
                .filter(|b| !b.is_empty())
                .collect();
        }
    }

    /// Validate configuration
    fn validate(&self, config: &PacketVizConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.server.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.server.log_level, valid_levels
            )));
        }

        for backend in &config.capture.backends {
            if !KNOWN_BACKENDS.contains(&backend.to_lowercase().as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Unknown capture backend: {}. Must be one of: {:?}",
                    backend, KNOWN_BACKENDS
                )));
            }
        }

        if config.capture.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "Poll interval cannot be 0".to_string(),
            ));
        }

        if config.capture.query_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "Connection table query timeout cannot be 0".to_string(),
            ));
        }

        if config.web.port == 0 {
            return Err(ConfigError::ValidationError(
                "Web port cannot be 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the default config file path for the current platform
    pub fn default_config_path() -> Option<PathBuf> {
        user_config_dir(|key| std::env::var(key).ok())
            .map(|dir| dir.join("packetviz").join("config.toml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-user config directory: `%APPDATA%` on Windows, otherwise
/// `$XDG_CONFIG_HOME` falling back to `~/.config`
fn user_config_dir(var: impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    let set = |key: &str| var(key).filter(|v| !v.is_empty());

    if cfg!(windows) {
        return set("APPDATA").map(PathBuf::from);
    }

    set("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| set("HOME").map(|home| Path::new(&home).join(".config")))
}
