//! Configuration system for the Cloudless CLI.

use cloudless_core::{ResyncPolicy, SessionConfig};
use cloudless_files::ChunkLayout;
use cloudless_transport::{ReconnectPolicy, TransportConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Environment variable that overrides `server.token`.
pub const TOKEN_ENV: &str = "CLOUDLESS_TOKEN";

/// Cloudless configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Relay server
    #[serde(default)]
    pub server: ServerConfig,
    /// Session tuning
    #[serde(default)]
    pub session: SessionSettings,
    /// Local files
    #[serde(default)]
    pub storage: StorageConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL, e.g. `https://relay.example`
    #[serde(default = "default_server_url")]
    pub url: String,
    /// Bearer token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Session tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Plaintext bytes per chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Relay blob layout
    #[serde(default)]
    pub chunk_layout: ChunkLayout,
    /// Keep-alive interval in seconds
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
    /// Reconnect attempts after an unexpected close
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    /// Member refetches allowed per undecryptable message
    #[serde(default = "default_max_resyncs")]
    pub max_resyncs: u32,
}

/// Local storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Room key file
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
    /// Where received files go
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_server_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_chunk_size() -> usize {
    cloudless_files::DEFAULT_CHUNK_SIZE
}

fn default_heartbeat() -> u64 {
    30
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_max_resyncs() -> u32 {
    1
}

fn default_key_file() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("cloudless/keys.json")
}

fn default_download_dir() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: default_server_url(),
            token: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_layout: ChunkLayout::default(),
            heartbeat_secs: default_heartbeat(),
            reconnect_attempts: default_reconnect_attempts(),
            max_resyncs: default_max_resyncs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            key_file: default_key_file(),
            download_dir: default_download_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("cloudless/config.toml")
    }

    /// Load config from `path`, falling back to defaults if it does not exist
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Take the token from [`TOKEN_ENV`] if it is set.
    pub fn apply_env(&mut self) {
        self.apply_token(std::env::var(TOKEN_ENV).ok());
    }

    fn apply_token(&mut self, token: Option<String>) {
        if let Some(token) = token.filter(|t| !t.trim().is_empty()) {
            self.server.token = Some(token.trim().to_string());
        }
    }

    /// Bearer token
    ///
    /// # Errors
    ///
    /// Returns an error if no token is configured.
    pub fn token(&self) -> anyhow::Result<&str> {
        self.server.token.as_deref().ok_or_else(|| {
            anyhow::anyhow!("no access token: set server.token or {TOKEN_ENV}")
        })
    }

    /// Session configuration for the core library
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            chunk_size: self.session.chunk_size,
            chunk_layout: self.session.chunk_layout,
            resync: ResyncPolicy {
                max_resyncs: self.session.max_resyncs,
            },
            transport: TransportConfig {
                heartbeat_interval: Duration::from_secs(self.session.heartbeat_secs),
                reconnect: ReconnectPolicy {
                    max_attempts: self.session.reconnect_attempts,
                    ..ReconnectPolicy::default()
                },
            },
            request_timeout: Duration::from_secs(self.server.request_timeout_secs),
            ..SessionConfig::default()
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let url = Url::parse(&self.server.url)
            .map_err(|e| anyhow::anyhow!("Invalid server url '{}': {e}", self.server.url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("Server url must use http or https, got '{}'", url.scheme());
        }

        if self.server.request_timeout_secs == 0 {
            anyhow::bail!("Request timeout must be at least 1 second");
        }

        if self.session.chunk_size == 0 || self.session.chunk_size > 16 * 1024 * 1024 {
            anyhow::bail!("Chunk size must be between 1 and 16MB");
        }

        if self.session.heartbeat_secs == 0 {
            anyhow::bail!("Heartbeat interval must be at least 1 second");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        self.session_config().validate()?;
        Ok(())
    }
}
