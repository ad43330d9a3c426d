//! Server configuration module.
//!
//! Parses process configuration from environment variables. Durable,
//! user-editable settings (password, retention limits) live in
//! [`crate::settings`] instead.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `PORT` | No | 8080 | HTTP server port |
//! | `STATUSHUB_CONFIG` | No | `config.json` | Path of the settings file |
//! | `STATUSHUB_ASSETS` | No | `assets` | Static assets directory |
//! | `STATUSHUB_PROXIES` | No | 0 | Number of trusted reverse proxies |
//! | `STATUSHUB_SESSION_SECRET` | No | random | Secret used to sign session cookies |
//!
//! The binary additionally reads `STATUSHUB_PASSWORD` once, as the initial
//! password when no settings file exists yet.

use std::env;
use std::path::PathBuf;

use thiserror::Error;
use tracing::warn;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8080;

/// Default path of the durable settings file.
const DEFAULT_SETTINGS_PATH: &str = "config.json";

/// Default static assets directory.
const DEFAULT_ASSETS_DIR: &str = "assets";

/// Reasons the environment does not describe a usable configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set but cannot be read as the expected type.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// `PORT` is not a number between 0 and 65535.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),

    /// The values parse but are not acceptable together.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Server configuration parsed from environment variables.
#[derive(Clone)]
pub struct ServerConfig {
    /// HTTP server port.
    pub port: u16,

    /// Path of the durable settings file.
    pub settings_path: PathBuf,

    /// Directory holding `index.html`, `login.html` and static assets.
    pub assets_dir: PathBuf,

    /// Number of reverse proxies in front of the server whose
    /// `X-Forwarded-For` entries are trusted.
    pub reverse_proxies: usize,

    /// Secret for signing session cookies. A random secret is generated
    /// when unset, which invalidates sessions on every restart.
    pub session_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            settings_path: PathBuf::from(DEFAULT_SETTINGS_PATH),
            assets_dir: PathBuf::from(DEFAULT_ASSETS_DIR),
            reverse_proxies: 0,
            session_secret: None,
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("port", &self.port)
            .field("settings_path", &self.settings_path)
            .field("assets_dir", &self.assets_dir)
            .field("reverse_proxies", &self.reverse_proxies)
            .field(
                "session_secret",
                &self.session_secret.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl ServerConfig {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `PORT` is not a valid u16
    /// - `STATUSHUB_PROXIES` is not a non-negative integer
    /// - `STATUSHUB_SESSION_SECRET` is set but empty
    ///
    /// # Example
    ///
    /// ```no_run
    /// use statushub_server::config::ServerConfig;
    ///
    /// let config = ServerConfig::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = parse_port()?;
        let reverse_proxies = parse_proxies()?;
        let settings_path = env::var("STATUSHUB_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_SETTINGS_PATH));
        let assets_dir = env::var("STATUSHUB_ASSETS")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_ASSETS_DIR));
        let session_secret = env::var("STATUSHUB_SESSION_SECRET").ok();

        let config = Self {
            port,
            settings_path,
            assets_dir,
            reverse_proxies,
            session_secret,
        };

        config.validate()?;

        if config.session_secret.is_none() {
            warn!(
                "STATUSHUB_SESSION_SECRET is not set - sessions will not survive a restart"
            );
        }

        Ok(config)
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if matches!(self.session_secret.as_deref(), Some(secret) if secret.trim().is_empty()) {
            return Err(ConfigError::ValidationError(
                "STATUSHUB_SESSION_SECRET cannot be empty".to_string(),
            ));
        }

        if self.settings_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "STATUSHUB_CONFIG cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => Ok(port_str.trim().parse()?),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: "PORT".to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

/// Parse the STATUSHUB_PROXIES environment variable.
fn parse_proxies() -> Result<usize, ConfigError> {
    match env::var("STATUSHUB_PROXIES") {
        Ok(raw) if raw.trim().is_empty() => Ok(0),
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidFormat {
            var: "STATUSHUB_PROXIES".to_string(),
            message: format!("expected a non-negative integer, got '{raw}'"),
        }),
        Err(_) => Ok(0),
    }
}
