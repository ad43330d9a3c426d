//! Error types for the StatusHub server.
//!
//! # Error Types
//!
//! - [`StoreError`] - Lookups against unknown services or media folders
//! - [`ServerError`] - Top-level server errors encompassing all failure modes
//!
//! Settings and stream errors live next to the code that produces them
//! ([`crate::settings::SettingsError`], [`crate::stream::StreamError`]) and
//! convert into [`ServerError`] with `?`. Environment errors
//! ([`crate::config::ConfigError`]) only occur at startup and are reported by
//! the binary directly.
//!
//! # Example
//!
//! ```rust
//! use statushub_server::error::{ServerError, StoreError};
//!
//! fn lookup() -> Result<(), ServerError> {
//!     Err(StoreError::UnknownService("backup".into()))?;
//!     Ok(())
//! }
//!
//! assert!(matches!(lookup(), Err(ServerError::NotFound(_))));
//! ```

use std::error::Error;
use std::fmt;

use thiserror::Error as ThisError;

use crate::settings::SettingsError;
use crate::stream::StreamError;

/// Errors returned by event store lookups.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No records exist for the named service.
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// No records exist in the named media folder.
    #[error("unknown media folder: {0}")]
    UnknownFolder(String),
}

/// Top-level error type for the StatusHub server.
///
/// # Error Categories
///
/// - **Not found**: unknown service, folder or media id
/// - **Unauthenticated**: missing, malformed or expired session
/// - **Rate limiting**: login budget exhausted for a client
/// - **Validation**: malformed request bodies or rejected settings
/// - **Persistence**: the settings file could not be written
/// - **Transport**: a streaming peer went away
#[derive(Debug)]
pub enum ServerError {
    /// The requested service, folder or media record does not exist.
    NotFound(String),

    /// The request carried no valid session.
    Unauthenticated,

    /// Request validation failure.
    Validation(String),

    /// Login attempts exhausted.
    RateLimit {
        /// Identity of the rate-limited client.
        source: String,
        /// Number of seconds until the attempt window resets.
        retry_after: u64,
    },

    /// Settings could not be persisted; in-memory settings were rolled back.
    Persistence(SettingsError),

    /// A streaming connection failed.
    Transport(String),

    /// Unexpected internal server error.
    Internal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(msg) => f.write_str(msg),
            Self::Unauthenticated => f.write_str("not authenticated"),
            Self::Validation(msg) => f.write_str(msg),
            Self::RateLimit { retry_after, .. } => {
                write!(
                    f,
                    "too many login attempts, retry after {retry_after} seconds"
                )
            }
            Self::Persistence(err) => write!(f, "could not save settings: {err}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Internal(msg) => write!(f, "internal server error: {msg}"),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Persistence(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        Self::NotFound(err.to_string())
    }
}

impl From<SettingsError> for ServerError {
    fn from(err: SettingsError) -> Self {
        match err {
            SettingsError::Invalid(msg) => Self::Validation(msg),
            other => Self::Persistence(other),
        }
    }
}

impl From<StreamError> for ServerError {
    fn from(err: StreamError) -> Self {
        Self::Transport(err.to_string())
    }
}

impl ServerError {
    /// Creates a new not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Creates a new validation error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use statushub_server::error::ServerError;
    ///
    /// let err = ServerError::validation("passwords do not match");
    /// assert!(matches!(err, ServerError::Validation(_)));
    /// ```
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a new rate limit error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use statushub_server::error::ServerError;
    ///
    /// let err = ServerError::rate_limit("192.168.1.1", 60);
    /// assert!(matches!(err, ServerError::RateLimit { .. }));
    /// ```
    pub fn rate_limit(source: impl Into<String>, retry_after: u64) -> Self {
        Self::RateLimit {
            source: source.into(),
            retry_after,
        }
    }

    /// Creates a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Short machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Unauthenticated => "not_authenticated",
            Self::Validation(_) => "invalid_request",
            Self::RateLimit { .. } => "rate_limited",
            Self::Persistence(_) => "persistence_failed",
            Self::Transport(_) => "transport_error",
            Self::Internal(_) => "server_error",
        }
    }

    /// Returns `true` if this error indicates a client-side problem.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::Unauthenticated | Self::Validation(_) | Self::RateLimit { .. }
        )
    }

    /// Returns `true` if this error indicates a server-side problem.
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            Self::Persistence(_) | Self::Internal(_)
        )
    }
}

/// A specialized Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
