//! Request authentication helpers.
//!
//! This module covers the pieces of login and session handling that do not
//! depend on the router:
//!
//! - password hashing and constant-time hash comparison
//! - reading the session cookie from request headers
//! - building `Set-Cookie` values for login and logout
//! - deriving the client identity used for login rate limiting
//!
//! # Example
//!
//! ```rust
//! use axum::http::{header, HeaderMap, HeaderValue};
//! use statushub_server::auth::{authenticate, AuthError};
//! use statushub_server::session::SessionAuthority;
//!
//! let sessions = SessionAuthority::new(Some("secret".into()));
//! let mut headers = HeaderMap::new();
//! assert_eq!(authenticate(&headers, &sessions), Err(AuthError::MissingSession));
//!
//! let cookie = format!("shsess={}", sessions.issue_token());
//! headers.insert(header::COOKIE, HeaderValue::from_str(&cookie).unwrap());
//! assert!(authenticate(&headers, &sessions).is_ok());
//! ```

use std::net::SocketAddr;

use axum::http::{header, HeaderMap};
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::session::{SessionAuthority, SESSION_COOKIE};

/// Header carrying the client chain when behind reverse proxies.
const HEADER_FORWARDED_FOR: &str = "X-Forwarded-For";

/// Identity used when the peer address is unavailable.
const UNKNOWN_IDENTITY: &str = "unknown";

/// Cookie value written on logout.
const LOGGED_OUT_VALUE: &str = "none";

/// Reasons a request failed session authentication.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The request carried no session cookie.
    #[error("missing session cookie")]
    MissingSession,

    /// The session cookie was malformed, forged or expired.
    #[error("invalid session")]
    InvalidSession,
}

/// Hashes a password as lowercase hex SHA-512.
///
/// The hash is unsalted to stay compatible with existing settings files.
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha512::digest(password.as_bytes()))
}

/// Returns `true` if `candidate` hashes to `stored_hash`.
///
/// The comparison runs in constant time.
pub fn verify_password_hash(candidate: &str, stored_hash: &str) -> bool {
    let computed = hash_password(candidate);
    computed
        .as_bytes()
        .ct_eq(stored_hash.to_ascii_lowercase().as_bytes())
        .into()
}

/// Extracts the session cookie value from the request headers.
pub fn session_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim_matches('"'))
}

/// Checks that the request carries a valid session.
///
/// # Errors
///
/// Returns [`AuthError::MissingSession`] without a cookie and
/// [`AuthError::InvalidSession`] if the cookie fails verification.
pub fn authenticate(headers: &HeaderMap, sessions: &SessionAuthority) -> Result<(), AuthError> {
    let token = session_token(headers).ok_or(AuthError::MissingSession)?;
    if sessions.verify(token) {
        Ok(())
    } else {
        Err(AuthError::InvalidSession)
    }
}

/// Builds the `Set-Cookie` value for a freshly issued session.
pub fn session_cookie(token: &str, sessions: &SessionAuthority) -> String {
    format!(
        "{SESSION_COOKIE}={token}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
        sessions.validity().as_secs()
    )
}

/// Builds the `Set-Cookie` value that ends a session.
pub fn logout_cookie() -> String {
    format!("{SESSION_COOKIE}={LOGGED_OUT_VALUE}; Path=/; Max-Age=0; HttpOnly; SameSite=Lax")
}

/// Derives the identity of the client for login rate limiting.
///
/// With `reverse_proxies` trusted proxies in front of the server, the client
/// is the entry that many positions from the right of `X-Forwarded-For`,
/// clamped to the leftmost entry. Without proxies or without the header the
/// peer IP address is used.
pub fn client_identity(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    reverse_proxies: usize,
) -> String {
    if reverse_proxies > 0 {
        let forwarded: Vec<&str> = headers
            .get_all(HEADER_FORWARDED_FOR)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .collect();
        if !forwarded.is_empty() {
            let index = forwarded.len().saturating_sub(reverse_proxies);
            return forwarded[index].to_string();
        }
    }

    peer.map_or_else(
        || UNKNOWN_IDENTITY.to_string(),
        |addr| addr.ip().to_string(),
    )
}
