//! Stateless signed session tokens.
//!
//! A session token carries its own expiry and a signature over it, so the
//! server keeps no session table. Tokens survive a restart only when the
//! signing secret is configured.
//!
//! # Token Format
//!
//! ```text
//! <expiry unix seconds>-<hex(sha256(secret || expiry || secret))>
//! ```
//!
//! # Example
//!
//! ```rust
//! use statushub_server::session::SessionAuthority;
//!
//! let sessions = SessionAuthority::new(Some("secret".to_string()));
//! let token = sessions.issue_token();
//! assert!(sessions.verify(&token));
//! assert!(!sessions.verify("12345-deadbeef"));
//! ```

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::trace;

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "shsess";

/// Lifetime of an issued session.
pub const SESSION_VALIDITY: Duration = Duration::from_secs(60 * 24 * 60 * 60);

/// Size of a generated secret in bytes.
const SECRET_BYTES: usize = 16;

/// Issues and verifies session tokens with one process-wide secret.
#[derive(Clone)]
pub struct SessionAuthority {
    secret: String,
    validity: Duration,
}

impl SessionAuthority {
    /// Creates an authority that signs with `secret`, or with a random
    /// secret if none is given.
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret.unwrap_or_else(generate_secret),
            validity: SESSION_VALIDITY,
        }
    }

    /// Lifetime of tokens issued by this authority.
    pub fn validity(&self) -> Duration {
        self.validity
    }

    /// Issues a token valid from now.
    pub fn issue_token(&self) -> String {
        self.issue_token_at(Utc::now().timestamp())
    }

    /// Issues a token as if the current time were `now` (unix seconds).
    pub fn issue_token_at(&self, now: i64) -> String {
        let expiry = now.saturating_add(self.validity.as_secs() as i64);
        let data = expiry.to_string();
        let signature = self.sign(&data);
        format!("{data}-{signature}")
    }

    /// Returns `true` if `token` is well formed, correctly signed and not
    /// expired.
    pub fn verify(&self, token: &str) -> bool {
        self.verify_at(token, Utc::now().timestamp())
    }

    /// Verifies `token` as if the current time were `now` (unix seconds).
    pub fn verify_at(&self, token: &str, now: i64) -> bool {
        let mut parts = token.split('-');
        let (Some(data), Some(signature), None) = (parts.next(), parts.next(), parts.next())
        else {
            trace!("Malformed session token");
            return false;
        };

        let expected = self.sign(data);
        if !bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
            trace!("Session signature mismatch");
            return false;
        }

        match data.parse::<i64>() {
            Ok(expiry) => now <= expiry,
            Err(_) => false,
        }
    }

    fn sign(&self, data: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(data.as_bytes());
        hasher.update(self.secret.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl std::fmt::Debug for SessionAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionAuthority")
            .field("secret", &"<redacted>")
            .field("validity", &self.validity)
            .finish()
    }
}

fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}
