//! Control-plane authentication.
//!
//! Front-end processes and supervisor shards share a secret token. A shard
//! configured with a token requires every inbound control connection to send
//! `{"control":"auth","token":...}` before anything else; a shard without a
//! token accepts every connection as already authenticated.
//!
//! # Example
//!
//! ```
//! use thingcloud_common::auth::AuthConfig;
//!
//! let auth = AuthConfig::with_token("s3cret");
//! assert!(auth.requires_auth());
//! assert!(auth.validate_token("s3cret"));
//! assert!(!auth.validate_token("guess"));
//! ```

use std::fmt;

/// Environment variable consulted for the shared control token.
pub const CONTROL_TOKEN_ENV: &str = "THINGCLOUD_CONTROL_TOKEN";

/// Authentication configuration for a control-plane endpoint.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    token: Option<String>,
}

impl AuthConfig {
    /// Requires peers to present `token`.
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    /// Accepts every peer.
    pub fn disabled() -> Self {
        Self { token: None }
    }

    /// Builds a config from an optional token, treating an empty string as
    /// "no authentication".
    pub fn from_optional(token: Option<String>) -> Self {
        match token {
            Some(token) if !token.is_empty() => Self::with_token(token),
            _ => Self::disabled(),
        }
    }

    pub fn requires_auth(&self) -> bool {
        self.token.is_some()
    }

    /// The token a client should send, if any.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Validates a presented token using constant-time comparison.
    ///
    /// Always `true` when authentication is disabled.
    pub fn validate_token(&self, provided: &str) -> bool {
        match &self.token {
            Some(expected) => constant_time_eq(expected, provided),
            None => true,
        }
    }
}

impl fmt::Display for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.token {
            Some(_) => write!(f, "Token(*****)"),
            None => write!(f, "Disabled"),
        }
    }
}

/// Compares two tokens without short-circuiting on the first mismatch.
fn constant_time_eq(expected: &str, provided: &str) -> bool {
    let (expected, provided) = (expected.as_bytes(), provided.as_bytes());
    if expected.len() != provided.len() {
        return false;
    }
    expected
        .iter()
        .zip(provided)
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}
