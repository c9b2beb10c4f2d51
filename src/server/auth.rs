//! Handshake authentication seam.
//!
//! Token validation belongs to an external auth collaborator; this module
//! only defines the seam the WebSocket handler calls into, plus a static
//! token map implementation so the standalone binary and the tests can run
//! without one.

use std::collections::HashMap;

use crate::config::AuthConfig;

/// Resolves a bearer credential presented at handshake time.
///
/// Returning `None` rejects the handshake: the connection is closed
/// immediately and no session is created.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Option<String>;
}

/// Authenticator backed by a fixed token -> user-id map.
#[derive(Debug, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, String>,
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token for a user.
    pub fn insert(mut self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), user_id.into());
        self
    }
}

impl From<&AuthConfig> for StaticTokenAuthenticator {
    fn from(config: &AuthConfig) -> Self {
        Self {
            tokens: config.tokens.clone(),
        }
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn authenticate(&self, token: &str) -> Option<String> {
        self.tokens.get(token).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_token_resolves_user() {
        let auth = StaticTokenAuthenticator::new().insert("tok-1", "u-1");
        assert_eq!(auth.authenticate("tok-1"), Some("u-1".to_string()));
    }

    #[test]
    fn test_unknown_token_rejected() {
        let auth = StaticTokenAuthenticator::new().insert("tok-1", "u-1");
        assert_eq!(auth.authenticate("tok-2"), None);
        assert_eq!(StaticTokenAuthenticator::new().authenticate(""), None);
    }
}
