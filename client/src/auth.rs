//! Bearer token handling.
//!
//! Token issuance belongs to the host application. The runtime only holds
//! the token, attaches it to requests and checks that it is still usable.

use listsync_engine::Timestamp;
use std::sync::{Arc, RwLock};

/// Why a token cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Auth token is empty")]
    Empty,

    #[error("Auth token expired at {0}")]
    Expired(Timestamp),
}

/// A bearer token with an optional known expiry (ms since epoch).
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken {
    secret: Arc<str>,
    expires_at: Option<Timestamp>,
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AuthToken")
            .field("secret", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl AuthToken {
    pub fn new(secret: impl AsRef<str>) -> Self {
        Self {
            secret: Arc::from(secret.as_ref().trim()),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: Timestamp) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn expires_at(&self) -> Option<Timestamp> {
        self.expires_at
    }

    /// Check the token at `now`.
    pub fn validate(&self, now: Timestamp) -> Result<(), AuthError> {
        if self.secret.is_empty() {
            return Err(AuthError::Empty);
        }
        match self.expires_at {
            Some(expires_at) if expires_at <= now => Err(AuthError::Expired(expires_at)),
            _ => Ok(()),
        }
    }
}

/// A token slot shared between the components that authenticate. A
/// re-login replaces the token for every holder at once.
#[derive(Debug, Clone)]
pub struct SharedToken(Arc<RwLock<AuthToken>>);

impl SharedToken {
    pub fn new(token: AuthToken) -> Self {
        Self(Arc::new(RwLock::new(token)))
    }

    pub fn get(&self) -> AuthToken {
        match self.0.read() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set(&self, token: AuthToken) {
        match self.0.write() {
            Ok(mut slot) => *slot = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_secret() {
        let token = AuthToken::new("super-secret").with_expiry(5);
        let debug = format!("{token:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("super-secret"));
    }

    #[test]
    fn validate_checks_emptiness_and_expiry() {
        assert_eq!(AuthToken::new("   ").validate(0), Err(AuthError::Empty));
        assert!(AuthToken::new("t").validate(u64::MAX).is_ok());

        let token = AuthToken::new("t").with_expiry(100);
        assert!(token.validate(99).is_ok());
        assert_eq!(token.validate(100), Err(AuthError::Expired(100)));
    }

    #[test]
    fn shared_token_updates_every_clone() {
        let shared = SharedToken::new(AuthToken::new("old"));
        let other = shared.clone();
        other.set(AuthToken::new("new"));
        assert_eq!(shared.get().secret(), "new");
    }
}
