use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::Credentials;

/// Result type for authentication operations.
pub type AuthResult<T> = Result<T, AuthError>;

/// Errors that can occur during authentication.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The presented credentials could not be decoded.
    #[error("Malformed credentials")]
    Malformed,
}

/// Trait for authentication engines.
///
/// Implementations decide whether a username/password pair is accepted,
/// the SMTP and HTTP surfaces use different engines.
pub trait AuthEngine: Send + Sync {
    /// Returns `Ok(true)` if the credentials are accepted.
    fn authenticate(&self, username: &str, password: &str) -> AuthResult<bool>;
}

/// Engine accepting any username/password pair.
///
/// Lets SMTP clients that insist on authenticating proceed, it is not an
/// access control.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissiveAuthEngine;

impl AuthEngine for PermissiveAuthEngine {
    fn authenticate(&self, _username: &str, _password: &str) -> AuthResult<bool> {
        Ok(true)
    }
}

/// In-memory authentication engine using a HashMap.
#[derive(Debug, Clone)]
pub struct MemoryAuthEngine {
    credentials: Arc<HashMap<String, String>>,
}

impl MemoryAuthEngine {
    /// Creates a MemoryAuthEngine accepting a single user.
    pub fn from_credentials(credentials: &Credentials) -> Self {
        Self {
            credentials: Arc::new(HashMap::from([(
                credentials.username.clone(),
                credentials.password.clone(),
            )])),
        }
    }
}

impl AuthEngine for MemoryAuthEngine {
    fn authenticate(&self, username: &str, password: &str) -> AuthResult<bool> {
        match self.credentials.get(username) {
            Some(stored_password) => Ok(stored_password == password),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{AuthEngine, AuthError, Credentials, MemoryAuthEngine, PermissiveAuthEngine};

    #[test]
    fn test_permissive_engine_accepts_anything() {
        let engine = PermissiveAuthEngine;
        assert!(engine.authenticate("anyone", "whatever").unwrap());
        assert!(engine.authenticate("", "").unwrap());
    }

    #[test]
    fn test_memory_engine_from_credentials() {
        let credentials: Credentials = "admin:secret".parse().unwrap();
        let engine = MemoryAuthEngine::from_credentials(&credentials);

        assert!(engine.authenticate("admin", "secret").unwrap());
        assert!(!engine.authenticate("admin", "wrong").unwrap());
        assert!(!engine.authenticate("other", "secret").unwrap());
        assert!(!engine.authenticate("", "").unwrap());
    }

    #[test]
    fn test_auth_error_display() {
        assert_eq!(AuthError::Malformed.to_string(), "Malformed credentials");
    }
}
