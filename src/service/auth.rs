//! Authentication surface.
//!
//! The core treats identity as pluggable: a [`CredentialVerifier`] turns a
//! username/password pair into yes/no, and [`AuthService`] wraps it with
//! username validation and session-token issue/lookup. Nothing here persists
//! across process restarts.

use rand::RngCore;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::SystemTime;
use subtle::ConstantTimeEq;

use crate::config::AuthConfig;
use crate::error::{ChatError, Result};
use crate::protocol::message::ChatMessage;

/// Identity bound to a connection after successful authentication.
#[derive(Debug, Clone)]
pub struct Principal {
    /// Validated username
    pub username: String,
    /// Opaque session token issued by the server, 32 hex chars
    pub token: String,
    /// When the token was issued
    pub issued_at: SystemTime,
}

/// Pluggable credential check. The core never sees how credentials are
/// stored.
pub trait CredentialVerifier: Send + Sync + 'static {
    /// Accept or reject a username/password pair.
    fn verify_password(&self, username: &str, password: &str) -> Result<()>;
}

/// In-memory verifier over a static credential table.
///
/// Stands in for an external identity backend in deployments and tests.
pub struct StaticVerifier {
    users: BTreeMap<String, String>,
}

impl StaticVerifier {
    /// Build from an explicit table.
    pub fn new(users: BTreeMap<String, String>) -> Self {
        Self { users }
    }

    /// Build from the `[auth.users]` config section.
    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.users.clone())
    }
}

impl CredentialVerifier for StaticVerifier {
    fn verify_password(&self, username: &str, password: &str) -> Result<()> {
        let stored = self
            .users
            .get(username)
            .ok_or_else(|| ChatError::AuthFailed("unknown user".into()))?;

        if stored.as_bytes().ct_eq(password.as_bytes()).unwrap_u8() == 1 {
            Ok(())
        } else {
            Err(ChatError::AuthFailed("bad credentials".into()))
        }
    }
}

/// Username validation and token lifecycle around a verifier.
pub struct AuthService {
    verifier: Box<dyn CredentialVerifier>,
    /// token -> username, for re-auth within the process lifetime
    tokens: Mutex<HashMap<String, String>>,
}

impl AuthService {
    /// Wrap a verifier.
    pub fn new(verifier: Box<dyn CredentialVerifier>) -> Self {
        Self {
            verifier,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Authenticate an inbound auth frame and issue a principal.
    ///
    /// Accepts either a password (checked by the verifier) or a previously
    /// issued token.
    pub fn authenticate(&self, msg: &ChatMessage) -> Result<Principal> {
        let username = msg
            .field_str("username")
            .ok_or_else(|| ChatError::AuthFailed("missing username".into()))?;
        validate_username(username)?;

        if let Some(password) = msg.field_str("password") {
            self.verifier.verify_password(username, password)?;
            return Ok(self.issue(username));
        }

        if let Some(token) = msg.field_str("token") {
            let tokens = self
                .tokens
                .lock()
                .map_err(|_| ChatError::AuthFailed("token table unavailable".into()))?;
            return match tokens.get(token) {
                Some(owner) if owner == username => Ok(Principal {
                    username: username.to_string(),
                    token: token.to_string(),
                    issued_at: SystemTime::now(),
                }),
                _ => Err(ChatError::AuthFailed("invalid token".into())),
            };
        }

        Err(ChatError::AuthFailed("missing password or token".into()))
    }

    fn issue(&self, username: &str) -> Principal {
        let token = new_token();
        if let Ok(mut tokens) = self.tokens.lock() {
            // One live token per user.
            tokens.retain(|_, owner| owner != username);
            tokens.insert(token.clone(), username.to_string());
        }
        Principal {
            username: username.to_string(),
            token,
            issued_at: SystemTime::now(),
        }
    }
}

/// Enforce the username shape: 3-32 chars from `[A-Za-z0-9_]`.
pub fn validate_username(name: &str) -> Result<()> {
    if name.len() < 3 || name.len() > 32 {
        return Err(ChatError::AuthFailed(
            "username must be 3-32 characters".into(),
        ));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_')
    {
        return Err(ChatError::AuthFailed(
            "username may contain only letters, digits, and underscore".into(),
        ));
    }
    Ok(())
}

/// Fresh 128-bit session token as 32 hex chars.
fn new_token() -> String {
    let mut raw = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    hex::encode(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::MessageKind;
    use serde_json::Value;

    fn service() -> AuthService {
        let mut users = BTreeMap::new();
        users.insert("alice".to_string(), "Secret!1".to_string());
        AuthService::new(Box::new(StaticVerifier::new(users)))
    }

    fn auth_frame(username: &str, password: &str) -> ChatMessage {
        ChatMessage::new(MessageKind::Auth)
            .with_field("username", Value::String(username.into()))
            .with_field("password", Value::String(password.into()))
    }

    #[test]
    fn password_auth_issues_token() {
        let svc = service();
        let principal = svc.authenticate(&auth_frame("alice", "Secret!1")).unwrap();
        assert_eq!(principal.username, "alice");
        assert_eq!(principal.token.len(), 32);
        assert!(principal.token.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn wrong_password_rejected() {
        let svc = service();
        assert!(svc.authenticate(&auth_frame("alice", "nope")).is_err());
        assert!(svc.authenticate(&auth_frame("mallory", "Secret!1")).is_err());
    }

    #[test]
    fn token_reauth_roundtrip() {
        let svc = service();
        let principal = svc.authenticate(&auth_frame("alice", "Secret!1")).unwrap();

        let frame = ChatMessage::new(MessageKind::Auth)
            .with_field("username", Value::String("alice".into()))
            .with_field("token", Value::String(principal.token.clone()));
        let again = svc.authenticate(&frame).unwrap();
        assert_eq!(again.username, "alice");
    }

    #[test]
    fn token_bound_to_owner() {
        let svc = service();
        let principal = svc.authenticate(&auth_frame("alice", "Secret!1")).unwrap();

        let frame = ChatMessage::new(MessageKind::Auth)
            .with_field("username", Value::String("bob_impostor".into()))
            .with_field("token", Value::String(principal.token));
        assert!(svc.authenticate(&frame).is_err());
    }

    #[test]
    fn username_shape_enforced() {
        assert!(validate_username("ab").is_err());
        assert!(validate_username(&"x".repeat(33)).is_err());
        assert!(validate_username("has space").is_err());
        assert!(validate_username("dash-ed").is_err());
        assert!(validate_username("alice_01").is_ok());
    }
}
