//! Session tokens and the "is this caller authenticated" capability.
//!
//! Tokens have the form `user.expiry.signature`, where `expiry` is a unix
//! timestamp and `signature` is the hex HMAC-SHA256 of `user.expiry`.
//! Clients send them as `Authorization: Bearer <token>` or in the session
//! cookie.

use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::http::header::{AUTHORIZATION, COOKIE};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("malformed token")]
    Malformed,
    #[error("bad signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("invalid user name")]
    InvalidUser,
    #[error("unusable signing secret")]
    InvalidSecret,
}

/// Issues and verifies session tokens with a shared secret.
#[derive(Clone)]
pub struct SessionSigner {
    secret: Vec<u8>,
}

impl SessionSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self, payload: &str) -> Result<HmacSha256, AuthError> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).map_err(|_| AuthError::InvalidSecret)?;
        mac.update(payload.as_bytes());
        Ok(mac)
    }

    /// Token for `user` valid until `expires_at` (unix seconds).
    pub fn issue(&self, user: &str, expires_at: i64) -> Result<String, AuthError> {
        if user.is_empty() || user.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(AuthError::InvalidUser);
        }
        let payload = format!("{user}.{expires_at}");
        let signature = hex::encode(self.mac(&payload)?.finalize().into_bytes());
        Ok(format!("{payload}.{signature}"))
    }

    /// Return the user named by a valid, unexpired token.
    pub fn verify(&self, token: &str, now: i64) -> Result<String, AuthError> {
        let mut parts = token.rsplitn(3, '.');
        let (Some(signature), Some(expiry), Some(user)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::Malformed);
        };
        if user.is_empty() {
            return Err(AuthError::Malformed);
        }
        let expires_at: i64 = expiry.parse().map_err(|_| AuthError::Malformed)?;
        let signature = hex::decode(signature).map_err(|_| AuthError::Malformed)?;

        self.mac(&format!("{user}.{expiry}"))?
            .verify_slice(&signature)
            .map_err(|_| AuthError::BadSignature)?;

        if expires_at <= now {
            return Err(AuthError::Expired);
        }
        Ok(user.to_string())
    }
}

/// Pull a token from the `Authorization` header or the named cookie.
pub fn extract_token(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    if let Some(token) = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        return Some(token.to_string());
    }

    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == cookie_name)
        .map(|(_, value)| value.to_string())
        .filter(|t| !t.is_empty())
}

// ── Capability ───────────────────────────────────────────────────

/// The orchestrator's only view of authentication.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuthCheck: Send + Sync {
    async fn is_authenticated(&self) -> bool;
}

/// Local sessions have no caller to check.
pub struct AlwaysAuthenticated;

#[async_trait]
impl AuthCheck for AlwaysAuthenticated {
    async fn is_authenticated(&self) -> bool {
        true
    }
}

/// A caller the gateway already verified.
pub struct VerifiedUser(pub String);

#[async_trait]
impl AuthCheck for VerifiedUser {
    async fn is_authenticated(&self) -> bool {
        !self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn issue_then_verify() {
        let signer = SessionSigner::new("secret");
        let token = signer.issue("alice", NOW + 60).unwrap();
        assert_eq!(signer.verify(&token, NOW).unwrap(), "alice");
    }

    #[test]
    fn user_names_may_contain_dots() {
        let signer = SessionSigner::new("secret");
        let token = signer.issue("a.b@example.com", NOW + 60).unwrap();
        assert_eq!(signer.verify(&token, NOW).unwrap(), "a.b@example.com");
    }

    #[test]
    fn rejects_expired() {
        let signer = SessionSigner::new("secret");
        let token = signer.issue("alice", NOW).unwrap();
        assert_eq!(signer.verify(&token, NOW), Err(AuthError::Expired));
    }

    #[test]
    fn rejects_other_secret_and_tampering() {
        let token = SessionSigner::new("one").issue("alice", NOW + 60).unwrap();
        let other = SessionSigner::new("two");
        assert_eq!(other.verify(&token, NOW), Err(AuthError::BadSignature));

        let signer = SessionSigner::new("one");
        let forged = token.replacen("alice", "mallory", 1);
        assert_eq!(signer.verify(&forged, NOW), Err(AuthError::BadSignature));
    }

    #[test]
    fn rejects_garbage() {
        let signer = SessionSigner::new("secret");
        assert_eq!(signer.verify("nope", NOW), Err(AuthError::Malformed));
        assert_eq!(signer.verify("a.b.zz", NOW), Err(AuthError::Malformed));
        assert_eq!(signer.verify(".1.00", NOW), Err(AuthError::Malformed));
        assert!(signer.issue("bad user", NOW).is_err());
    }

    #[test]
    fn token_from_bearer_or_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("theme=dark; voxroom-session=abc.1.ff"));
        assert_eq!(
            extract_token(&headers, "voxroom-session").as_deref(),
            Some("abc.1.ff")
        );

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer xyz"));
        assert_eq!(extract_token(&headers, "voxroom-session").as_deref(), Some("xyz"));

        assert!(extract_token(&HeaderMap::new(), "voxroom-session").is_none());
    }

    #[tokio::test]
    async fn verified_user_is_authenticated() {
        assert!(VerifiedUser("alice".into()).is_authenticated().await);
        assert!(AlwaysAuthenticated.is_authenticated().await);
    }
}
