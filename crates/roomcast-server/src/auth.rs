//! Connection authentication.
//!
//! Token validation belongs to an external identity service. The server
//! only asks a [`PrincipalVerifier`] whether an upgrade request may proceed
//! and which principal it acts for.

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::config::AuthConfig;

/// The verified identity a connection acts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal(String);

impl Principal {
    /// Create a principal.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The unauthenticated principal.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::new("anonymous")
    }

    /// Principal name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authentication errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No token was presented.
    #[error("Missing bearer token")]
    MissingToken,

    /// The token was rejected.
    #[error("Invalid token")]
    InvalidToken,
}

/// Decides whether a connection may be established.
#[async_trait]
pub trait PrincipalVerifier: Send + Sync {
    /// Verify an optional bearer token.
    async fn verify(&self, token: Option<&str>) -> Result<Principal, AuthError>;
}

/// Accepts every connection as [`Principal::anonymous`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousVerifier;

#[async_trait]
impl PrincipalVerifier for AnonymousVerifier {
    async fn verify(&self, _token: Option<&str>) -> Result<Principal, AuthError> {
        Ok(Principal::anonymous())
    }
}

/// Requires a non-empty token and uses it as the principal name.
///
/// Placeholder for a verifier backed by the identity service.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequireTokenVerifier;

#[async_trait]
impl PrincipalVerifier for RequireTokenVerifier {
    async fn verify(&self, token: Option<&str>) -> Result<Principal, AuthError> {
        match token.map(str::trim) {
            None => Err(AuthError::MissingToken),
            Some("") => Err(AuthError::InvalidToken),
            Some(token) => Ok(Principal::new(token)),
        }
    }
}

/// Pick the verifier for a configuration.
#[must_use]
pub fn verifier_for(config: &AuthConfig) -> Arc<dyn PrincipalVerifier> {
    if config.required {
        Arc::new(RequireTokenVerifier)
    } else {
        Arc::new(AnonymousVerifier)
    }
}

/// Extract a token from `Authorization: Bearer <token>`.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[tokio::test]
    async fn test_anonymous() {
        let principal = AnonymousVerifier.verify(None).await.unwrap();
        assert_eq!(principal.name(), "anonymous");
    }

    #[tokio::test]
    async fn test_require_token() {
        let verifier = RequireTokenVerifier;
        assert_eq!(verifier.verify(None).await, Err(AuthError::MissingToken));
        assert_eq!(verifier.verify(Some("  ")).await, Err(AuthError::InvalidToken));
        assert_eq!(
            verifier.verify(Some("alice")).await,
            Ok(Principal::new("alice"))
        );
    }

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }
}
