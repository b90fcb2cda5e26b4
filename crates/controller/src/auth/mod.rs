//! # Authentication
//!
//! Turns an auth reference into a bearer token for the credential authority.
//!
//! Resolution is pluggable through [`AuthResolver`]:
//!
//! - [`StaticTokenResolver`] - one token for every resource (`VAULT_TOKEN`, dev mode)
//! - [`KubeSecretTokenResolver`] - token stored in a Kubernetes Secret named by the auth reference

mod secret;

pub use secret::KubeSecretTokenResolver;

use async_trait::async_trait;
use thiserror::Error;
use zeroize::Zeroizing;

/// Bearer credential for the credential authority. Wiped on drop, never printed.
#[derive(Clone)]
pub struct AccessToken(Zeroizing<String>);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Zeroizing::new(token.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("no auth reference set and no default auth binding configured")]
    NoAuthRef,
    #[error("auth binding '{0}' not found")]
    MissingBinding(String),
    #[error("auth binding '{binding}' is invalid: {reason}")]
    Invalid { binding: String, reason: String },
    #[error("failed to resolve auth binding '{binding}': {reason}")]
    Unavailable { binding: String, reason: String },
}

impl AuthError {
    /// Missing or malformed bindings wait for a spec change; API failures are retried
    pub fn is_transient(&self) -> bool {
        matches!(self, AuthError::Unavailable { .. })
    }
}

#[async_trait]
pub trait AuthResolver: Send + Sync {
    /// Produce a token for `auth_ref`, interpreted relative to the resource's namespace
    async fn resolve(&self, auth_ref: Option<&str>, namespace: &str)
        -> Result<AccessToken, AuthError>;
}

/// Hands out the same token regardless of the auth reference
#[derive(Debug, Clone)]
pub struct StaticTokenResolver {
    token: AccessToken,
}

impl StaticTokenResolver {
    pub fn new(token: AccessToken) -> Self {
        Self { token }
    }
}

#[async_trait]
impl AuthResolver for StaticTokenResolver {
    async fn resolve(
        &self,
        _auth_ref: Option<&str>,
        _namespace: &str,
    ) -> Result<AccessToken, AuthError> {
        Ok(self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_token_debug_is_redacted() {
        let token = AccessToken::new("hvs.secret");
        assert_eq!(format!("{token:?}"), "AccessToken(***)");
        assert_eq!(token.expose(), "hvs.secret");
    }

    #[tokio::test]
    async fn test_static_resolver_ignores_reference() {
        let resolver = StaticTokenResolver::new(AccessToken::new("root"));
        let token = resolver.resolve(None, "default").await.unwrap();
        assert_eq!(token.expose(), "root");
    }

    #[test]
    fn test_only_unavailable_is_transient() {
        assert!(AuthError::Unavailable {
            binding: "a".into(),
            reason: "timeout".into()
        }
        .is_transient());
        assert!(!AuthError::NoAuthRef.is_transient());
        assert!(!AuthError::MissingBinding("a".into()).is_transient());
    }
}
