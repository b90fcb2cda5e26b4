//! Token lookup from Kubernetes Secrets.

use super::{AccessToken, AuthError, AuthResolver};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use tracing::debug;

/// Data key holding the bearer token
pub const TOKEN_KEY: &str = "token";

/// Reads the token from the `token` key of the Secret named by the auth reference.
///
/// The reference is either `name` (looked up in the resource namespace) or
/// `namespace/name`.
#[derive(Clone)]
pub struct KubeSecretTokenResolver {
    client: Client,
}

impl std::fmt::Debug for KubeSecretTokenResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeSecretTokenResolver").finish_non_exhaustive()
    }
}

impl KubeSecretTokenResolver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AuthResolver for KubeSecretTokenResolver {
    async fn resolve(
        &self,
        auth_ref: Option<&str>,
        namespace: &str,
    ) -> Result<AccessToken, AuthError> {
        let binding = auth_ref.filter(|r| !r.is_empty()).ok_or(AuthError::NoAuthRef)?;
        let (secret_namespace, secret_name) = split_reference(binding, namespace)?;

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), secret_namespace);
        let secret = match secrets.get(secret_name).await {
            Ok(secret) => secret,
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => {
                return Err(AuthError::MissingBinding(binding.to_string()));
            }
            Err(e) => {
                return Err(AuthError::Unavailable {
                    binding: binding.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        debug!(
            secret.namespace = secret_namespace,
            secret.name = secret_name,
            "Resolved auth binding"
        );
        token_from_secret(binding, &secret)
    }
}

/// Split `namespace/name` or `name` into its parts
fn split_reference<'a>(
    binding: &'a str,
    default_namespace: &'a str,
) -> Result<(&'a str, &'a str), AuthError> {
    match binding.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((ns, name))
        }
        Some(_) => Err(AuthError::Invalid {
            binding: binding.to_string(),
            reason: "expected 'name' or 'namespace/name'".to_string(),
        }),
        None => Ok((default_namespace, binding)),
    }
}

fn token_from_secret(binding: &str, secret: &Secret) -> Result<AccessToken, AuthError> {
    let raw = secret
        .data
        .as_ref()
        .and_then(|data| data.get(TOKEN_KEY))
        .ok_or_else(|| AuthError::Invalid {
            binding: binding.to_string(),
            reason: format!("secret has no '{TOKEN_KEY}' key"),
        })?;

    let token = std::str::from_utf8(&raw.0)
        .map(str::trim)
        .map_err(|_| AuthError::Invalid {
            binding: binding.to_string(),
            reason: format!("'{TOKEN_KEY}' is not valid UTF-8"),
        })?;

    if token.is_empty() {
        return Err(AuthError::Invalid {
            binding: binding.to_string(),
            reason: format!("'{TOKEN_KEY}' is empty"),
        });
    }
    Ok(AccessToken::new(token))
}
