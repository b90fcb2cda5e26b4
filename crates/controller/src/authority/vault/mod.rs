//! # Vault PKI Client
//!
//! [`CertificateAuthority`] implementation for the Vault PKI secrets engine,
//! using the HTTP API directly via `reqwest`.
//!
//! Every request carries a bounded timeout. Requests are sent exactly once;
//! a timeout surfaces as [`AuthorityError::Unreachable`].

mod requests;
mod responses;

use crate::auth::AccessToken;
use crate::authority::{
    AuthorityError, AuthorityOperation, CertificateAuthority, IssueRequest, IssuedCertificate,
    RevokeRequest,
};
use crate::observability::metrics;
use async_trait::async_trait;
use chrono::DateTime;
use reqwest::StatusCode;
use std::time::{Duration, Instant};
use tracing::{debug, field, info_span, warn, Instrument, Span};

use requests::{IssueCertificateRequest, RevokeCertificateRequest};
use responses::{IssueCertificateData, VaultErrorResponse, VaultResponse};

const TOKEN_HEADER: &str = "X-Vault-Token";
const NAMESPACE_HEADER: &str = "X-Vault-Namespace";

/// Vault PKI REST client
#[derive(Debug, Clone)]
pub struct VaultPkiClient {
    http_client: reqwest::Client,
    address: String,
}

impl VaultPkiClient {
    /// Create a client for the Vault server at `address`
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built (TLS backend setup).
    pub fn new(address: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            address: address.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn url(&self, mount: &str, path: &str) -> String {
        format!("{}/v1/{}/{}", self.address, mount.trim_matches('/'), path)
    }

    fn make_request(
        &self,
        url: &str,
        token: &AccessToken,
        namespace: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let builder = self
            .http_client
            .post(url)
            .header(TOKEN_HEADER, token.expose());
        match namespace.filter(|ns| !ns.is_empty()) {
            Some(ns) => builder.header(NAMESPACE_HEADER, ns),
            None => builder,
        }
    }
}

#[async_trait]
impl CertificateAuthority for VaultPkiClient {
    async fn issue(
        &self,
        token: &AccessToken,
        request: &IssueRequest,
    ) -> Result<IssuedCertificate, AuthorityError> {
        let span = info_span!(
            "vault.pki.issue",
            pki.mount = %request.mount,
            pki.role = %request.role,
            certificate.common_name = %request.common_name,
            operation.duration_ms = field::Empty,
            operation.success = field::Empty,
        );
        let url = self.url(&request.mount, &format!("issue/{}", request.role));

        async move {
            let tracker = OperationTracker::new(AuthorityOperation::Issue);

            let response = self
                .make_request(&url, token, request.namespace.as_deref())
                .json(&IssueCertificateRequest::from(request))
                .send()
                .await
                .map_err(|e| tracker.fail(transport_error(&e)))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(tracker.fail(classify_error(AuthorityOperation::Issue, status, &body)));
            }

            let envelope: VaultResponse<IssueCertificateData> =
                response.json().await.map_err(|e| {
                    tracker.fail(AuthorityError::UnexpectedResponse(format!(
                        "failed to decode issue response: {e}"
                    )))
                })?;
            for warning in envelope.warnings.iter().flatten() {
                warn!(warning = %warning, "Vault returned a warning for issue request");
            }

            let data = envelope.data;
            let not_after = DateTime::from_timestamp(data.expiration, 0).ok_or_else(|| {
                tracker.fail(AuthorityError::UnexpectedResponse(format!(
                    "expiration {} is out of range",
                    data.expiration
                )))
            })?;

            tracker.succeed();
            debug!(serial_number = %data.serial_number, expiration = %not_after, "Issued certificate");

            Ok(IssuedCertificate {
                serial_number: data.serial_number,
                certificate: data.certificate,
                private_key: data.private_key,
                private_key_type: data.private_key_type,
                issuing_ca: data.issuing_ca,
                ca_chain: data.ca_chain.unwrap_or_default(),
                not_before: None,
                not_after,
            })
        }
        .instrument(span)
        .await
    }

    async fn revoke(
        &self,
        token: &AccessToken,
        request: &RevokeRequest,
    ) -> Result<(), AuthorityError> {
        let span = info_span!(
            "vault.pki.revoke",
            pki.mount = %request.mount,
            certificate.serial_number = %request.serial_number,
            operation.duration_ms = field::Empty,
            operation.success = field::Empty,
        );
        let url = self.url(&request.mount, "revoke");

        async move {
            let tracker = OperationTracker::new(AuthorityOperation::Revoke);

            let response = self
                .make_request(&url, token, request.namespace.as_deref())
                .json(&RevokeCertificateRequest::from(request))
                .send()
                .await
                .map_err(|e| tracker.fail(transport_error(&e)))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(tracker.fail(classify_error(
                    AuthorityOperation::Revoke,
                    status,
                    &body,
                )));
            }

            tracker.succeed();
            debug!("Revoked certificate");
            Ok(())
        }
        .instrument(span)
        .await
    }
}

/// Map a non-success Vault response onto the authority error taxonomy
pub fn classify_error(operation: AuthorityOperation, status: StatusCode, body: &str) -> AuthorityError {
    let message = vault_error_message(status, body);
    let lowered = message.to_lowercase();

    if operation == AuthorityOperation::Revoke
        && (status.is_client_error() || status.is_server_error())
        && lowered.contains("not found")
    {
        return AuthorityError::NotFound(message);
    }

    match status.as_u16() {
        400 if lowered.contains("role") => AuthorityError::InvalidRole(message),
        400 => AuthorityError::InvalidRequest(message),
        401 | 403 => AuthorityError::Denied(message),
        404 => match operation {
            AuthorityOperation::Issue => AuthorityError::InvalidRole(message),
            AuthorityOperation::Revoke => AuthorityError::NotFound(message),
        },
        408 | 429 | 500..=599 => AuthorityError::Unreachable(format!("HTTP {status}: {message}")),
        _ => AuthorityError::UnexpectedResponse(format!("HTTP {status}: {message}")),
    }
}

fn vault_error_message(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<VaultErrorResponse>(body)
        .ok()
        .map(|response| response.errors.join("; "))
        .filter(|joined| !joined.is_empty())
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                status.to_string()
            } else {
                trimmed.to_string()
            }
        })
}

fn transport_error(error: &reqwest::Error) -> AuthorityError {
    if error.is_timeout() {
        AuthorityError::Unreachable(format!("request timed out: {error}"))
    } else {
        AuthorityError::Unreachable(error.to_string())
    }
}

/// Records duration and outcome of one authority call on the current span and in metrics
struct OperationTracker {
    start: Instant,
    operation: AuthorityOperation,
}

impl OperationTracker {
    fn new(operation: AuthorityOperation) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }

    fn record(&self, success: bool) {
        let elapsed = self.start.elapsed();
        let span = Span::current();
        span.record(
            "operation.duration_ms",
            u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        );
        span.record("operation.success", success);
        metrics::observe_authority_operation(self.operation.as_str(), elapsed.as_secs_f64());
    }

    fn succeed(&self) {
        self.record(true);
    }

    fn fail(&self, error: AuthorityError) -> AuthorityError {
        self.record(false);
        metrics::increment_authority_operation_errors(self.operation.as_str());
        error
    }
}
