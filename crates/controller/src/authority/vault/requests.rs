//! # Request Types
//!
//! Vault PKI secrets engine request bodies.
//!
//! API Reference: https://developer.hashicorp.com/vault/api-docs/secret/pki

use crate::authority::{IssueRequest, RevokeRequest};
use serde::Serialize;

/// Body of `POST /v1/{mount}/issue/{role}`
#[derive(Debug, Serialize)]
pub struct IssueCertificateRequest<'a> {
    pub common_name: &'a str,
    /// Go duration string, seconds precision
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
    pub format: &'a str,
    /// Comma-separated DNS SANs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt_names: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_sans: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri_sans: Option<String>,
    pub exclude_cn_from_sans: bool,
}

impl<'a> From<&'a IssueRequest> for IssueCertificateRequest<'a> {
    fn from(request: &'a IssueRequest) -> Self {
        Self {
            common_name: &request.common_name,
            ttl: request.ttl.map(|ttl| format!("{}s", ttl.as_secs())),
            format: request.format.as_str(),
            alt_names: join_non_empty(&request.alt_names),
            ip_sans: join_non_empty(&request.ip_sans),
            uri_sans: join_non_empty(&request.uri_sans),
            exclude_cn_from_sans: request.exclude_cn_from_sans,
        }
    }
}

/// Body of `POST /v1/{mount}/revoke`
#[derive(Debug, Serialize)]
pub struct RevokeCertificateRequest<'a> {
    pub serial_number: &'a str,
}

impl<'a> From<&'a RevokeRequest> for RevokeCertificateRequest<'a> {
    fn from(request: &'a RevokeRequest) -> Self {
        Self {
            serial_number: &request.serial_number,
        }
    }
}

fn join_non_empty(values: &[String]) -> Option<String> {
    (!values.is_empty()).then(|| values.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::CertificateFormat;
    use std::time::Duration;

    #[test]
    fn test_issue_body_omits_empty_optionals() {
        let request = IssueRequest {
            namespace: None,
            mount: "pki".to_string(),
            role: "secret".to_string(),
            common_name: "a.example.com".to_string(),
            alt_names: Vec::new(),
            ip_sans: Vec::new(),
            uri_sans: Vec::new(),
            exclude_cn_from_sans: false,
            format: CertificateFormat::Pem,
            ttl: None,
        };
        let body = serde_json::to_value(IssueCertificateRequest::from(&request)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "common_name": "a.example.com",
                "format": "pem",
                "exclude_cn_from_sans": false
            })
        );
    }

    #[test]
    fn test_issue_body_joins_sans_and_formats_ttl() {
        let request = IssueRequest {
            namespace: Some("team-a".to_string()),
            mount: "pki".to_string(),
            role: "secret".to_string(),
            common_name: "a.example.com".to_string(),
            alt_names: vec!["b.example.com".to_string(), "c.example.com".to_string()],
            ip_sans: vec!["10.0.0.1".to_string()],
            uri_sans: Vec::new(),
            exclude_cn_from_sans: true,
            format: CertificateFormat::PemBundle,
            ttl: Some(Duration::from_secs(15)),
        };
        let body = serde_json::to_value(IssueCertificateRequest::from(&request)).unwrap();
        assert_eq!(body["ttl"], "15s");
        assert_eq!(body["alt_names"], "b.example.com,c.example.com");
        assert_eq!(body["ip_sans"], "10.0.0.1");
        assert_eq!(body["format"], "pem_bundle");
        assert!(body.get("uri_sans").is_none());
    }
}
