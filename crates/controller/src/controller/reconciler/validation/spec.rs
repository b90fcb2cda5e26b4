//! # Spec Validation
//!
//! Turns a `PkiSecretSpec` into the issuance parameters the lifecycle tracker
//! fingerprints. Everything rejected here is a configuration error: retrying
//! without a spec change cannot succeed.

use super::duration::parse_duration;
use crate::constants::MIN_RENEWAL_LEAD_SECS;
use crate::crd::PkiSecretSpec;
use crate::lifecycle::IssuanceParameters;
use anyhow::Result;
use regex::Regex;
use std::time::Duration;

/// Validate a spec and extract its issuance parameters
pub fn validate_spec(spec: &PkiSecretSpec) -> Result<IssuanceParameters> {
    require_non_empty(&spec.mount, "mount")?;
    require_non_empty(&spec.role, "role")?;
    require_non_empty(&spec.common_name, "commonName")?;
    validate_kubernetes_name(&spec.destination.name, "destination.name")?;

    let ttl = spec
        .ttl
        .as_deref()
        .map(|ttl| {
            parse_duration(ttl).map_err(|e| anyhow::anyhow!("ttl '{ttl}' is invalid: {e}"))
        })
        .transpose()?;
    if ttl.is_some_and(|ttl| ttl.is_zero()) {
        return Err(anyhow::anyhow!("ttl must be greater than zero"));
    }
    // The PKI engine takes whole seconds
    if ttl.is_some_and(|ttl| ttl.subsec_nanos() != 0) {
        return Err(anyhow::anyhow!(
            "ttl '{}' must be a whole number of seconds",
            spec.ttl.as_deref().unwrap_or_default()
        ));
    }

    let expiry_offset = spec
        .expiry_offset
        .as_deref()
        .map(|offset| {
            parse_duration(offset)
                .map_err(|e| anyhow::anyhow!("expiryOffset '{offset}' is invalid: {e}"))
        })
        .transpose()?
        .unwrap_or(Duration::ZERO);

    if let Some(ttl) = ttl {
        let lead = expiry_offset.max(Duration::from_secs(MIN_RENEWAL_LEAD_SECS));
        if lead >= ttl {
            return Err(anyhow::anyhow!(
                "expiryOffset ({expiry_offset:?}) must be shorter than ttl ({ttl:?})"
            ));
        }
    }

    Ok(IssuanceParameters {
        namespace: spec.namespace.clone().filter(|ns| !ns.trim().is_empty()),
        mount: spec.mount.trim().trim_matches('/').to_string(),
        role: spec.role.trim().to_string(),
        common_name: spec.common_name.trim().to_string(),
        alt_names: spec.alt_names.clone(),
        ip_sans: spec.ip_sans.clone(),
        uri_sans: spec.uri_sans.clone(),
        exclude_cn_from_sans: spec.exclude_cn_from_sans,
        format: spec.format,
        ttl,
        expiry_offset,
    })
}

fn require_non_empty(value: &str, field_name: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow::anyhow!("{field_name} cannot be empty"));
    }
    Ok(())
}

/// Validate a Kubernetes object name (RFC 1123 subdomain)
pub fn validate_kubernetes_name(name: &str, field_name: &str) -> Result<()> {
    let trimmed = name.trim();

    if trimmed.is_empty() {
        return Err(anyhow::anyhow!("{field_name} cannot be empty"));
    }

    if trimmed.len() > 253 {
        return Err(anyhow::anyhow!(
            "{field_name} '{trimmed}' exceeds maximum length of 253 characters (got {})",
            trimmed.len()
        ));
    }

    let name_regex =
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
            .map_err(|e| anyhow::anyhow!("Failed to compile regex: {e}"))?;

    if !name_regex.is_match(trimmed) {
        return Err(anyhow::anyhow!(
            "{field_name} '{trimmed}' must be a valid Kubernetes name (lowercase alphanumeric, hyphens, dots; cannot start/end with hyphen or dot)"
        ));
    }

    Ok(())
}
