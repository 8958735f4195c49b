//! # Validation
//!
//! Validates HelmRelease specs and duration strings.

use crate::crd::HelmRelease;
use anyhow::Result;
use regex::Regex;
use std::time::Duration;

/// Longest release name helm accepts
const MAX_RELEASE_NAME_LEN: usize = 53;

/// Parse Kubernetes duration string into std::time::Duration
/// Supports formats: "30s", "1m", "5m", "1h", "2h", "1d"
/// Returns Duration or error if format is invalid
pub fn parse_kubernetes_duration(duration_str: &str) -> Result<Duration> {
    let duration_trimmed = duration_str.trim();

    if duration_trimmed.is_empty() {
        return Err(anyhow::anyhow!("Duration string cannot be empty"));
    }

    // Matches: <number><unit> where unit is s, m, h, d (case insensitive)
    let duration_regex = Regex::new(r"^(?P<number>\d+)(?P<unit>[smhd])$")
        .map_err(|e| anyhow::anyhow!("Failed to compile regex: {e}"))?;

    let interval_lower = duration_trimmed.to_lowercase();

    let captures = duration_regex
        .captures(&interval_lower)
        .ok_or_else(|| {
            anyhow::anyhow!(
                "Invalid duration format '{}'. Expected format: <number><unit> (e.g., '30s', '5m', '1h')",
                duration_trimmed
            )
        })?;

    let number_str = captures
        .name("number")
        .ok_or_else(|| {
            anyhow::anyhow!(
                "Failed to extract number from duration '{}'",
                duration_trimmed
            )
        })?
        .as_str();

    let unit = captures
        .name("unit")
        .ok_or_else(|| {
            anyhow::anyhow!("Failed to extract unit from duration '{}'", duration_trimmed)
        })?
        .as_str();

    let number: u64 = number_str.parse().map_err(|e| {
        anyhow::anyhow!(
            "Invalid duration number '{}' in '{}': {}",
            number_str,
            duration_trimmed,
            e
        )
    })?;

    if number == 0 {
        return Err(anyhow::anyhow!(
            "Duration number must be greater than 0, got '{}'",
            duration_trimmed
        ));
    }

    let multiplier = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => {
            return Err(anyhow::anyhow!(
                "Invalid unit '{}' in duration '{}'. Expected: s, m, h, or d",
                unit,
                duration_trimmed
            ));
        }
    };

    let seconds = number.checked_mul(multiplier).ok_or_else(|| {
        anyhow::anyhow!("Duration '{}' is too large", duration_trimmed)
    })?;

    Ok(Duration::from_secs(seconds))
}

/// Validate a HelmRelease spec before any backend call.
/// Returns Ok(()) if valid, Err with a message suitable for a status condition.
pub fn validate_helm_release(hr: &HelmRelease) -> Result<()> {
    let spec = &hr.spec;

    if spec.chart.trim().is_empty() {
        return Err(anyhow::anyhow!("chart is required but is empty"));
    }
    if spec.chart.contains(char::is_whitespace) {
        return Err(anyhow::anyhow!(
            "chart '{}' must not contain whitespace",
            spec.chart
        ));
    }

    validate_repo_url(&spec.repo_url)?;
    validate_exact_version(&spec.version)?;

    if let Err(e) = validate_dns_label(&spec.target_namespace, "targetNamespace", 63) {
        return Err(anyhow::anyhow!("Invalid targetNamespace: {e}"));
    }

    // Resolved name covers both an explicit releaseName and the record name
    let release_name = hr.release_name();
    if let Err(e) = validate_dns_label(&release_name, "releaseName", MAX_RELEASE_NAME_LEN) {
        return Err(anyhow::anyhow!("Invalid release name: {e}"));
    }

    Ok(())
}

/// Validate repoURL: http(s) chart repository or OCI registry
fn validate_repo_url(url: &str) -> Result<()> {
    let url_trimmed = url.trim();

    if url_trimmed.is_empty() {
        return Err(anyhow::anyhow!("repoURL is required but is empty"));
    }

    let has_scheme = ["http://", "https://", "oci://"]
        .iter()
        .any(|scheme| url_trimmed.starts_with(scheme) && url_trimmed.len() > scheme.len());

    if !has_scheme {
        return Err(anyhow::anyhow!(
            "repoURL '{url_trimmed}' must be an http://, https:// or oci:// URL"
        ));
    }

    if url_trimmed.contains(char::is_whitespace) {
        return Err(anyhow::anyhow!(
            "repoURL '{url_trimmed}' must not contain whitespace"
        ));
    }

    Ok(())
}

/// Validate that version pins one exact chart version rather than a range
fn validate_exact_version(version: &str) -> Result<()> {
    if version.trim().is_empty() {
        return Err(anyhow::anyhow!("version is required but is empty"));
    }

    if version.contains(char::is_whitespace) {
        return Err(anyhow::anyhow!(
            "version '{version}' must be an exact version, not a range"
        ));
    }

    if version.contains(['^', '~', '>', '<', '=', '*', '|']) {
        return Err(anyhow::anyhow!(
            "version '{version}' must be an exact version, not a range"
        ));
    }

    // Wildcard components: 1.x, 1.2.X
    let wildcard = version
        .trim_start_matches('v')
        .split(['.', '-', '+'])
        .take(3)
        .any(|part| part.eq_ignore_ascii_case("x"));
    if wildcard {
        return Err(anyhow::anyhow!(
            "version '{version}' must be an exact version, not a wildcard"
        ));
    }

    Ok(())
}

/// Validate an RFC 1123 label
/// Format: lowercase alphanumeric, hyphens; cannot start or end with hyphen
fn validate_dns_label(value: &str, field_name: &str, max_len: usize) -> Result<()> {
    if value.is_empty() {
        return Err(anyhow::anyhow!("{field_name} cannot be empty"));
    }

    if value.len() > max_len {
        return Err(anyhow::anyhow!(
            "{} '{}' exceeds maximum length of {} characters (got {})",
            field_name,
            value,
            max_len,
            value.len()
        ));
    }

    let label_regex = Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$")
        .map_err(|e| anyhow::anyhow!("Failed to compile regex: {e}"))?;

    if !label_regex.is_match(value) {
        return Err(anyhow::anyhow!(
            "{field_name} '{value}' must be lowercase alphanumeric or hyphens, and cannot start/end with a hyphen"
        ));
    }

    Ok(())
}
