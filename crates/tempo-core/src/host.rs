//! SSRF-aware target validation (§4.1).
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::TempoError;

const CLOUD_METADATA_HOSTS: &[&str] = &[
    "169.254.169.254",
    "metadata.google.internal",
    "169.254.169.123",
    "100.100.100.200",
];

/// Validates and normalizes a caller-supplied target, rejecting anything
/// that resolves into loopback, private, link-local, or cloud-metadata
/// space.
///
/// Returns the normalized `scheme://host[:port]` string on success.
pub fn validate_target(raw: &str) -> Result<String, TempoError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(TempoError::Admission("target is empty".to_string()));
    }

    let had_scheme = trimmed.contains("://");
    let parse_candidate = if had_scheme {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };

    let url = url::Url::parse(&parse_candidate)
        .map_err(|e| TempoError::Admission(format!("unparseable target: {e}")))?;

    if had_scheme {
        let scheme = url.scheme().to_ascii_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(TempoError::Admission(format!(
                "unsupported scheme: {scheme}"
            )));
        }
    }

    let hostname = url
        .host_str()
        .map(|h| h.to_string())
        .or_else(|| trimmed.split(':').next().map(|s| s.to_string()))
        .unwrap_or_default();
    let hostname = hostname.to_ascii_lowercase();

    if hostname.is_empty() {
        return Err(TempoError::Admission("target has no host".to_string()));
    }

    if is_blocked_host(&hostname) {
        return Err(TempoError::Admission(format!(
            "target resolves to a disallowed host: {hostname}"
        )));
    }

    // Normalization per §4.1: a caller-supplied scheme always wins; a port
    // with no scheme implies plaintext; bare RFC1918-shaped hosts prefer
    // plaintext; everything else defaults to https.
    let normalized = if had_scheme {
        trimmed.to_string()
    } else if trimmed.contains(':') || is_rfc1918_shaped(&hostname) {
        format!("http://{trimmed}")
    } else {
        format!("https://{trimmed}")
    };

    Ok(normalized)
}

fn is_blocked_host(hostname: &str) -> bool {
    if hostname == "localhost" {
        return true;
    }
    if CLOUD_METADATA_HOSTS.contains(&hostname) {
        return true;
    }
    let unbracketed = strip_brackets(hostname);
    if let Ok(ip) = unbracketed.parse::<Ipv4Addr>() {
        return is_private_v4(ip);
    }
    if let Ok(ip) = unbracketed.parse::<Ipv6Addr>() {
        return is_private_v6(ip);
    }
    false
}

/// `url::Url::host_str` returns IPv6 hosts in their bracketed form
/// (`"[::1]"`); strip the brackets before parsing as an address.
fn strip_brackets(hostname: &str) -> &str {
    hostname
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(hostname)
}

fn is_rfc1918_shaped(hostname: &str) -> bool {
    hostname
        .parse::<Ipv4Addr>()
        .map(is_private_v4)
        .unwrap_or(false)
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    matches!(octets[0], 10)
        || (octets[0] == 192 && octets[1] == 168)
        || (octets[0] == 172 && (16..=31).contains(&octets[1]))
        || ip.is_loopback()
        || ip.is_link_local()
}

/// Loopback (`::1`), link-local (`fe80::/10`), and unique-local
/// (`fc00::/7`) IPv6 space — the v6 analogues of the v4 private ranges.
fn is_private_v6(ip: Ipv6Addr) -> bool {
    if ip.is_loopback() {
        return true;
    }
    let segments = ip.segments();
    let is_link_local = (segments[0] & 0xffc0) == 0xfe80;
    let is_unique_local = (segments[0] & 0xfe00) == 0xfc00;
    is_link_local || is_unique_local
}
