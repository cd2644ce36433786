//! Destination URL security validation.
//!
//! Pure checks run whenever a destination is created or its URL changes.
//! Rejects URLs that could be used to reach internal infrastructure from the
//! delivery workers (SSRF). Hostnames are checked lexically; DNS is not
//! resolved here.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use url::{Host, Url};

use crate::models::{NewDestination, MAX_TIMEOUT_SECONDS, MIN_TIMEOUT_SECONDS};

/// Hostnames that resolve to cloud metadata services or internal resolvers.
const RESERVED_HOSTNAMES: &[&str] = &["metadata.google.internal", "metadata", "instance-data"];

/// Suffixes reserved for private networks.
const RESERVED_SUFFIXES: &[&str] = &[".internal", ".local"];

/// Why a destination configuration was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// URL could not be parsed.
    #[error("Invalid webhook URL: {0}")]
    InvalidUrl(String),

    /// Scheme other than https.
    #[error("Webhook URL must use HTTPS")]
    InsecureScheme,

    /// URL has no host component.
    #[error("Webhook URL must include a hostname")]
    MissingHost,

    /// Host is loopback or unspecified.
    #[error("Webhook URL cannot point to localhost or loopback addresses: {0}")]
    Loopback(String),

    /// Host is in a private, link-local or otherwise reserved range.
    #[error("Webhook URL cannot point to private or reserved IP addresses: {0}")]
    PrivateAddress(String),

    /// Host is on the reserved hostname list.
    #[error("Webhook URL cannot point to reserved hostname: {0}")]
    ReservedHostname(String),

    /// Timeout outside the accepted range.
    #[error("timeout must be between {MIN_TIMEOUT_SECONDS} and {MAX_TIMEOUT_SECONDS} seconds, got {0}")]
    TimeoutOutOfRange(i32),

    /// Negative retry budget.
    #[error("max_retries must not be negative, got {0}")]
    NegativeRetries(i32),

    /// Rate cap of zero or less.
    #[error("requests_per_minute must be positive, got {0}")]
    InvalidRateLimit(i32),
}

/// Validates a destination URL against the SSRF policy.
///
/// # Errors
///
/// Returns the first policy violation found.
pub fn validate_destination_url(raw: &str) -> Result<Url, ValidationError> {
    let url = Url::parse(raw.trim()).map_err(|e| ValidationError::InvalidUrl(e.to_string()))?;

    if url.scheme() != "https" {
        return Err(ValidationError::InsecureScheme);
    }

    match url.host() {
        None => Err(ValidationError::MissingHost),
        Some(Host::Domain(domain)) => check_domain(domain),
        Some(Host::Ipv4(ip)) => check_ip(IpAddr::V4(ip)),
        Some(Host::Ipv6(ip)) => check_ip(IpAddr::V6(ip)),
    }?;

    Ok(url)
}

/// Validates every field of a new destination.
///
/// # Errors
///
/// Returns the first violation: URL policy, then numeric ranges.
pub fn validate_destination(new: &NewDestination) -> Result<(), ValidationError> {
    validate_destination_url(&new.url)?;

    if !(MIN_TIMEOUT_SECONDS..=MAX_TIMEOUT_SECONDS).contains(&new.timeout_seconds) {
        return Err(ValidationError::TimeoutOutOfRange(new.timeout_seconds));
    }
    if new.max_retries < 0 {
        return Err(ValidationError::NegativeRetries(new.max_retries));
    }
    if new.requests_per_minute <= 0 {
        return Err(ValidationError::InvalidRateLimit(new.requests_per_minute));
    }
    Ok(())
}

fn check_domain(domain: &str) -> Result<(), ValidationError> {
    let host = domain.trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() {
        return Err(ValidationError::MissingHost);
    }

    if host == "localhost" || host.ends_with(".localhost") {
        return Err(ValidationError::Loopback(host));
    }

    if RESERVED_HOSTNAMES.contains(&host.as_str())
        || RESERVED_SUFFIXES.iter().any(|suffix| host.ends_with(suffix))
    {
        return Err(ValidationError::ReservedHostname(host));
    }

    Ok(())
}

fn check_ip(ip: IpAddr) -> Result<(), ValidationError> {
    match ip {
        IpAddr::V4(v4) => check_ipv4(v4),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return check_ipv4(mapped);
            }
            check_ipv6(v6)
        },
    }
}

fn check_ipv4(ip: Ipv4Addr) -> Result<(), ValidationError> {
    if ip.is_loopback() || ip.is_unspecified() {
        return Err(ValidationError::Loopback(ip.to_string()));
    }

    let [a, b, ..] = ip.octets();
    // 100.64.0.0/10 carrier-grade NAT
    let shared = a == 100 && (64..=127).contains(&b);
    // 0.0.0.0/8 "this network"
    let this_network = a == 0;
    // 198.18.0.0/15 benchmarking
    let benchmarking = a == 198 && (b & 0xfe) == 18;
    // 240.0.0.0/4 reserved, includes broadcast
    let reserved = a >= 240;

    if ip.is_private()
        || ip.is_link_local()
        || ip.is_documentation()
        || ip.is_multicast()
        || shared
        || this_network
        || benchmarking
        || reserved
    {
        return Err(ValidationError::PrivateAddress(ip.to_string()));
    }

    Ok(())
}

fn check_ipv6(ip: Ipv6Addr) -> Result<(), ValidationError> {
    if ip.is_loopback() || ip.is_unspecified() {
        return Err(ValidationError::Loopback(ip.to_string()));
    }

    if let Some(embedded) = embedded_ipv4(ip) {
        return check_ipv4(embedded);
    }

    let first = ip.segments()[0];
    let unique_local = (first & 0xfe00) == 0xfc00;
    let link_local = (first & 0xffc0) == 0xfe80;

    if unique_local || link_local || ip.is_multicast() {
        return Err(ValidationError::PrivateAddress(ip.to_string()));
    }

    Ok(())
}

/// IPv4 address carried by a NAT64 (`64:ff9b::/96`) or IPv4-compatible
/// (`::a.b.c.d`) address.
fn embedded_ipv4(ip: Ipv6Addr) -> Option<Ipv4Addr> {
    let segments = ip.segments();
    let nat64 = segments[..6] == [0x64, 0xff9b, 0, 0, 0, 0];
    let compatible = segments[..6] == [0; 6];
    if !(nat64 || compatible) {
        return None;
    }

    let [.., hi, lo] = segments;
    Some(Ipv4Addr::from((u32::from(hi) << 16) | u32::from(lo)))
}
