//! Outbound destination checks
//!
//! Every URL this server fetches on behalf of a remote party (actor
//! documents, WebFinger, outboxes) passes through here first.

use std::net::IpAddr;

use crate::error::AppError;

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_end_matches('.')
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::Federation(format!("Failed to resolve {}: {}", normalized, e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Federation(format!(
                "Refusing to contact private address for {}",
                normalized
            )));
        }
    }

    if !resolved_any {
        return Err(AppError::Federation(format!(
            "No DNS records for {}",
            normalized
        )));
    }

    Ok(())
}

/// Parse and vet a URL before any outbound request
///
/// Rejects non-HTTP(S) schemes and, unless `allow_private` is set,
/// hosts that are or resolve to loopback/private addresses.
pub async fn check_outbound_url(raw: &str, allow_private: bool) -> Result<url::Url, AppError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| AppError::Validation(format!("Invalid URL {}: {}", raw, e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "Unsupported URL scheme: {}",
                scheme
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Validation(format!("Missing host in URL {}", raw)))?
        .to_string();

    if allow_private {
        return Ok(parsed);
    }

    if is_disallowed_host(&host) {
        return Err(AppError::Federation(format!(
            "Refusing to contact private host {}",
            host
        )));
    }

    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| AppError::Validation(format!("Missing port in URL {}", raw)))?;
    validate_resolved_host_ips(&host, port).await?;

    Ok(parsed)
}

/// `host[:port]` of a URL, keeping the port only when it is not the default
pub fn authority_of(url: &url::Url) -> Option<String> {
    let host = url.host_str()?.to_ascii_lowercase();
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}
