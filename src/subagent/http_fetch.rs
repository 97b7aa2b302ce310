//! `http_fetch` pre-flight tool: the one generic HTTP tool whose safety
//! contract the controller owns (§1 names the tool itself out of scope,
//! only the contract in). Grounded on the teacher's `Tool` trait shape
//! (`name`/`description`/`parameters`/`execute`) from `tools/mod.rs`,
//! collapsed into a standalone function since the controller calls it
//! inline rather than through a generic tool-call loop.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::net::lookup_host;

use crate::config::HttpFetchConfig;

const DEFAULT_MAX_BYTES: usize = 1_000_000;
const DEFAULT_TIMEOUT_SECS: u64 = 8;
const TRUNCATE_NON_JSON_BYTES: usize = 5_000;

#[derive(Debug, Error)]
pub enum HttpFetchError {
    #[error("host '{0}' is not in the allowlist")]
    HostNotAllowed(String),
    #[error("host '{0}' resolved to a disallowed private/loopback/link-local address")]
    PrivateAddress(String),
    #[error("content-type '{0}' is not allowed")]
    ContentTypeNotAllowed(String),
    #[error("unsupported scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("dns resolution failed: {0}")]
    Dns(String),
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone)]
pub struct FetchedEntry {
    pub id: String,
    pub status: u16,
    pub body: Value,
}

fn host_allowed(host: &str, allowlist: &[String]) -> bool {
    allowlist.iter().any(|pattern| {
        if let Some(suffix) = pattern.strip_prefix("*.") {
            host == suffix || host.ends_with(&format!(".{suffix}"))
        } else {
            host == pattern
        }
    })
}

fn is_disallowed_address(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_broadcast() || v4.is_unspecified(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xfe00) == 0xfc00 || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

async fn assert_host_resolves_publicly(host: &str, port: u16) -> Result<(), HttpFetchError> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port)).await.map_err(|e| HttpFetchError::Dns(e.to_string()))?.collect();
    if addrs.is_empty() {
        return Err(HttpFetchError::Dns(format!("no addresses for '{host}'")));
    }
    for addr in addrs {
        if is_disallowed_address(addr.ip()) {
            return Err(HttpFetchError::PrivateAddress(host.to_string()));
        }
    }
    Ok(())
}

fn content_type_allowed(content_type: &str) -> bool {
    let ct = content_type.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    matches!(ct.as_str(), "application/json" | "text/plain" | "text/xml" | "application/xml" | "text/html" | "text/csv")
}

/// Fetches one URL under the SSRF contract: scheme/method restricted to
/// `http(s)`/`GET`, host allowlisted, DNS-resolved addresses must be
/// public, content-type allowlisted, body capped, timeout bounded.
async fn fetch_one(url: &str, allowlist: &[String]) -> Result<(u16, Value), HttpFetchError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| HttpFetchError::Transport(e.to_string()))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(HttpFetchError::UnsupportedScheme(parsed.scheme().to_string()));
    }
    let host = parsed.host_str().ok_or_else(|| HttpFetchError::Transport("missing host".to_string()))?;
    if !host_allowed(host, allowlist) {
        return Err(HttpFetchError::HostNotAllowed(host.to_string()));
    }
    let port = parsed.port_or_known_default().unwrap_or(443);
    assert_host_resolves_publicly(host, port).await?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
        .build()
        .map_err(|e| HttpFetchError::Transport(e.to_string()))?;
    let response = client.get(url).send().await.map_err(|e| HttpFetchError::Transport(e.to_string()))?;
    let status = response.status().as_u16();

    let content_type = response.headers().get(reqwest::header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).unwrap_or("").to_string();
    if !content_type.is_empty() && !content_type_allowed(&content_type) {
        return Err(HttpFetchError::ContentTypeNotAllowed(content_type));
    }

    let bytes = response.bytes().await.map_err(|e| HttpFetchError::Transport(e.to_string()))?;
    let capped = &bytes[..bytes.len().min(DEFAULT_MAX_BYTES)];

    let body = if content_type.to_ascii_lowercase().contains("json") {
        serde_json::from_slice(capped).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(capped).to_string()))
    } else {
        let text = String::from_utf8_lossy(capped);
        let truncated: String = text.chars().take(TRUNCATE_NON_JSON_BYTES).collect();
        Value::String(truncated)
    };

    Ok((status, body))
}

/// Caps `ids` at `max` and resolves each against `template`, preserving
/// order — split out from `fetch_ids` so the `ids.len() > max` boundary is
/// testable without a network call.
fn resolve_urls(ids: &[String], template: &str, max: usize) -> Vec<(String, String)> {
    ids.iter().take(max).map(|id| (id.clone(), template.replace("{id}", id))).collect()
}

/// Resolves `{id}` against `url_template` for each of `ids`, capped at
/// `cfg.max` entries, and fetches them. Entries that fail are simply
/// omitted — a partial `tool_results.http_fetch` is better than none.
pub async fn fetch_ids(ids: &[String], cfg: &HttpFetchConfig) -> Vec<FetchedEntry> {
    let Some(template) = &cfg.url_template else { return Vec::new() };
    let mut out = Vec::new();
    for (id, url) in resolve_urls(ids, template, cfg.max) {
        match fetch_one(&url, &cfg.allowlist).await {
            Ok((status, body)) => out.push(FetchedEntry { id, status, body }),
            Err(e) => tracing::warn!(id, error = %e, "http_fetch entry failed"),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_allowlist_matches_subdomains() {
        assert!(host_allowed("api.example.com", &["*.example.com".to_string()]));
        assert!(host_allowed("example.com", &["*.example.com".to_string()]));
        assert!(!host_allowed("evil.com", &["*.example.com".to_string()]));
    }

    #[test]
    fn exact_allowlist_entry_matches_only_itself() {
        assert!(host_allowed("api.example.com", &["api.example.com".to_string()]));
        assert!(!host_allowed("other.example.com", &["api.example.com".to_string()]));
    }

    #[test]
    fn private_v4_addresses_are_disallowed() {
        assert!(is_disallowed_address("10.0.0.5".parse().unwrap()));
        assert!(is_disallowed_address("127.0.0.1".parse().unwrap()));
        assert!(is_disallowed_address("169.254.1.1".parse().unwrap()));
        assert!(!is_disallowed_address("93.184.216.34".parse().unwrap()));
    }

    #[test]
    fn link_local_v6_addresses_are_disallowed() {
        assert!(is_disallowed_address("fe80::1".parse().unwrap()));
        assert!(is_disallowed_address("fe80::dead:beef".parse().unwrap()));
        assert!(is_disallowed_address("fc00::1".parse().unwrap()));
        assert!(!is_disallowed_address("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn content_type_allowlist_accepts_json_and_rejects_binary() {
        assert!(content_type_allowed("application/json; charset=utf-8"));
        assert!(content_type_allowed("text/plain"));
        assert!(!content_type_allowed("application/octet-stream"));
    }

    #[test]
    fn ids_beyond_max_are_capped_at_exactly_max() {
        let ids = vec!["1".to_string(), "2".to_string(), "3".to_string(), "4".to_string()];
        let resolved = resolve_urls(&ids, "https://api.example.com/items/{id}", 3);
        assert_eq!(resolved.len(), 3);
        assert_eq!(resolved[2].1, "https://api.example.com/items/3");
    }

    #[tokio::test]
    async fn no_template_configured_yields_no_fetches() {
        let cfg = HttpFetchConfig { allowlist: vec![], url_template: None, max: 2 };
        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let out = fetch_ids(&ids, &cfg).await;
        assert!(out.is_empty());
    }
}
