//! Admission predicates: checks that gate requests and route registration.
//!
//! Request-time: the gateway API-key check (constant-time) and the agent
//! blocklist. Registration-time: the SSRF guard over the upstream host and
//! the x402-upstream probe that refuses to front an upstream that already
//! charges for itself.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::RwLock;
use std::time::Duration;
use url::Url;

use crate::route_table::RouteRule;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum RouteAdmissionError {
    #[error("backend host resolves to a non-public address: {0}")]
    SsrfBlocked(String),
    #[error("backend URL has no host: {0}")]
    MissingHost(String),
    #[error("upstream already requires x402 payment")]
    X402UpstreamBlocked,
}

fn is_forbidden_v4(ip: Ipv4Addr) -> bool {
    // CGNAT 100.64.0.0/10 and the 240.0.0.0/4 reserved block have no
    // stable std accessors, so they are spelled out.
    let octets = ip.octets();
    ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_multicast()
        || (octets[0] == 100 && (octets[1] & 0b1100_0000) == 64)
        || octets[0] >= 240
}

fn is_forbidden_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_forbidden_v4(v4);
    }
    let segments = ip.segments();
    ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_multicast()
        // unique-local fc00::/7
        || (segments[0] & 0xfe00) == 0xfc00
        // link-local fe80::/10
        || (segments[0] & 0xffc0) == 0xfe80
        // documentation 2001:db8::/32
        || (segments[0] == 0x2001 && segments[1] == 0x0db8)
}

fn is_forbidden(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_forbidden_v4(v4),
        IpAddr::V6(v6) => is_forbidden_v6(v6),
    }
}

/// SSRF guard: resolve the backend host and refuse any rule whose upstream
/// lands in a loopback, private, link-local, CGNAT, multicast, or otherwise
/// reserved range. Every resolved address must be public.
pub async fn assert_public_backend(backend_url: &Url) -> Result<(), RouteAdmissionError> {
    let host = backend_url
        .host()
        .ok_or_else(|| RouteAdmissionError::MissingHost(backend_url.to_string()))?;

    // IP literals short-circuit DNS
    let domain = match host {
        url::Host::Ipv4(ip) => {
            if is_forbidden_v4(ip) {
                return Err(RouteAdmissionError::SsrfBlocked(ip.to_string()));
            }
            return Ok(());
        }
        url::Host::Ipv6(ip) => {
            if is_forbidden_v6(ip) {
                return Err(RouteAdmissionError::SsrfBlocked(ip.to_string()));
            }
            return Ok(());
        }
        url::Host::Domain(domain) => domain.to_string(),
    };

    let port = backend_url.port_or_known_default().unwrap_or(443);
    let resolved = tokio::net::lookup_host((domain.as_str(), port))
        .await
        .map_err(|e| RouteAdmissionError::SsrfBlocked(format!("{domain}: {e}")))?;
    for addr in resolved {
        if is_forbidden(addr.ip()) {
            return Err(RouteAdmissionError::SsrfBlocked(format!(
                "{domain} -> {}",
                addr.ip()
            )));
        }
    }
    Ok(())
}

/// Default timeout for the x402-upstream probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Probe the upstream for x402 behavior at route-register time.
///
/// A 402 response carrying a `payment-required` header means the upstream
/// already charges per request; fronting it would stack a markup on an
/// already-paid API, so the route is refused. Transport errors are treated
/// as unknown and allowed.
pub async fn probe_x402_upstream(
    client: &reqwest::Client,
    rule: &RouteRule,
) -> Result<(), RouteAdmissionError> {
    let probe_path: String = rule
        .path
        .split('/')
        .map(|segment| if segment.starts_with(':') { "_" } else { segment })
        .collect::<Vec<_>>()
        .join("/");
    let target = format!(
        "{}{}",
        rule.provider.backend_url.as_str().trim_end_matches('/'),
        probe_path
    );
    let response = match client.get(&target).timeout(PROBE_TIMEOUT).send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!(url = %target, error = %e, "x402 probe inconclusive, allowing route");
            return Ok(());
        }
    };
    if response.status() == reqwest::StatusCode::PAYMENT_REQUIRED
        && response.headers().contains_key("payment-required")
    {
        return Err(RouteAdmissionError::X402UpstreamBlocked);
    }
    Ok(())
}

/// Persisted set of blocked agent addresses, compared lowercased.
#[derive(Debug, Default)]
pub struct AgentBlocklist {
    addresses: RwLock<HashSet<String>>,
}

impl AgentBlocklist {
    pub fn new(addresses: impl IntoIterator<Item = String>) -> Self {
        Self {
            addresses: RwLock::new(
                addresses.into_iter().map(|a| a.to_lowercase()).collect(),
            ),
        }
    }

    pub fn contains(&self, address: &str) -> bool {
        self.addresses
            .read()
            .expect("blocklist lock poisoned")
            .contains(&address.to_lowercase())
    }

    pub fn insert(&self, address: &str) -> bool {
        self.addresses
            .write()
            .expect("blocklist lock poisoned")
            .insert(address.to_lowercase())
    }

    pub fn remove(&self, address: &str) -> bool {
        self.addresses
            .write()
            .expect("blocklist lock poisoned")
            .remove(&address.to_lowercase())
    }

    pub fn snapshot(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .addresses
            .read()
            .expect("blocklist lock poisoned")
            .iter()
            .cloned()
            .collect();
        addresses.sort();
        addresses
    }
}

/// Constant-time equality via HMAC tags, so the API-key comparison leaks no
/// prefix-length timing.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let keyed = |data: &[u8]| {
        let mut mac = HmacSha256::new_from_slice(b"tollgate.ct-compare")
            .expect("HMAC accepts any key length");
        mac.update(data);
        mac.finalize()
    };
    keyed(a) == keyed(b)
}

/// Gateway-level API-key check: accepts `Authorization: Bearer <key>` or
/// `X-Api-Key: <key>`.
pub fn api_key_accepts(
    expected: &str,
    bearer: Option<&str>,
    api_key_header: Option<&str>,
) -> bool {
    let presented = bearer
        .and_then(|value| value.strip_prefix("Bearer "))
        .or(api_key_header);
    match presented {
        Some(candidate) => constant_time_eq(expected.as_bytes(), candidate.as_bytes()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route_table::Provider;

    #[tokio::test]
    async fn loopback_backend_is_blocked() {
        let url: Url = "http://127.0.0.1:9000".parse().unwrap();
        assert!(matches!(
            assert_public_backend(&url).await,
            Err(RouteAdmissionError::SsrfBlocked(_))
        ));
    }

    #[tokio::test]
    async fn private_and_cgnat_ranges_are_blocked() {
        for host in ["http://10.0.0.1", "http://192.168.1.1", "http://100.64.0.1", "http://169.254.1.1"] {
            let url: Url = host.parse().unwrap();
            assert!(
                assert_public_backend(&url).await.is_err(),
                "expected {host} to be blocked"
            );
        }
    }

    #[tokio::test]
    async fn ipv6_loopback_and_unique_local_are_blocked() {
        for host in [
            "http://[::1]",
            "http://[fc00::1]",
            "http://[fe80::1]",
            "http://[2001:db8::1]",
        ] {
            let url: Url = host.parse().unwrap();
            assert!(
                assert_public_backend(&url).await.is_err(),
                "expected {host} to be blocked"
            );
        }
    }

    #[tokio::test]
    async fn public_ip_literal_is_allowed() {
        let url: Url = "http://93.184.216.34".parse().unwrap();
        assert!(assert_public_backend(&url).await.is_ok());
    }

    #[tokio::test]
    async fn v4_mapped_v6_is_checked_as_v4() {
        let url: Url = "http://[::ffff:127.0.0.1]".parse().unwrap();
        assert!(assert_public_backend(&url).await.is_err());
    }

    #[test]
    fn probe_path_placeholder_substitution() {
        let rule = RouteRule {
            method: "GET".to_string(),
            path: "/api/v1/items/:id/detail".to_string(),
            tool_id: "detail".to_string(),
            price: "0.01".parse().unwrap(),
            provider: Provider {
                id: "p".to_string(),
                backend_url: "https://api.example.com".parse().unwrap(),
                auth: None,
            },
            group: None,
            description: None,
            restricted: false,
            skip_ssrf: false,
        };
        let probe_path: String = rule
            .path
            .split('/')
            .map(|s| if s.starts_with(':') { "_" } else { s })
            .collect::<Vec<_>>()
            .join("/");
        assert_eq!(probe_path, "/api/v1/items/_/detail");
    }

    #[test]
    fn blocklist_is_case_insensitive() {
        let blocklist = AgentBlocklist::new(vec!["0xAbCd".to_string()]);
        assert!(blocklist.contains("0xabcd"));
        assert!(blocklist.contains("0xABCD"));
        assert!(!blocklist.contains("0xother"));
    }

    #[test]
    fn api_key_accepts_bearer_and_header() {
        assert!(api_key_accepts("s3cret", Some("Bearer s3cret"), None));
        assert!(api_key_accepts("s3cret", None, Some("s3cret")));
        assert!(!api_key_accepts("s3cret", Some("Bearer wrong"), None));
        assert!(!api_key_accepts("s3cret", None, None));
        // Bearer takes precedence over the fallback header
        assert!(!api_key_accepts("s3cret", Some("Bearer wrong"), Some("s3cret")));
    }

    #[test]
    fn constant_time_eq_agrees_with_plain_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
