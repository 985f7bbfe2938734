//! Upstream proxy forwarder.
//!
//! Builds the upstream URL as `backend_url + path + query`, forwards the
//! body untouched, and applies the header policy: hop-by-hop and internal
//! gateway headers are stripped, the provider's auth header is injected,
//! everything else passes through verbatim with multi-valued headers joined
//! by `", "`. The response body is hashed for the receipt and otherwise
//! untouched.
//!
//! Transport failures here are not payment failures: the pipeline skips
//! settlement and emits `UPSTREAM_ERROR_NO_CHARGE`.

use http::{HeaderMap, StatusCode};
use reqwest::Client;

use crate::route_table::Provider;
use crate::util::hash::sha256_hex;

/// Hop-by-hop headers that never cross the proxy boundary.
const HOP_BY_HOP: &[&str] = &[
    "host",
    "connection",
    "transfer-encoding",
    "content-length",
    "keep-alive",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
];

/// Gateway-internal headers, consumed before the proxy stage.
const INTERNAL: &[&str] = &[
    "x-request-idempotency-key",
    "x-mandate",
    "x-payment",
    "x-receipt",
    "x-api-key",
    "x-agent-address",
    "x-user-confirmed",
];

fn is_stripped(name: &str) -> bool {
    HOP_BY_HOP.contains(&name) || INTERNAL.contains(&name)
}

/// The forwardable subset of inbound headers as `(name, joined-value)`
/// pairs, with the provider auth header appended last so it wins over any
/// inbound value of the same name.
pub fn forwardable_headers(headers: &HeaderMap, provider: &Provider) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for name in headers.keys() {
        let lowered = name.as_str().to_ascii_lowercase();
        if is_stripped(&lowered) {
            continue;
        }
        let joined = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        out.push((lowered, joined));
    }
    if let Some(auth) = &provider.auth {
        out.retain(|(name, _)| !name.eq_ignore_ascii_case(&auth.header));
        out.push((auth.header.to_ascii_lowercase(), auth.value.clone()));
    }
    out
}

/// What came back from the upstream.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub response_hash: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid upstream URL {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("invalid method {0:?}")]
    InvalidMethod(String),
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Forward a request to the route's upstream and read the full response.
pub async fn forward(
    client: &Client,
    provider: &Provider,
    method: &str,
    path: &str,
    query: &str,
    headers: &HeaderMap,
    body: Vec<u8>,
) -> Result<UpstreamResponse, ProxyError> {
    let mut target = format!("{}{}", provider.backend_url.as_str().trim_end_matches('/'), path);
    if !query.is_empty() {
        target.push('?');
        target.push_str(query);
    }
    let url: url::Url = target.parse().map_err(|source| ProxyError::InvalidUrl {
        url: target.clone(),
        source,
    })?;
    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| ProxyError::InvalidMethod(method.to_string()))?;

    let mut request = client.request(method, url);
    for (name, value) in forwardable_headers(headers, provider) {
        request = request.header(name, value);
    }
    if !body.is_empty() {
        request = request.body(body);
    }

    let response = request.send().await?;
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await?.to_vec();
    let response_hash = sha256_hex(&body);
    Ok(UpstreamResponse {
        status,
        headers,
        body,
        response_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route_table::ProviderAuth;
    use http::HeaderValue;

    fn provider(auth: Option<ProviderAuth>) -> Provider {
        Provider {
            id: "acme".to_string(),
            backend_url: "https://api.example.com".parse().unwrap(),
            auth,
        }
    }

    #[test]
    fn strips_hop_by_hop_and_internal_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("gateway.local"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("x-payment", HeaderValue::from_static("abc"));
        headers.insert("x-mandate", HeaderValue::from_static("def"));
        headers.insert("accept", HeaderValue::from_static("application/json"));

        let forwarded = forwardable_headers(&headers, &provider(None));
        let names: Vec<&str> = forwarded.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["accept"]);
    }

    #[test]
    fn joins_multi_valued_headers() {
        let mut headers = HeaderMap::new();
        headers.append("x-tag", HeaderValue::from_static("a"));
        headers.append("x-tag", HeaderValue::from_static("b"));
        let forwarded = forwardable_headers(&headers, &provider(None));
        assert_eq!(forwarded, vec![("x-tag".to_string(), "a, b".to_string())]);
    }

    #[test]
    fn injects_provider_auth_over_inbound_value() {
        let mut headers = HeaderMap::new();
        headers.insert("x-upstream-key", HeaderValue::from_static("spoofed"));
        let forwarded = forwardable_headers(
            &headers,
            &provider(Some(ProviderAuth {
                header: "X-Upstream-Key".to_string(),
                value: "real-key".to_string(),
            })),
        );
        assert_eq!(
            forwarded,
            vec![("x-upstream-key".to_string(), "real-key".to_string())]
        );
    }

    #[test]
    fn preserves_authorization_for_upstream() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer tok"));
        let forwarded = forwardable_headers(&headers, &provider(None));
        assert_eq!(
            forwarded,
            vec![("authorization".to_string(), "Bearer tok".to_string())]
        );
    }
}
