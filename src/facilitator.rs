//! HTTP client for the remote x402 facilitator.
//!
//! The facilitator verifies payment payloads and submits on-chain
//! settlements; the gateway talks to it over `POST /verify`,
//! `POST /settle`, and `GET /supported`. The client shares one
//! `reqwest::Client` connection pool and is cheap to clone.
//!
//! When facilitator auth is configured, every call carries a bearer token
//! freshly minted from the long-lived key pair and bound to the request's
//! method, host, and path, so a captured token cannot be replayed against a
//! different endpoint.

use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use url::Url;

use crate::network::ChainId;
use crate::payment::PaymentRequirement;

type HmacSha256 = Hmac<Sha256>;

/// Wire request for `POST /verify` and `POST /settle`.
///
/// The payment payload stays opaque: the gateway hands the decoded
/// `X-Payment` JSON through without interpreting scheme internals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub x402_version: u8,
    pub payment_payload: serde_json::Value,
    pub payment_requirements: PaymentRequirement,
}

/// Wire request for `POST /settle`: the same envelope as verification.
pub type SettleRequest = VerifyRequest;

/// Facilitator verdict on a proposed payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub is_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
}

/// Facilitator result of an on-chain settlement attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<ChainId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_id: Option<String>,
}

/// One payment kind from `GET /supported`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedKind {
    pub x402_version: u8,
    pub scheme: String,
    pub network: ChainId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SupportedResponse {
    #[serde(default)]
    pub kinds: Vec<SupportedKind>,
}

/// Long-lived facilitator API key pair used to mint per-request tokens.
#[derive(Debug, Clone)]
pub struct FacilitatorAuth {
    key_id: String,
    secret: Vec<u8>,
}

impl FacilitatorAuth {
    pub fn new(key_id: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            key_id: key_id.into(),
            secret: secret.into(),
        }
    }

    /// Mint a bearer token bound to `method + host + path` and the current
    /// time: `<key_id>.<unix-ts>.<hmac-sha256-hex>`.
    fn mint_token(&self, method: &str, url: &Url) -> String {
        let timestamp = chrono::Utc::now().timestamp();
        let host = url.host_str().unwrap_or_default();
        let binding = format!("{} {} {} {}", method, host, url.path(), timestamp);
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(binding.as_bytes());
        let tag = alloy::hex::encode(mac.finalize().into_bytes());
        format!("{}.{}.{}", self.key_id, timestamp, tag)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FacilitatorError {
    #[error("failed to construct facilitator URL: {context}: {source}")]
    UrlParse {
        context: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("facilitator transport error: {context}: {source}")]
    Http {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to decode facilitator response: {context}: {source}")]
    Decode {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected facilitator status {status}: {context}: {body}")]
    Status {
        context: &'static str,
        status: StatusCode,
        body: String,
    },
}

/// Client for a remote facilitator's verify/settle/supported endpoints.
#[derive(Clone, Debug)]
pub struct FacilitatorClient {
    verify_url: Url,
    settle_url: Url,
    supported_url: Url,
    client: Client,
    auth: Option<FacilitatorAuth>,
    timeout: Duration,
}

impl FacilitatorClient {
    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Construct a client from the facilitator base URL, deriving the
    /// `./verify`, `./settle`, and `./supported` endpoints.
    pub fn try_new(base_url: &str) -> Result<Self, FacilitatorError> {
        // Normalize to exactly one trailing slash so join() appends
        let mut normalized = base_url.trim_end_matches('/').to_string();
        normalized.push('/');
        let base = Url::parse(&normalized).map_err(|source| FacilitatorError::UrlParse {
            context: "base url",
            source,
        })?;
        let join = |segment: &str, context: &'static str| {
            base.join(segment)
                .map_err(|source| FacilitatorError::UrlParse { context, source })
        };
        Ok(Self {
            verify_url: join("./verify", "verify url")?,
            settle_url: join("./settle", "settle url")?,
            supported_url: join("./supported", "supported url")?,
            client: Client::new(),
            auth: None,
            timeout: Self::DEFAULT_TIMEOUT,
        })
    }

    pub fn with_auth(mut self, auth: FacilitatorAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `POST /verify`: ask the facilitator whether the payment is acceptable.
    pub async fn verify(&self, request: &VerifyRequest) -> Result<VerifyResponse, FacilitatorError> {
        self.post_json(&self.verify_url, "POST /verify", request)
            .await
    }

    /// `POST /settle`: submit the verified payment on-chain.
    pub async fn settle(&self, request: &SettleRequest) -> Result<SettleResponse, FacilitatorError> {
        self.post_json(&self.settle_url, "POST /settle", request)
            .await
    }

    /// `GET /supported`: the payment kinds this facilitator handles.
    pub async fn supported(&self) -> Result<SupportedResponse, FacilitatorError> {
        let mut req = self
            .client
            .get(self.supported_url.clone())
            .timeout(self.timeout);
        if let Some(auth) = &self.auth {
            req = req.bearer_auth(auth.mint_token("GET", &self.supported_url));
        }
        let response = req.send().await.map_err(|source| FacilitatorError::Http {
            context: "GET /supported",
            source,
        })?;
        Self::read_json(response, "GET /supported").await
    }

    async fn post_json<T, R>(
        &self,
        url: &Url,
        context: &'static str,
        payload: &T,
    ) -> Result<R, FacilitatorError>
    where
        T: Serialize + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let mut req = self.client.post(url.clone()).json(payload).timeout(self.timeout);
        if let Some(auth) = &self.auth {
            req = req.bearer_auth(auth.mint_token("POST", url));
        }
        let response = req
            .send()
            .await
            .map_err(|source| FacilitatorError::Http { context, source })?;
        Self::read_json(response, context).await
    }

    async fn read_json<R: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        context: &'static str,
    ) -> Result<R, FacilitatorError> {
        if response.status() == StatusCode::OK {
            response
                .json::<R>()
                .await
                .map_err(|source| FacilitatorError::Decode { context, source })
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(FacilitatorError::Status {
                context,
                status,
                body,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_urls_derive_from_base() {
        let client = FacilitatorClient::try_new("https://facilitator.example//").unwrap();
        assert_eq!(client.verify_url.as_str(), "https://facilitator.example/verify");
        assert_eq!(client.settle_url.as_str(), "https://facilitator.example/settle");
        assert_eq!(
            client.supported_url.as_str(),
            "https://facilitator.example/supported"
        );
    }

    #[test]
    fn base_with_path_keeps_prefix() {
        let client = FacilitatorClient::try_new("https://host.example/x402").unwrap();
        assert_eq!(client.verify_url.as_str(), "https://host.example/x402/verify");
    }

    #[test]
    fn minted_tokens_bind_method_and_path() {
        let auth = FacilitatorAuth::new("key-1", b"secret".to_vec());
        let url: Url = "https://facilitator.example/verify".parse().unwrap();
        let a = auth.mint_token("POST", &url);
        let b = auth.mint_token("GET", &url);
        // Same second, different method: the HMAC part must differ.
        assert_ne!(a.split('.').next_back(), b.split('.').next_back());
        assert!(a.starts_with("key-1."));
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        assert!(FacilitatorClient::try_new("not a url").is_err());
    }
}
