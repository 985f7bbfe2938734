//! x402 payment coordination.
//!
//! For a matched route the coordinator either emits a price quote (an HTTP
//! 402 body naming the accepted payment) or, when the request carries an
//! `X-Payment` header, runs the facilitator verify/settle exchange around
//! the upstream call.
//!
//! The coordinator keeps its own compiled price list, refreshed by
//! subscribing to route-table mutations, and its CAIP-2 network is fixed at
//! construction: later changes to the configured network name never
//! retarget the facilitator.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::facilitator::{
    FacilitatorClient, FacilitatorError, SettleResponse, VerifyRequest,
};
use crate::network::ChainId;
use crate::route_table::{CompiledTable, RouteObserver, RouteRule};
use crate::usd::UsdAmount;
use crate::util::b64;

/// The x402 protocol version the gateway speaks.
pub const X402_VERSION: u8 = 1;

/// One accepted payment option, as advertised in a 402 response and echoed
/// back to the facilitator as payment requirements.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirement {
    pub scheme: String,
    /// USD decimal string, dollar-prefixed: `"$0.01"`.
    pub price: String,
    /// CAIP-2 chain id, e.g. `eip155:84532`.
    pub network: ChainId,
    pub pay_to: String,
}

/// Body of an HTTP 402 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequiredBody {
    pub accepts: Vec<PaymentRequirement>,
    pub description: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A payment that passed facilitator verification, carrying the original
/// envelope forward so settlement reuses the same request.
#[derive(Debug, Clone)]
pub struct VerifiedPayment {
    request: VerifyRequest,
    pub payer: Option<String>,
}

/// A settlement that produced an on-chain transaction.
///
/// `tx_hash` is not optional: a settlement without a transaction hash is a
/// [`SettleError`], never a `Settlement`, so a successful receipt can only
/// ever carry a real hash.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub tx_hash: String,
    pub payer: Option<String>,
    pub network: Option<ChainId>,
    pub receipt_id: Option<String>,
}

/// Why settlement did not produce a transaction.
#[derive(Debug, thiserror::Error)]
pub enum SettleError {
    #[error("facilitator declined settlement: {0}")]
    Declined(String),
    #[error("facilitator reported success without a transaction hash")]
    MissingTransaction,
    #[error(transparent)]
    Transport(#[from] FacilitatorError),
}

/// Why payment verification denied the request.
#[derive(Debug, thiserror::Error)]
pub enum PaymentDenied {
    #[error("X-Payment header is not valid base64 JSON: {0}")]
    MalformedHeader(#[from] b64::HeaderPayloadError),
    #[error("facilitator rejected the payment: {0}")]
    Rejected(String),
    #[error("facilitator verification unavailable: {0}")]
    Unavailable(#[from] FacilitatorError),
}

pub struct PaymentCoordinator {
    facilitator: FacilitatorClient,
    pay_to: String,
    chain: ChainId,
    /// Coordinator-local compiled prices, kept in sync via route observation.
    prices: RwLock<HashMap<String, UsdAmount>>,
}

impl PaymentCoordinator {
    pub fn new(facilitator: FacilitatorClient, pay_to: String, chain: ChainId) -> Self {
        Self {
            facilitator,
            pay_to,
            chain,
            prices: RwLock::new(HashMap::new()),
        }
    }

    pub fn chain(&self) -> &ChainId {
        &self.chain
    }

    /// The price the coordinator will quote for a tool. Falls back to the
    /// rule's own price if the local list has not seen it yet.
    fn price_for(&self, rule: &RouteRule) -> UsdAmount {
        self.prices
            .read()
            .expect("price table lock poisoned")
            .get(&rule.tool_id)
            .copied()
            .unwrap_or(rule.price)
    }

    /// The payment requirement for a route: `exact` scheme, the route's
    /// price, this coordinator's network and pay-to address.
    pub fn requirement_for(&self, rule: &RouteRule) -> PaymentRequirement {
        PaymentRequirement {
            scheme: "exact".to_string(),
            price: self.price_for(rule).as_price_tag(),
            network: self.chain.clone(),
            pay_to: self.pay_to.clone(),
        }
    }

    /// The 402 body quoting the payment this route requires.
    pub fn payment_required_body(
        &self,
        rule: &RouteRule,
        error: Option<String>,
    ) -> PaymentRequiredBody {
        PaymentRequiredBody {
            accepts: vec![self.requirement_for(rule)],
            description: rule
                .description
                .clone()
                .unwrap_or_else(|| format!("Payment required for {}", rule.tool_id)),
            mime_type: "application/json".to_string(),
            error,
        }
    }

    /// Decode the `X-Payment` header and verify it with the facilitator.
    pub async fn verify(
        &self,
        rule: &RouteRule,
        payment_header: &str,
    ) -> Result<VerifiedPayment, PaymentDenied> {
        let payload: serde_json::Value = b64::decode_json_header(payment_header)?;
        let request = VerifyRequest {
            x402_version: X402_VERSION,
            payment_payload: payload,
            payment_requirements: self.requirement_for(rule),
        };
        let response = self.facilitator.verify(&request).await?;
        if response.is_valid {
            Ok(VerifiedPayment {
                request,
                payer: response.payer,
            })
        } else {
            Err(PaymentDenied::Rejected(
                response
                    .invalid_reason
                    .unwrap_or_else(|| "payment rejected".to_string()),
            ))
        }
    }

    /// Settle a verified payment.
    ///
    /// The facilitator reporting `success: false` comes back as an error so
    /// the pipeline can roll back the charge, and so does a `success: true`
    /// response that carries no transaction hash: a charge may only stand
    /// against a settlement that names its on-chain transaction.
    pub async fn settle(&self, payment: &VerifiedPayment) -> Result<Settlement, SettleError> {
        let response: SettleResponse = self.facilitator.settle(&payment.request).await?;
        if !response.success {
            let reason = response
                .error_reason
                .unwrap_or_else(|| "settlement failed".to_string());
            tracing::warn!(reason = %reason, "facilitator settlement failed");
            return Err(SettleError::Declined(reason));
        }
        let Some(tx_hash) = response.transaction else {
            tracing::warn!("facilitator settlement succeeded without a transaction hash");
            return Err(SettleError::MissingTransaction);
        };
        Ok(Settlement {
            tx_hash,
            payer: response.payer.or_else(|| payment.payer.clone()),
            network: response.network,
            receipt_id: response.receipt_id,
        })
    }

    /// Log a warning at startup when the facilitator does not list this
    /// coordinator's network among its supported kinds.
    pub async fn check_supported(&self) {
        match self.facilitator.supported().await {
            Ok(supported) => {
                let known = supported.kinds.iter().any(|kind| kind.network == self.chain);
                if !known && !supported.kinds.is_empty() {
                    tracing::warn!(
                        network = %self.chain,
                        "facilitator does not advertise support for the configured network"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not fetch facilitator supported kinds");
            }
        }
    }
}

impl RouteObserver for PaymentCoordinator {
    fn routes_changed(&self, snapshot: &Arc<CompiledTable>) {
        let rebuilt: HashMap<String, UsdAmount> = snapshot
            .rules()
            .into_iter()
            .map(|rule| (rule.tool_id, rule.price))
            .collect();
        let mut prices = self.prices.write().expect("price table lock poisoned");
        *prices = rebuilt;
        tracing::debug!(routes = prices.len(), "payment coordinator price table refreshed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route_table::Provider;

    fn coordinator() -> PaymentCoordinator {
        PaymentCoordinator::new(
            FacilitatorClient::try_new("https://facilitator.example").unwrap(),
            "0x209693Bc6afc0C5328bA36FaF03C514EF312287C".to_string(),
            ChainId::eip155(84532),
        )
    }

    fn rule(tool_id: &str, price: &str) -> RouteRule {
        RouteRule {
            method: "GET".to_string(),
            path: format!("/api/v1/{tool_id}"),
            tool_id: tool_id.to_string(),
            price: price.parse().unwrap(),
            provider: Provider {
                id: "acme".to_string(),
                backend_url: "https://api.example.com".parse().unwrap(),
                auth: None,
            },
            group: None,
            description: None,
            restricted: false,
            skip_ssrf: false,
        }
    }

    #[test]
    fn requirement_carries_exact_scheme_and_caip2() {
        let requirement = coordinator().requirement_for(&rule("quote", "0.01"));
        assert_eq!(requirement.scheme, "exact");
        assert_eq!(requirement.price, "$0.01");
        assert_eq!(requirement.network.to_string(), "eip155:84532");
    }

    #[test]
    fn body_serializes_with_camel_case_keys() {
        let body = coordinator().payment_required_body(&rule("quote", "0.01"), None);
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("mimeType").is_some());
        assert!(json["accepts"][0].get("payTo").is_some());
    }

    #[test]
    fn observer_refreshes_prices() {
        let coordinator = coordinator();
        let table = Arc::new(
            CompiledTable::compile(vec![rule("quote", "0.05")]).unwrap(),
        );
        coordinator.routes_changed(&table);
        assert_eq!(
            coordinator.requirement_for(&rule("quote", "0.01")).price,
            "$0.05"
        );
    }
}
