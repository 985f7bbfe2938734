//! The request-admission pipeline.
//!
//! Every `/api/*` request runs the same fixed stage order, each stage able
//! to short-circuit with a typed denial:
//!
//! | stage             | on failure | status | reason                      |
//! |-------------------|-----------|--------|------------------------------|
//! | API-key check     | deny      | 401    | `UNAUTHORIZED`               |
//! | agent blocklist   | deny      | 403    | `AGENT_BLOCKED`              |
//! | route match       | deny      | 404    | `ROUTE_NOT_FOUND`            |
//! | replay check      | deny      | 409    | `REPLAY_DETECTED`            |
//! | mandate verify    | deny      | 403    | mandate reason               |
//! | payment verify    | deny      | 402    | `INVALID_PAYMENT`            |
//! | budget charge     | deny      | 403    | `MANDATE_BUDGET_EXCEEDED`    |
//! | upstream proxy    | error     | 502    | `UPSTREAM_ERROR_NO_CHARGE`   |
//! | settlement        | soft      | —      | receipt without a tx hash    |
//!
//! Whatever the exit, exactly one receipt is appended to the store and
//! returned base64-encoded in the `X-Receipt` header. No request reaches
//! the proxy without a verified payment; no spend survives without a
//! settlement transaction hash (the charge taken before settlement is
//! refunded when settlement fails).

use axum::body::{Body, to_bytes};
use axum::extract::State;
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use http::{HeaderMap, HeaderValue, StatusCode};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::admission::{self, AgentBlocklist};
use crate::anchor::{self, AnchorHandle, AnchorJob};
use crate::config::GatewayConfig;
use crate::mandate::{Mandate, MandateContext, MandateDenial};
use crate::payment::{PaymentCoordinator, PaymentDenied};
use crate::proxy;
use crate::receipt::{MandateVerdict, Outcome, ReasonCode, Receipt, ReceiptStore};
use crate::replay::{Admission, Fingerprint, ReplayStore};
use crate::route_table::{RouteRule, RouteTable};
use crate::spend::{ChargeOutcome, SpendTracker};
use crate::usd::UsdAmount;
use crate::util::b64;
use crate::util::hash::request_hash;

/// Gateway-defined request headers.
pub mod headers {
    pub const IDEMPOTENCY_KEY: &str = "x-request-idempotency-key";
    pub const MANDATE: &str = "x-mandate";
    pub const PAYMENT: &str = "x-payment";
    pub const AGENT_ADDRESS: &str = "x-agent-address";
    pub const API_KEY: &str = "x-api-key";
    pub const USER_CONFIRMED: &str = "x-user-confirmed";
    pub const RECEIPT: &str = "x-receipt";
}

/// Everything the pipeline needs, shared across requests.
pub struct Gateway {
    pub config: GatewayConfig,
    pub api_key: Option<String>,
    pub routes: RouteTable,
    pub replay: Arc<ReplayStore>,
    pub spend: SpendTracker,
    pub coordinator: Arc<PaymentCoordinator>,
    pub receipts: ReceiptStore,
    pub blocklist: AgentBlocklist,
    pub upstream_client: reqwest::Client,
    pub anchor: Option<AnchorHandle>,
}

/// Mutable state gathered while a request walks the stages.
struct RequestCtx {
    request_id: Uuid,
    method: String,
    path: String,
    request_hash: String,
    started: Instant,
    tool_id: String,
    provider_id: String,
    price: UsdAmount,
    mandate_id: Option<String>,
    mandate_hash: Option<String>,
    mandate_verdict: MandateVerdict,
    payment_tx_hash: Option<String>,
    facilitator_receipt_id: Option<String>,
    response_hash: Option<String>,
}

impl RequestCtx {
    fn new(method: &str, path: &str, request_hash: String) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            request_hash,
            started: Instant::now(),
            tool_id: String::new(),
            provider_id: String::new(),
            price: UsdAmount::ZERO,
            mandate_id: None,
            mandate_hash: None,
            mandate_verdict: MandateVerdict::Skipped,
            payment_tx_hash: None,
            facilitator_receipt_id: None,
            response_hash: None,
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

impl Gateway {
    /// Build the receipt for a terminated request and append it to the store.
    fn emit_receipt(
        &self,
        ctx: &RequestCtx,
        outcome: Outcome,
        reason_code: ReasonCode,
        explanation: String,
    ) -> Receipt {
        let receipt = Receipt {
            request_id: ctx.request_id,
            tool_id: ctx.tool_id.clone(),
            provider_id: ctx.provider_id.clone(),
            endpoint: ctx.path.clone(),
            method: ctx.method.clone(),
            timestamp: Utc::now(),
            price_usdc: ctx.price,
            chain: self.coordinator.chain().clone(),
            mandate_id: ctx.mandate_id.clone(),
            mandate_hash: ctx.mandate_hash.clone(),
            mandate_verdict: ctx.mandate_verdict,
            reason_code,
            payment_tx_hash: ctx.payment_tx_hash.clone(),
            facilitator_receipt_id: ctx.facilitator_receipt_id.clone(),
            request_hash: ctx.request_hash.clone(),
            response_hash: ctx.response_hash.clone(),
            latency_ms: Some(ctx.started.elapsed().as_millis() as u64),
            outcome,
            explanation,
        };
        self.receipts.append(receipt.clone());
        receipt
    }

    /// A denial response: receipt header plus a small JSON body.
    fn deny(&self, ctx: &RequestCtx, reason: ReasonCode, explanation: String) -> Response {
        tracing::info!(
            request_id = %ctx.request_id,
            reason = ?reason,
            %explanation,
            "request denied"
        );
        let receipt = self.emit_receipt(ctx, Outcome::Denied, reason, explanation.clone());
        let body = json!({
            "error": reason,
            "explanation": explanation,
        });
        with_receipt_header(
            (reason.http_status(), axum::Json(body)).into_response(),
            &receipt,
        )
    }
}

fn with_receipt_header(mut response: Response, receipt: &Receipt) -> Response {
    let encoded = b64::encode_header(
        serde_json::to_vec(receipt).expect("receipt serializes"),
    );
    if let Ok(value) = HeaderValue::from_str(&encoded) {
        response.headers_mut().insert(headers::RECEIPT, value);
    }
    response
}

/// Handler for `ALL /api/*`: runs the full admission pipeline.
pub async fn handle_api(State(gateway): State<Arc<Gateway>>, request: Request<Body>) -> Response {
    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();
    let query = request.uri().query().unwrap_or_default().to_string();
    let req_headers = request.headers().clone();

    let body = match to_bytes(request.into_body(), usize::MAX).await {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => Vec::new(),
    };

    let hash = request_hash(&method, &path, &query, &body);
    let mut ctx = RequestCtx::new(&method, &path, hash);

    // API-key check
    if let Some(expected) = &gateway.api_key {
        let authorized = admission::api_key_accepts(
            expected,
            header_str(&req_headers, "authorization"),
            header_str(&req_headers, headers::API_KEY),
        );
        if !authorized {
            return gateway.deny(
                &ctx,
                ReasonCode::Unauthorized,
                "missing or invalid gateway API key".to_string(),
            );
        }
    }

    // Agent blocklist
    if let Some(agent) = header_str(&req_headers, headers::AGENT_ADDRESS)
        && gateway.blocklist.contains(agent)
    {
        return gateway.deny(
            &ctx,
            ReasonCode::AgentBlocked,
            format!("agent {} is blocked", agent.to_lowercase()),
        );
    }

    // Route match against the snapshot captured for this request
    let snapshot = gateway.routes.snapshot();
    let Some((compiled, _params)) = snapshot.match_route(&ctx.method, &ctx.path) else {
        return gateway.deny(
            &ctx,
            ReasonCode::RouteNotFound,
            format!("no route for {} {}", ctx.method, ctx.path),
        );
    };
    let rule: &RouteRule = &compiled.rule;
    ctx.tool_id = rule.tool_id.clone();
    ctx.provider_id = rule.provider.id.clone();
    ctx.price = rule.price;

    // Replay suppression, bypassed without an idempotency key
    if let Some(key) = header_str(&req_headers, headers::IDEMPOTENCY_KEY) {
        let fingerprint = Fingerprint {
            idempotency_key: key.to_string(),
            request_hash: ctx.request_hash.clone(),
        };
        if gateway.replay.check_and_store(fingerprint) == Admission::Replay {
            return gateway.deny(
                &ctx,
                ReasonCode::ReplayDetected,
                "duplicate request within the replay window".to_string(),
            );
        }
    }

    // Mandate verification
    let mandate = match header_str(&req_headers, headers::MANDATE) {
        Some(raw) => match b64::decode_json_header::<Mandate>(raw) {
            Ok(mandate) => Some(mandate),
            Err(e) => {
                ctx.mandate_verdict = MandateVerdict::Denied;
                return gateway.deny(
                    &ctx,
                    ReasonCode::InvalidSignature,
                    format!("malformed mandate header: {e}"),
                );
            }
        },
        None => None,
    };

    if let Some(mandate) = &mandate {
        ctx.mandate_id = Some(mandate.mandate_id.clone());
        ctx.mandate_hash = Some(mandate.mandate_hash());
        let context = MandateContext {
            tool_id: rule.tool_id.clone(),
            price: rule.price,
            spent_today: gateway.spend.spent_today(&mandate.mandate_id),
            user_confirmed: header_str(&req_headers, headers::USER_CONFIRMED)
                .is_some_and(|v| v.eq_ignore_ascii_case("true")),
            now: Utc::now(),
        };
        if let Err(denial) = mandate.verify(&context) {
            ctx.mandate_verdict = MandateVerdict::Denied;
            let reason = match &denial {
                MandateDenial::Expired(_) => ReasonCode::MandateExpired,
                MandateDenial::NotAllowlisted(_) => ReasonCode::EndpointNotAllowlisted,
                MandateDenial::ConfirmRequired { .. } => ReasonCode::MandateConfirmRequired,
                MandateDenial::BudgetExceeded { .. } => ReasonCode::MandateBudgetExceeded,
                MandateDenial::InvalidSignature(_) => ReasonCode::InvalidSignature,
            };
            return gateway.deny(&ctx, reason, denial.to_string());
        }
        ctx.mandate_verdict = MandateVerdict::Approved;
    } else if rule.restricted {
        ctx.mandate_verdict = MandateVerdict::Denied;
        return gateway.deny(
            &ctx,
            ReasonCode::EndpointNotAllowlisted,
            "route is restricted and requires a mandate".to_string(),
        );
    }

    // Anchor the encrypted intent before payment (optional, fire-and-forget)
    if let Some(anchor) = &gateway.anchor
        && let Some(digest) = anchor::digest_to_b256(&ctx.request_hash)
    {
        anchor.submit(AnchorJob::Store {
            request_id: ctx.request_id,
            digest,
        });
    }

    // Payment: quote with 402 when no header, verify otherwise
    let Some(payment_header) = header_str(&req_headers, headers::PAYMENT) else {
        let body = gateway.coordinator.payment_required_body(rule, None);
        let receipt = gateway.emit_receipt(
            &ctx,
            Outcome::Denied,
            ReasonCode::InvalidPayment,
            "payment required: no X-Payment header".to_string(),
        );
        return with_receipt_header(
            (StatusCode::PAYMENT_REQUIRED, axum::Json(body)).into_response(),
            &receipt,
        );
    };

    let verified = match gateway.coordinator.verify(rule, payment_header).await {
        Ok(verified) => verified,
        Err(denied) => {
            let explanation = denied.to_string();
            let error = match denied {
                PaymentDenied::Rejected(reason) => Some(reason),
                _ => None,
            };
            let body = gateway.coordinator.payment_required_body(rule, error);
            let receipt = gateway.emit_receipt(
                &ctx,
                Outcome::Denied,
                ReasonCode::InvalidPayment,
                explanation,
            );
            return with_receipt_header(
                (StatusCode::PAYMENT_REQUIRED, axum::Json(body)).into_response(),
                &receipt,
            );
        }
    };

    // Budget charge: atomic add-if-under-cap, taken before settlement so
    // concurrent requests cannot jointly overrun the mandate cap.
    let mut charged = false;
    if let Some(mandate) = &mandate {
        match gateway.spend.try_charge(
            &mandate.mandate_id,
            rule.price,
            mandate.max_spend_usdc_per_day,
        ) {
            ChargeOutcome::Charged => charged = true,
            ChargeOutcome::BudgetExceeded => {
                ctx.mandate_verdict = MandateVerdict::Denied;
                return gateway.deny(
                    &ctx,
                    ReasonCode::MandateBudgetExceeded,
                    "daily budget exhausted by a concurrent request".to_string(),
                );
            }
        }
    }

    // Upstream proxy. Transport failure is not a payment failure: refund the
    // charge, skip settlement, and report 502.
    let upstream = match proxy::forward(
        &gateway.upstream_client,
        &rule.provider,
        &ctx.method,
        &ctx.path,
        &query,
        &req_headers,
        body,
    )
    .await
    {
        Ok(upstream) => upstream,
        Err(e) => {
            if charged && let Some(mandate) = &mandate {
                gateway.spend.refund(&mandate.mandate_id, rule.price);
            }
            tracing::warn!(request_id = %ctx.request_id, error = %e, "upstream proxy failed");
            let receipt = gateway.emit_receipt(
                &ctx,
                Outcome::Error,
                ReasonCode::UpstreamErrorNoCharge,
                format!("upstream unreachable, payment not settled: {e}"),
            );
            let body = json!({
                "error": ReasonCode::UpstreamErrorNoCharge,
                "explanation": "upstream request failed; the payment was not settled",
            });
            return with_receipt_header(
                (StatusCode::BAD_GATEWAY, axum::Json(body)).into_response(),
                &receipt,
            );
        }
    };
    ctx.response_hash = Some(upstream.response_hash.clone());

    // Settlement. Failure is soft: the upstream response is still returned,
    // but the receipt carries no tx hash and the charge is rolled back.
    let (outcome, reason, explanation) = match gateway.coordinator.settle(&verified).await {
        Ok(settlement) => {
            ctx.payment_tx_hash = Some(settlement.tx_hash.clone());
            ctx.facilitator_receipt_id = settlement.receipt_id.clone();
            if let Some(anchor) = &gateway.anchor {
                anchor.submit(AnchorJob::Reveal {
                    request_id: ctx.request_id,
                });
            }
            (Outcome::Success, ReasonCode::Ok, "OK".to_string())
        }
        Err(e) => {
            if charged && let Some(mandate) = &mandate {
                gateway.spend.refund(&mandate.mandate_id, rule.price);
            }
            tracing::error!(request_id = %ctx.request_id, error = %e, "settlement failed after upstream success");
            (
                Outcome::Error,
                ReasonCode::InternalError,
                format!("settlement failed, response delivered without charge: {e}"),
            )
        }
    };

    let receipt = gateway.emit_receipt(&ctx, outcome, reason, explanation);
    tracing::info!(
        request_id = %ctx.request_id,
        tool_id = %ctx.tool_id,
        outcome = ?receipt.outcome,
        latency_ms = receipt.latency_ms,
        "request completed"
    );

    // Relay the upstream response with the receipt attached
    let mut response = Response::builder()
        .status(upstream.status)
        .body(Body::from(upstream.body))
        .expect("upstream relay response");
    for (name, value) in upstream.headers.iter() {
        let lowered = name.as_str().to_ascii_lowercase();
        // Hop-by-hop headers stay behind; content-length is recomputed.
        if matches!(
            lowered.as_str(),
            "connection" | "transfer-encoding" | "content-length" | "keep-alive"
        ) {
            continue;
        }
        response.headers_mut().append(name, value.clone());
    }
    with_receipt_header(response, &receipt)
}
