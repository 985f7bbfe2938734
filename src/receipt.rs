//! Receipts: the structured record every admitted request leaves behind.
//!
//! A receipt is built once per request from state the pipeline gathered
//! along the way, appended to the in-memory store, and returned to the
//! caller base64-encoded in the `X-Receipt` response header. `outcome` and
//! `reason_code` are closed enums; clients may rely on the exact sets.

use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use uuid::Uuid;

use crate::network::ChainId;
use crate::usd::UsdAmount;

/// Terminal state of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "DENIED")]
    Denied,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "REFUNDED")]
    Refunded,
}

/// Verdict of the mandate stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MandateVerdict {
    #[serde(rename = "APPROVED")]
    Approved,
    #[serde(rename = "DENIED")]
    Denied,
    #[serde(rename = "SKIPPED")]
    Skipped,
}

/// Closed denial/success taxonomy. Every pipeline exit maps to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReasonCode {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "UNAUTHORIZED")]
    Unauthorized,
    #[serde(rename = "AGENT_BLOCKED")]
    AgentBlocked,
    #[serde(rename = "RATE_LIMITED")]
    RateLimited,
    #[serde(rename = "ROUTE_NOT_FOUND")]
    RouteNotFound,
    #[serde(rename = "SSRF_BLOCKED")]
    SsrfBlocked,
    #[serde(rename = "X402_UPSTREAM_BLOCKED")]
    X402UpstreamBlocked,
    #[serde(rename = "REPLAY_DETECTED")]
    ReplayDetected,
    #[serde(rename = "MANDATE_EXPIRED")]
    MandateExpired,
    #[serde(rename = "ENDPOINT_NOT_ALLOWLISTED")]
    EndpointNotAllowlisted,
    #[serde(rename = "MANDATE_BUDGET_EXCEEDED")]
    MandateBudgetExceeded,
    #[serde(rename = "MANDATE_CONFIRM_REQUIRED")]
    MandateConfirmRequired,
    #[serde(rename = "INVALID_SIGNATURE")]
    InvalidSignature,
    #[serde(rename = "INVALID_PAYMENT")]
    InvalidPayment,
    #[serde(rename = "UPSTREAM_ERROR_NO_CHARGE")]
    UpstreamErrorNoCharge,
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
}

impl ReasonCode {
    /// The HTTP status a pipeline denial with this reason responds with.
    pub fn http_status(&self) -> StatusCode {
        match self {
            ReasonCode::Ok => StatusCode::OK,
            ReasonCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ReasonCode::AgentBlocked => StatusCode::FORBIDDEN,
            ReasonCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ReasonCode::RouteNotFound => StatusCode::NOT_FOUND,
            ReasonCode::SsrfBlocked | ReasonCode::X402UpstreamBlocked => StatusCode::BAD_REQUEST,
            ReasonCode::ReplayDetected => StatusCode::CONFLICT,
            ReasonCode::MandateExpired
            | ReasonCode::EndpointNotAllowlisted
            | ReasonCode::MandateBudgetExceeded
            | ReasonCode::MandateConfirmRequired
            | ReasonCode::InvalidSignature => StatusCode::FORBIDDEN,
            ReasonCode::InvalidPayment => StatusCode::PAYMENT_REQUIRED,
            ReasonCode::UpstreamErrorNoCharge => StatusCode::BAD_GATEWAY,
            ReasonCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// The per-request receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub request_id: Uuid,
    pub tool_id: String,
    pub provider_id: String,
    pub endpoint: String,
    pub method: String,
    pub timestamp: DateTime<Utc>,
    pub price_usdc: UsdAmount,
    pub chain: ChainId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mandate_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mandate_hash: Option<String>,
    pub mandate_verdict: MandateVerdict,
    pub reason_code: ReasonCode,
    pub payment_tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facilitator_receipt_id: Option<String>,
    pub request_hash: String,
    pub response_hash: Option<String>,
    pub latency_ms: Option<u64>,
    pub outcome: Outcome,
    pub explanation: String,
}

/// Query over the receipt store. Empty filter matches everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReceiptQuery {
    pub tool_id: Option<String>,
    pub outcome: Option<Outcome>,
    pub limit: Option<usize>,
}

/// Aggregate receipt statistics, derived on demand.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptStats {
    pub total: usize,
    pub success: usize,
    pub denied: usize,
    pub error: usize,
    pub success_rate: f64,
    pub total_usdc: UsdAmount,
    pub average_latency_ms: Option<f64>,
}

/// Bounded, append-only, in-memory receipt log.
pub struct ReceiptStore {
    entries: Mutex<VecDeque<Receipt>>,
    capacity: usize,
}

impl ReceiptStore {
    pub const DEFAULT_CAPACITY: usize = 10_000;

    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Append a receipt, discarding the oldest entry past capacity.
    pub fn append(&self, receipt: Receipt) {
        let mut entries = self.entries.lock().expect("receipt store lock poisoned");
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(receipt);
    }

    /// Query receipts, newest first.
    pub fn query(&self, query: &ReceiptQuery) -> Vec<Receipt> {
        let entries = self.entries.lock().expect("receipt store lock poisoned");
        let limit = query.limit.unwrap_or(usize::MAX);
        entries
            .iter()
            .rev()
            .filter(|r| {
                query
                    .tool_id
                    .as_ref()
                    .is_none_or(|tool_id| &r.tool_id == tool_id)
                    && query.outcome.is_none_or(|outcome| r.outcome == outcome)
            })
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("receipt store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .expect("receipt store lock poisoned")
            .clear();
    }

    /// Derive aggregate statistics over the whole log.
    pub fn stats(&self) -> ReceiptStats {
        let entries = self.entries.lock().expect("receipt store lock poisoned");
        let total = entries.len();
        let success = entries
            .iter()
            .filter(|r| r.outcome == Outcome::Success)
            .count();
        let denied = entries
            .iter()
            .filter(|r| r.outcome == Outcome::Denied)
            .count();
        let error = entries
            .iter()
            .filter(|r| r.outcome == Outcome::Error)
            .count();
        let total_usdc = entries
            .iter()
            .filter(|r| r.outcome == Outcome::Success)
            .fold(UsdAmount::ZERO, |acc, r| acc + r.price_usdc);
        let latencies: Vec<u64> = entries.iter().filter_map(|r| r.latency_ms).collect();
        let average_latency_ms = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<u64>() as f64 / latencies.len() as f64)
        };
        ReceiptStats {
            total,
            success,
            denied,
            error,
            success_rate: if total == 0 {
                0.0
            } else {
                success as f64 / total as f64
            },
            total_usdc,
            average_latency_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt(tool_id: &str, outcome: Outcome, price: &str) -> Receipt {
        Receipt {
            request_id: Uuid::new_v4(),
            tool_id: tool_id.to_string(),
            provider_id: "acme".to_string(),
            endpoint: "/api/v1/quote".to_string(),
            method: "GET".to_string(),
            timestamp: Utc::now(),
            price_usdc: price.parse().unwrap(),
            chain: ChainId::eip155(84532),
            mandate_id: None,
            mandate_hash: None,
            mandate_verdict: MandateVerdict::Skipped,
            reason_code: ReasonCode::Ok,
            payment_tx_hash: None,
            facilitator_receipt_id: None,
            request_hash: "0xabc".to_string(),
            response_hash: None,
            latency_ms: Some(12),
            outcome,
            explanation: String::new(),
        }
    }

    #[test]
    fn query_filters_by_tool_and_outcome() {
        let store = ReceiptStore::new(16);
        store.append(receipt("quote", Outcome::Success, "0.01"));
        store.append(receipt("quote", Outcome::Denied, "0.01"));
        store.append(receipt("news", Outcome::Success, "0.02"));

        let query = ReceiptQuery {
            tool_id: Some("quote".to_string()),
            outcome: Some(Outcome::Success),
            limit: None,
        };
        let hits = store.query(&query);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tool_id, "quote");
    }

    #[test]
    fn query_returns_newest_first() {
        let store = ReceiptStore::new(16);
        store.append(receipt("a", Outcome::Success, "0.01"));
        std::thread::sleep(std::time::Duration::from_millis(2));
        store.append(receipt("b", Outcome::Success, "0.01"));
        let all = store.query(&ReceiptQuery::default());
        assert_eq!(all[0].tool_id, "b");
        assert!(all[0].timestamp >= all[1].timestamp);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let store = ReceiptStore::new(2);
        store.append(receipt("a", Outcome::Success, "0.01"));
        store.append(receipt("b", Outcome::Success, "0.01"));
        store.append(receipt("c", Outcome::Success, "0.01"));
        let all = store.query(&ReceiptQuery::default());
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|r| r.tool_id != "a"));
    }

    #[test]
    fn stats_sum_only_successful_spend() {
        let store = ReceiptStore::new(16);
        store.append(receipt("quote", Outcome::Success, "0.01"));
        store.append(receipt("quote", Outcome::Denied, "0.50"));
        let stats = store.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.success, 1);
        assert_eq!(stats.total_usdc.to_string(), "0.01");
        assert_eq!(stats.success_rate, 0.5);
    }

    #[test]
    fn reason_codes_serialize_screaming() {
        assert_eq!(
            serde_json::to_string(&ReasonCode::X402UpstreamBlocked).unwrap(),
            "\"X402_UPSTREAM_BLOCKED\""
        );
        assert_eq!(
            serde_json::to_string(&ReasonCode::UpstreamErrorNoCharge).unwrap(),
            "\"UPSTREAM_ERROR_NO_CHARGE\""
        );
    }

    #[test]
    fn status_mapping_matches_pipeline_table() {
        assert_eq!(ReasonCode::Unauthorized.http_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ReasonCode::AgentBlocked.http_status(), StatusCode::FORBIDDEN);
        assert_eq!(ReasonCode::RouteNotFound.http_status(), StatusCode::NOT_FOUND);
        assert_eq!(ReasonCode::ReplayDetected.http_status(), StatusCode::CONFLICT);
        assert_eq!(
            ReasonCode::InvalidPayment.http_status(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            ReasonCode::UpstreamErrorNoCharge.http_status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
