//! End-to-end pipeline tests against stub upstream and facilitator servers.

use axum::Router;
use axum::http::HeaderMap;
use axum::routing::{any, get, post};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as b64;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use alloy::signers::SignerSync;
use alloy::signers::local::PrivateKeySigner;

use tollgate::admission::AgentBlocklist;
use tollgate::config::GatewayConfig;
use tollgate::facilitator::FacilitatorClient;
use tollgate::mandate::{Mandate, MandateSignature};
use tollgate::network::Network;
use tollgate::payment::PaymentCoordinator;
use tollgate::pipeline::{self, Gateway};
use tollgate::receipt::{Outcome, ReceiptQuery, ReceiptStore};
use tollgate::replay::ReplayStore;
use tollgate::route_table::{CompiledTable, Provider, RouteRule, RouteTable};
use tollgate::spend::SpendTracker;

const PAY_TO: &str = "0x209693Bc6afc0C5328bA36FaF03C514EF312287C";

/// Spawn a router on an ephemeral port and return its base address.
async fn spawn_server(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Stub upstream: serves `{"q":42}` and echoes received headers for
/// hygiene assertions.
async fn spawn_upstream() -> SocketAddr {
    async fn quote(headers: HeaderMap) -> axum::Json<Value> {
        let leaked: Vec<String> = headers
            .keys()
            .map(|k| k.as_str().to_string())
            .filter(|k| k.starts_with("x-") || k == "host")
            .collect();
        axum::Json(json!({ "q": 42, "seenHeaders": leaked }))
    }
    spawn_server(Router::new().route("/api/v1/quote", any(quote))).await
}

#[derive(Default)]
struct FacilitatorCounters {
    verify_calls: AtomicUsize,
    settle_calls: AtomicUsize,
}

/// Stub facilitator: approves every verify and settles with a fixed hash.
async fn spawn_facilitator(counters: Arc<FacilitatorCounters>) -> SocketAddr {
    let verify_counters = counters.clone();
    let settle_counters = counters;
    let verify = post(move |axum::Json(body): axum::Json<Value>| {
        let counters = verify_counters.clone();
        async move {
            counters.verify_calls.fetch_add(1, Ordering::SeqCst);
            let valid = body["paymentPayload"]["ok"] == json!(true);
            if valid {
                axum::Json(json!({ "isValid": true, "payer": "0xpayer" }))
            } else {
                axum::Json(json!({ "isValid": false, "invalidReason": "bad signature" }))
            }
        }
    });
    let settle = post(move |axum::Json(_body): axum::Json<Value>| {
        let counters = settle_counters.clone();
        async move {
            counters.settle_calls.fetch_add(1, Ordering::SeqCst);
            axum::Json(json!({
                "success": true,
                "payer": "0xpayer",
                "transaction": "0x3b0e6f4a2f1f2b9a3c8d1e5f6a7b8c9d0e1f2a3b4c5d6e7f8a9b0c1d2e3f4a5b",
                "network": "eip155:84532",
            }))
        }
    });
    let supported = get(|| async {
        axum::Json(json!({
            "kinds": [{ "x402Version": 1, "scheme": "exact", "network": "eip155:84532" }]
        }))
    });
    spawn_server(
        Router::new()
            .route("/verify", verify)
            .route("/settle", settle)
            .route("/supported", supported),
    )
    .await
}

/// Stub facilitator that verifies everything but settles without naming a
/// transaction hash.
async fn spawn_facilitator_without_tx() -> SocketAddr {
    let verify = post(|axum::Json(_body): axum::Json<Value>| async {
        axum::Json(json!({ "isValid": true, "payer": "0xpayer" }))
    });
    let settle = post(|axum::Json(_body): axum::Json<Value>| async {
        axum::Json(json!({ "success": true, "payer": "0xpayer" }))
    });
    spawn_server(
        Router::new()
            .route("/verify", verify)
            .route("/settle", settle),
    )
    .await
}

fn quote_route(upstream: SocketAddr) -> RouteRule {
    RouteRule {
        method: "GET".to_string(),
        path: "/api/v1/quote".to_string(),
        tool_id: "quote".to_string(),
        price: "0.01".parse().unwrap(),
        provider: Provider {
            id: "acme".to_string(),
            backend_url: format!("http://{upstream}").parse().unwrap(),
            auth: None,
        },
        group: None,
        description: None,
        restricted: false,
        skip_ssrf: true,
    }
}

/// Assemble a gateway around the stub servers and expose it over HTTP.
async fn spawn_gateway(
    upstream: SocketAddr,
    facilitator: SocketAddr,
    admin_key: Option<&str>,
) -> (SocketAddr, Arc<Gateway>) {
    let scratch = std::env::temp_dir().join(format!("tollgate-e2e-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&scratch).unwrap();
    let config = GatewayConfig {
        pay_to: PAY_TO.parse().unwrap(),
        port: 0,
        facilitator_url: format!("http://{facilitator}"),
        network: Network::BaseSepolia,
        admin_key: admin_key.map(|k| k.to_string()),
        routes_file: scratch.join("routes.json"),
        config_file: scratch.join("config.json"),
        replay_ttl: Duration::from_secs(60),
        facilitator_key: None,
        anchor: None,
    };

    let table = CompiledTable::compile(vec![quote_route(upstream)]).unwrap();
    let routes = RouteTable::new(table);

    let client = FacilitatorClient::try_new(&format!("http://{facilitator}")).unwrap();
    let coordinator = Arc::new(PaymentCoordinator::new(
        client,
        PAY_TO.to_string(),
        Network::BaseSepolia.caip2(),
    ));
    routes.subscribe(coordinator.clone());

    let gateway = Arc::new(Gateway {
        config,
        api_key: None,
        routes,
        replay: Arc::new(ReplayStore::new(Duration::from_secs(60))),
        spend: SpendTracker::new(),
        coordinator,
        receipts: ReceiptStore::new(ReceiptStore::DEFAULT_CAPACITY),
        blocklist: AgentBlocklist::default(),
        upstream_client: reqwest::Client::new(),
        anchor: None,
    });

    let app = Router::new()
        .route("/health", get(tollgate::handlers::health))
        .route("/api/{*path}", any(pipeline::handle_api))
        .nest("/admin", tollgate::handlers::admin_router(gateway.clone()))
        .with_state(gateway.clone());
    let addr = spawn_server(app).await;
    (addr, gateway)
}

fn payment_header(ok: bool) -> String {
    b64.encode(json!({ "ok": ok }).to_string())
}

fn mandate_header(allowlist: &[&str], cap: &str) -> String {
    let signer = PrivateKeySigner::random();
    let mut mandate = Mandate {
        mandate_id: "m-e2e".to_string(),
        owner_pubkey: format!("{:#x}", signer.address()),
        expires_at: Utc::now() + ChronoDuration::hours(1),
        max_spend_usdc_per_day: cap.parse().unwrap(),
        allowlisted_tool_ids: allowlist.iter().map(|s| s.to_string()).collect(),
        require_user_confirm_for_price_over: None,
        signature: MandateSignature([0u8; 65]),
    };
    let signature = signer
        .sign_message_sync(mandate.signing_payload().as_bytes())
        .unwrap();
    mandate.signature = MandateSignature(signature.as_bytes());
    b64.encode(serde_json::to_vec(&mandate).unwrap())
}

fn decode_receipt(response: &reqwest::Response) -> Value {
    let header = response.headers().get("x-receipt").unwrap().to_str().unwrap();
    serde_json::from_slice(&b64.decode(header).unwrap()).unwrap()
}

#[tokio::test]
async fn missing_payment_yields_402_with_quote_and_receipt() {
    let upstream = spawn_upstream().await;
    let facilitator = spawn_facilitator(Arc::default()).await;
    let (addr, gateway) = spawn_gateway(upstream, facilitator, None).await;

    let response = reqwest::get(format!("http://{addr}/api/v1/quote"))
        .await
        .unwrap();
    assert_eq!(response.status(), 402);

    let receipt = decode_receipt(&response);
    assert_eq!(receipt["outcome"], "DENIED");
    assert_eq!(receipt["reasonCode"], "INVALID_PAYMENT");

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["accepts"][0]["scheme"], "exact");
    assert_eq!(body["accepts"][0]["price"], "$0.01");
    assert_eq!(body["accepts"][0]["network"], "eip155:84532");
    assert_eq!(body["accepts"][0]["payTo"], PAY_TO);
    assert_eq!(body["mimeType"], "application/json");

    let stored = gateway.receipts.query(&ReceiptQuery::default());
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].outcome, Outcome::Denied);
}

#[tokio::test]
async fn paid_request_with_mandate_succeeds_and_settles() {
    let upstream = spawn_upstream().await;
    let counters = Arc::new(FacilitatorCounters::default());
    let facilitator = spawn_facilitator(counters.clone()).await;
    let (addr, gateway) = spawn_gateway(upstream, facilitator, None).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/api/v1/quote"))
        .header("x-payment", payment_header(true))
        .header("x-mandate", mandate_header(&["quote"], "1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let receipt = decode_receipt(&response);
    assert_eq!(receipt["outcome"], "SUCCESS");
    assert_eq!(receipt["reasonCode"], "OK");
    assert_eq!(receipt["mandateVerdict"], "APPROVED");
    assert!(
        receipt["paymentTxHash"]
            .as_str()
            .unwrap()
            .starts_with("0x")
    );
    assert!(receipt["responseHash"].as_str().unwrap().starts_with("0x"));

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["q"], 42);
    // Header hygiene: internal gateway headers never reach the upstream
    let seen = body["seenHeaders"].as_array().unwrap();
    assert!(!seen.iter().any(|h| h == "x-payment" || h == "x-mandate"));

    assert_eq!(counters.verify_calls.load(Ordering::SeqCst), 1);
    assert_eq!(counters.settle_calls.load(Ordering::SeqCst), 1);
    assert_eq!(gateway.spend.spent_today("m-e2e").to_string(), "0.01");
}

#[tokio::test]
async fn mandate_allowlist_mismatch_denies_without_settlement() {
    let upstream = spawn_upstream().await;
    let counters = Arc::new(FacilitatorCounters::default());
    let facilitator = spawn_facilitator(counters.clone()).await;
    let (addr, gateway) = spawn_gateway(upstream, facilitator, None).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/api/v1/quote"))
        .header("x-payment", payment_header(true))
        .header("x-mandate", mandate_header(&["other"], "1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    let receipt = decode_receipt(&response);
    assert_eq!(receipt["reasonCode"], "ENDPOINT_NOT_ALLOWLISTED");
    assert_eq!(receipt["mandateVerdict"], "DENIED");

    assert_eq!(counters.settle_calls.load(Ordering::SeqCst), 0);
    assert_eq!(gateway.spend.spent_today("m-e2e").to_string(), "0");
}

#[tokio::test]
async fn replayed_idempotency_key_is_rejected() {
    let upstream = spawn_upstream().await;
    let facilitator = spawn_facilitator(Arc::default()).await;
    let (addr, _gateway) = spawn_gateway(upstream, facilitator, None).await;

    let client = reqwest::Client::new();
    let send = || {
        client
            .get(format!("http://{addr}/api/v1/quote"))
            .header("x-payment", payment_header(true))
            .header("x-request-idempotency-key", "idem-1")
            .send()
    };

    let first = send().await.unwrap();
    assert_eq!(first.status(), 200);

    let second = send().await.unwrap();
    assert_eq!(second.status(), 409);
    let receipt = decode_receipt(&second);
    assert_eq!(receipt["reasonCode"], "REPLAY_DETECTED");
}

#[tokio::test]
async fn rejected_payment_returns_402_with_facilitator_error() {
    let upstream = spawn_upstream().await;
    let facilitator = spawn_facilitator(Arc::default()).await;
    let (addr, _gateway) = spawn_gateway(upstream, facilitator, None).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/api/v1/quote"))
        .header("x-payment", payment_header(false))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 402);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "bad signature");
}

#[tokio::test]
async fn unreachable_upstream_is_502_without_settlement() {
    let counters = Arc::new(FacilitatorCounters::default());
    let facilitator = spawn_facilitator(counters.clone()).await;
    // A bound-then-dropped listener gives a port that refuses connections.
    let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);
    let (addr, gateway) = spawn_gateway(dead_addr, facilitator, None).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/api/v1/quote"))
        .header("x-payment", payment_header(true))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);

    let receipt = decode_receipt(&response);
    assert_eq!(receipt["outcome"], "ERROR");
    assert_eq!(receipt["reasonCode"], "UPSTREAM_ERROR_NO_CHARGE");
    assert_eq!(counters.settle_calls.load(Ordering::SeqCst), 0);

    let stored = gateway.receipts.query(&ReceiptQuery::default());
    assert_eq!(stored.len(), 1);
}

#[tokio::test]
async fn settlement_without_tx_hash_is_error_and_refunded() {
    let upstream = spawn_upstream().await;
    let facilitator = spawn_facilitator_without_tx().await;
    let (addr, gateway) = spawn_gateway(upstream, facilitator, None).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/api/v1/quote"))
        .header("x-payment", payment_header(true))
        .header("x-mandate", mandate_header(&["quote"], "1"))
        .send()
        .await
        .unwrap();
    // The upstream response is still relayed
    assert_eq!(response.status(), 200);

    let receipt = decode_receipt(&response);
    assert_eq!(receipt["outcome"], "ERROR");
    assert!(receipt["paymentTxHash"].is_null());

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["q"], 42);

    // The charge taken before settlement was rolled back
    assert_eq!(gateway.spend.spent_today("m-e2e").to_string(), "0");
}

#[tokio::test]
async fn unknown_route_is_404_with_receipt() {
    let upstream = spawn_upstream().await;
    let facilitator = spawn_facilitator(Arc::default()).await;
    let (addr, _gateway) = spawn_gateway(upstream, facilitator, None).await;

    let response = reqwest::get(format!("http://{addr}/api/v1/nope"))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let receipt = decode_receipt(&response);
    assert_eq!(receipt["reasonCode"], "ROUTE_NOT_FOUND");
}

#[tokio::test]
async fn blocked_agent_is_denied() {
    let upstream = spawn_upstream().await;
    let facilitator = spawn_facilitator(Arc::default()).await;
    let (addr, gateway) = spawn_gateway(upstream, facilitator, None).await;
    gateway.blocklist.insert("0xBADAgent");

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/api/v1/quote"))
        .header("x-agent-address", "0xbadagent")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
    let receipt = decode_receipt(&response);
    assert_eq!(receipt["reasonCode"], "AGENT_BLOCKED");
}

#[tokio::test]
async fn admin_add_route_with_loopback_backend_is_ssrf_blocked() {
    let upstream = spawn_upstream().await;
    let facilitator = spawn_facilitator(Arc::default()).await;
    let (addr, gateway) = spawn_gateway(upstream, facilitator, Some("admin-key")).await;

    let mut rule = quote_route(upstream);
    rule.tool_id = "evil".to_string();
    rule.provider.backend_url = "http://127.0.0.1:9000".parse().unwrap();
    rule.skip_ssrf = false;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/admin/routes"))
        .bearer_auth("admin-key")
        .json(&rule)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "SSRF_BLOCKED");
    assert!(gateway.routes.snapshot().get("evil").is_none());
}

#[tokio::test]
async fn admin_add_route_fronting_x402_upstream_is_blocked() {
    let upstream = spawn_upstream().await;
    let facilitator = spawn_facilitator(Arc::default()).await;
    let (addr, gateway) = spawn_gateway(upstream, facilitator, Some("admin-key")).await;

    // An upstream that already answers 402 with a payment-required header
    let paid_upstream = spawn_server(Router::new().route(
        "/api/v1/premium",
        any(|| async {
            (
                axum::http::StatusCode::PAYMENT_REQUIRED,
                [("payment-required", "exact")],
                "pay me",
            )
        }),
    ))
    .await;

    let mut rule = quote_route(paid_upstream);
    rule.tool_id = "premium".to_string();
    rule.path = "/api/v1/premium".to_string();

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/admin/routes"))
        .bearer_auth("admin-key")
        .json(&rule)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "X402_UPSTREAM_BLOCKED");
    assert!(gateway.routes.snapshot().get("premium").is_none());
}

#[tokio::test]
async fn admin_requires_bearer_token() {
    let upstream = spawn_upstream().await;
    let facilitator = spawn_facilitator(Arc::default()).await;
    let (addr, _gateway) = spawn_gateway(upstream, facilitator, Some("admin-key")).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/admin/routes"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = client
        .get(format!("http://{addr}/admin/routes"))
        .bearer_auth("admin-key")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn daily_budget_cap_holds_across_sequential_requests() {
    let upstream = spawn_upstream().await;
    let facilitator = spawn_facilitator(Arc::default()).await;
    let (addr, gateway) = spawn_gateway(upstream, facilitator, None).await;

    // Cap allows exactly two $0.01 calls
    let mandate = mandate_header(&["quote"], "0.02");
    let client = reqwest::Client::new();
    for _ in 0..2 {
        let response = client
            .get(format!("http://{addr}/api/v1/quote"))
            .header("x-payment", payment_header(true))
            .header("x-mandate", &mandate)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    let third = client
        .get(format!("http://{addr}/api/v1/quote"))
        .header("x-payment", payment_header(true))
        .header("x-mandate", &mandate)
        .send()
        .await
        .unwrap();
    assert_eq!(third.status(), 403);
    let receipt = decode_receipt(&third);
    assert_eq!(receipt["reasonCode"], "MANDATE_BUDGET_EXCEEDED");
    assert_eq!(gateway.spend.spent_today("m-e2e").to_string(), "0.02");
}

#[tokio::test]
async fn health_is_public() {
    let upstream = spawn_upstream().await;
    let facilitator = spawn_facilitator(Arc::default()).await;
    let (addr, _gateway) = spawn_gateway(upstream, facilitator, None).await;

    let response = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}
