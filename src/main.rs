//! Gateway HTTP entrypoint.
//!
//! Startup order: `.env`, tracing, environment config (fatal on a missing
//! pay-to address), routes file, SSRF validation of every loaded rule,
//! dependency wiring, then the Axum server. Exits non-zero on any startup
//! misconfiguration and zero on graceful shutdown.

use axum::Router;
use axum::http::Method;
use axum::routing::{any, get};
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors;
use tower_http::trace::TraceLayer;

use tollgate::admission::{self, AgentBlocklist};
use tollgate::anchor;
use tollgate::config::{ConfigDoc, GatewayConfig};
use tollgate::facilitator::{FacilitatorAuth, FacilitatorClient};
use tollgate::handlers;
use tollgate::payment::PaymentCoordinator;
use tollgate::pipeline::{self, Gateway};
use tollgate::receipt::ReceiptStore;
use tollgate::replay::ReplayStore;
use tollgate::route_table::{CompiledTable, RouteTable};
use tollgate::routes_store;
use tollgate::spend::SpendTracker;
use tollgate::telemetry;

#[tokio::main]
async fn main() {
    dotenv().ok();
    telemetry::init();

    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let routes_doc = match routes_store::load(&config.routes_file) {
        Ok(doc) => doc,
        Err(e) => {
            tracing::error!("failed to load routes file: {e}");
            std::process::exit(1);
        }
    };

    // Every persisted rule must pass the SSRF guard unless skip-flagged.
    for rule in &routes_doc.routes {
        if rule.skip_ssrf {
            continue;
        }
        if let Err(e) = admission::assert_public_backend(&rule.provider.backend_url).await {
            tracing::error!(tool_id = %rule.tool_id, "route refused: {e}");
            std::process::exit(1);
        }
    }

    let table = match CompiledTable::compile(routes_doc.routes) {
        Ok(table) => table,
        Err(e) => {
            tracing::error!("failed to compile routes: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!(routes = table.len(), "route table compiled");
    let routes = RouteTable::new(table);

    let facilitator = match FacilitatorClient::try_new(&config.facilitator_url) {
        Ok(client) => match &config.facilitator_key {
            Some(key) => {
                client.with_auth(FacilitatorAuth::new(key.key_id.clone(), key.secret.clone()))
            }
            None => client,
        },
        Err(e) => {
            tracing::error!("invalid facilitator URL: {e}");
            std::process::exit(1);
        }
    };

    // The CAIP-2 network is fixed here; later config changes never retarget
    // the facilitator.
    let coordinator = Arc::new(PaymentCoordinator::new(
        facilitator,
        config.pay_to.to_string(),
        config.network.caip2(),
    ));
    routes.subscribe(coordinator.clone());
    coordinator.check_supported().await;

    let config_doc = match ConfigDoc::load(&config.config_file) {
        Ok(doc) => doc,
        Err(e) => {
            tracing::error!("failed to load config document: {e}");
            std::process::exit(1);
        }
    };

    // Background tasks register here; shutdown closes the tracker and waits
    // for every task before the process exits.
    let shutdown = CancellationToken::new();
    let tracker = TaskTracker::new();

    let replay = Arc::new(ReplayStore::new(config.replay_ttl));
    replay.spawn_sweeper(shutdown.clone(), &tracker);

    let anchor = match &config.anchor {
        Some(anchor_config) => {
            match anchor::spawn(anchor_config.clone(), shutdown.clone(), &tracker) {
                Ok(handle) => {
                    tracing::info!(contract = %anchor_config.contract, "anchor writer started");
                    Some(handle)
                }
                Err(e) => {
                    tracing::error!("failed to start anchor writer: {e}");
                    std::process::exit(1);
                }
            }
        }
        None => None,
    };

    let port = config.port;
    let gateway = Arc::new(Gateway {
        api_key: config_doc.api_key.clone(),
        blocklist: AgentBlocklist::new(config_doc.agent_blocklist.clone()),
        routes,
        replay,
        spend: SpendTracker::new(),
        coordinator,
        receipts: ReceiptStore::new(ReceiptStore::DEFAULT_CAPACITY),
        upstream_client: reqwest::Client::new(),
        anchor,
        config,
    });

    let app = Router::new()
        .route("/health", get(handlers::health))
        .route("/api/{*path}", any(pipeline::handle_api))
        .nest("/admin", handlers::admin_router(gateway.clone()))
        .with_state(gateway)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                )
            }),
        )
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!("gateway listening on http://{addr}");

    let serve_shutdown = shutdown.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        serve_shutdown.cancelled().await;
    });

    let signal_shutdown = shutdown.clone();
    tracker.spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!("failed to install SIGINT handler: {e}");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("SIGTERM received"),
            _ = sigint.recv() => tracing::info!("SIGINT received"),
            _ = signal_shutdown.cancelled() => {}
        }
        signal_shutdown.cancel();
    });

    if let Err(e) = server.await {
        tracing::error!("server error: {e}");
        std::process::exit(1);
    }

    // Drain background tasks: the sweeper, the signal listener, and an
    // anchor worker mid-transaction all finish before the process exits.
    shutdown.cancel();
    tracker.close();
    tracker.wait().await;
    tracing::info!("shutdown complete");
}
