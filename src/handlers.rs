//! Health and admin HTTP endpoints.
//!
//! The admin surface is bearer-token CRUD over routes, receipts, the agent
//! blocklist, and per-mandate spend. Route registration runs the SSRF guard
//! and the x402-upstream probe before the rule reaches the table, and every
//! mutation rewrites the routes file atomically.

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::instrument;

use crate::admission;
use crate::pipeline::Gateway;
use crate::receipt::{ReasonCode, ReceiptQuery};
use crate::route_table::RouteRule;
use crate::routes_store::{self, RoutesDoc};

/// `GET /health`: liveness check, public.
pub async fn health() -> impl IntoResponse {
    axum::Json(json!({ "status": "ok" }))
}

/// Bearer-token guard for the admin surface. With no `ADMIN_KEY` configured
/// the whole surface is disabled.
async fn require_admin(
    State(gateway): State<Arc<Gateway>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(admin_key) = &gateway.config.admin_key else {
        return (
            StatusCode::NOT_FOUND,
            axum::Json(json!({ "error": "admin surface disabled" })),
        )
            .into_response();
    };
    let authorized = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| admission::constant_time_eq(admin_key.as_bytes(), token.as_bytes()));
    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            axum::Json(json!({ "error": "admin authentication required" })),
        )
            .into_response();
    }
    next.run(request).await
}

/// The admin router, nested under `/admin`.
pub fn admin_router(gateway: Arc<Gateway>) -> Router<Arc<Gateway>> {
    Router::new()
        .route("/routes", get(list_routes).post(add_route))
        .route("/routes/{tool_id}", delete(remove_route))
        .route("/receipts", get(list_receipts).delete(clear_receipts))
        .route("/receipts/stats", get(receipt_stats))
        .route("/blocklist", get(list_blocklist).post(block_agent))
        .route("/blocklist/{address}", delete(unblock_agent))
        .route("/spend/{mandate_id}", get(mandate_spend))
        .layer(middleware::from_fn_with_state(gateway, require_admin))
}

#[instrument(skip_all)]
async fn list_routes(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    let rules = gateway.routes.snapshot().rules();
    axum::Json(json!({ "routes": rules }))
}

fn persist_routes(gateway: &Gateway) -> Result<(), Response> {
    let doc = RoutesDoc {
        routes: gateway.routes.snapshot().rules(),
    };
    routes_store::save(&gateway.config.routes_file, &doc).map_err(|e| {
        tracing::error!(error = %e, "failed to persist routes file");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            axum::Json(json!({ "error": "failed to persist routes" })),
        )
            .into_response()
    })
}

/// `POST /admin/routes`: register (or replace) a route.
///
/// The rule passes the SSRF guard and the x402-upstream probe before it
/// touches the table; on refusal the table is unchanged.
#[instrument(skip_all, fields(tool_id))]
async fn add_route(
    State(gateway): State<Arc<Gateway>>,
    axum::Json(rule): axum::Json<RouteRule>,
) -> Response {
    tracing::Span::current().record("tool_id", rule.tool_id.as_str());

    if !rule.skip_ssrf
        && let Err(e) = admission::assert_public_backend(&rule.provider.backend_url).await
    {
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({
                "error": ReasonCode::SsrfBlocked,
                "explanation": e.to_string(),
            })),
        )
            .into_response();
    }

    if let Err(e) = admission::probe_x402_upstream(&gateway.upstream_client, &rule).await {
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({
                "error": ReasonCode::X402UpstreamBlocked,
                "explanation": e.to_string(),
            })),
        )
            .into_response();
    }

    match gateway.routes.add(rule) {
        Ok(snapshot) => {
            if let Err(response) = persist_routes(&gateway) {
                return response;
            }
            (
                StatusCode::CREATED,
                axum::Json(json!({ "routes": snapshot.len() })),
            )
                .into_response()
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[instrument(skip_all, fields(tool_id = %tool_id))]
async fn remove_route(
    State(gateway): State<Arc<Gateway>>,
    Path(tool_id): Path<String>,
) -> Response {
    match gateway.routes.remove(&tool_id) {
        Ok(snapshot) => {
            if let Err(response) = persist_routes(&gateway) {
                return response;
            }
            (
                StatusCode::OK,
                axum::Json(json!({ "routes": snapshot.len() })),
            )
                .into_response()
        }
        Err(e) => (
            StatusCode::NOT_FOUND,
            axum::Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[instrument(skip_all)]
async fn list_receipts(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<ReceiptQuery>,
) -> impl IntoResponse {
    axum::Json(json!({ "receipts": gateway.receipts.query(&query) }))
}

#[instrument(skip_all)]
async fn receipt_stats(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    axum::Json(gateway.receipts.stats())
}

#[instrument(skip_all)]
async fn clear_receipts(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    gateway.receipts.clear();
    StatusCode::NO_CONTENT
}

#[instrument(skip_all)]
async fn list_blocklist(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    axum::Json(json!({ "blocked": gateway.blocklist.snapshot() }))
}

#[derive(Debug, Deserialize)]
struct BlockRequest {
    address: String,
}

#[instrument(skip_all)]
async fn block_agent(
    State(gateway): State<Arc<Gateway>>,
    axum::Json(body): axum::Json<BlockRequest>,
) -> Response {
    gateway.blocklist.insert(&body.address);
    if let Err(e) = persist_blocklist(&gateway) {
        return e;
    }
    (
        StatusCode::CREATED,
        axum::Json(json!({ "blocked": gateway.blocklist.snapshot() })),
    )
        .into_response()
}

#[instrument(skip_all, fields(address = %address))]
async fn unblock_agent(
    State(gateway): State<Arc<Gateway>>,
    Path(address): Path<String>,
) -> Response {
    let removed = gateway.blocklist.remove(&address);
    if !removed {
        return (
            StatusCode::NOT_FOUND,
            axum::Json(json!({ "error": "address not blocked" })),
        )
            .into_response();
    }
    if let Err(e) = persist_blocklist(&gateway) {
        return e;
    }
    StatusCode::NO_CONTENT.into_response()
}

fn persist_blocklist(gateway: &Gateway) -> Result<(), Response> {
    let mut doc = crate::config::ConfigDoc::load(&gateway.config.config_file).unwrap_or_default();
    doc.agent_blocklist = gateway.blocklist.snapshot();
    doc.save(&gateway.config.config_file).map_err(|e| {
        tracing::error!(error = %e, "failed to persist config document");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            axum::Json(json!({ "error": "failed to persist blocklist" })),
        )
            .into_response()
    })
}

#[instrument(skip_all, fields(mandate_id = %mandate_id))]
async fn mandate_spend(
    State(gateway): State<Arc<Gateway>>,
    Path(mandate_id): Path<String>,
) -> impl IntoResponse {
    axum::Json(json!({
        "mandateId": mandate_id,
        "spentToday": gateway.spend.spent_today(&mandate_id),
        "lifetime": gateway.spend.lifetime(&mandate_id),
    }))
}
