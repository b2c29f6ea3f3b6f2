//! HTTP endpoints of the L402 gate server.
//!
//! The gated resource endpoint drives the whole challenge/redeem flow; the
//! rest are free discovery and operational endpoints. Verification failures
//! map to 401 with a machine-readable `reason`, a valid token bound to a
//! different resource maps to 403, and a credential that cannot even be
//! parsed is treated exactly like a missing one: always a 401, never a 500.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tracing::instrument;

use crate::catalog::{ContentSource, preview_of};
use crate::gate::{AccessGate, GateError};
use crate::types::PaymentHash;

/// Shared state behind every handler.
pub struct AppState {
    pub gate: AccessGate,
    pub content: Arc<dyn ContentSource>,
}

/// All routes of the gate server.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/catalog", get(get_catalog))
        .route("/api/resources/{id}", get(get_resource))
        .route("/api/resources/{id}/preview", get(get_preview))
        .route("/api/payments/{hash}/status", get(get_payment_status))
        .route("/api/stats", get(get_stats))
}

/// `GET /`: Service description and endpoint map.
#[instrument(skip_all)]
async fn index(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "L402",
        "payment": "Lightning Network (sats)",
        "endpoints": {
            "GET /api/catalog": "Browse available resources (free)",
            "GET /api/resources/{id}": "Request resource content (L402 paywall)",
            "GET /api/resources/{id}/preview": "Free preview of a resource",
            "GET /api/payments/{hash}/status": "Check payment status",
            "GET /api/stats": "Aggregate payment stats",
        },
        "total_resources": state.gate.catalog().len(),
    }))
}

/// `GET /health`: Liveness probe.
#[instrument(skip_all)]
async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": crate::timestamp::UnixTimestamp::now().as_secs(),
    }))
}

/// `GET /api/catalog`: Free listing of every priced resource.
#[instrument(skip_all)]
async fn get_catalog(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut resources: Vec<_> = state
        .gate
        .catalog()
        .entries()
        .map(|entry| {
            json!({
                "id": entry.id,
                "title": entry.title,
                "kind": entry.kind,
                "price_sats": entry.price_sats,
                "endpoint": format!("/api/resources/{}", entry.id),
                "preview": format!("/api/resources/{}/preview", entry.id),
            })
        })
        .collect();
    resources.sort_by_key(|r| r["id"].as_str().map(str::to_owned));
    Json(json!({
        "resources": resources,
        "payment_protocol": "L402 via Lightning Network",
    }))
}

/// `GET /api/resources/{id}`: The L402-gated resource endpoint.
///
/// Without an `Authorization` header, issues a 402 challenge carrying the
/// invoice and the minted token, plus a `WWW-Authenticate` header
/// advertising both. With a header of the form `L402 {token}:{preimage}`,
/// verifies the credential and serves the content on success.
#[instrument(skip(state, headers))]
async fn get_resource(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty());

    match authorization {
        Some(authorization) => redeem_resource(&state, &id, authorization).await,
        None => challenge_resource(&state, &id).await,
    }
}

async fn challenge_resource(state: &AppState, id: &str) -> Response {
    let challenge = match state.gate.challenge(id).await {
        Ok(challenge) => challenge,
        Err(error) => return gate_error_response(error),
    };
    let body = json!({
        "status": 402,
        "message": "Payment required",
        "resource": {
            "id": challenge.entry.id,
            "title": challenge.entry.title,
            "kind": challenge.entry.kind,
            "price_sats": challenge.entry.price_sats,
        },
        "invoice": {
            "payment_request": challenge.invoice.payment_request,
            "payment_hash": challenge.invoice.payment_hash,
            "amount_sats": challenge.invoice.amount_sats,
        },
        "token": challenge.token,
        "instructions":
            "Pay the Lightning invoice, then retry with header: Authorization: L402 {token}:{preimage}",
    });
    (
        StatusCode::PAYMENT_REQUIRED,
        [(header::WWW_AUTHENTICATE, challenge.www_authenticate())],
        Json(body),
    )
        .into_response()
}

async fn redeem_resource(state: &AppState, id: &str, authorization: &str) -> Response {
    let grant = match state.gate.redeem(id, authorization).await {
        Ok(grant) => grant,
        Err(error) => return gate_error_response(error),
    };
    let Some(content) = state.content.load(&grant.entry) else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "Content unavailable" })),
        )
            .into_response();
    };
    let body = json!({
        "resource": {
            "id": grant.entry.id,
            "title": grant.entry.title,
        },
        "payment_hash": grant.payment_hash,
        "content": content,
    });
    (StatusCode::OK, Json(body)).into_response()
}

/// `GET /api/resources/{id}/preview`: Free preview, first section only.
#[instrument(skip(state))]
async fn get_preview(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let resource_id = crate::types::ResourceId::new(&id);
    let Some(entry) = state.gate.catalog().get(&resource_id) else {
        return gate_error_response(GateError::ResourceNotFound);
    };
    let Some(content) = state.content.load(entry) else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "Content unavailable" })),
        )
            .into_response();
    };
    let preview = format!(
        "{}\n\n---\n*[Preview only. Full content: {} via L402 at /api/resources/{}]*",
        preview_of(&content),
        entry.price_sats,
        entry.id,
    );
    Json(json!({
        "id": entry.id,
        "title": entry.title,
        "kind": entry.kind,
        "price_sats": entry.price_sats,
        "preview": preview,
        "full_content_endpoint": format!("/api/resources/{}", entry.id),
        "payment_protocol": "L402",
    }))
    .into_response()
}

/// `GET /api/payments/{hash}/status`: Live-plus-stored payment status.
#[instrument(skip(state))]
async fn get_payment_status(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
) -> Response {
    let payment_hash: PaymentHash = match hash.parse() {
        Ok(hash) => hash,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Invalid payment hash" })),
            )
                .into_response();
        }
    };
    let status = state.gate.payment_status(&payment_hash).await;
    Json(json!({
        "payment_hash": status.payment_hash,
        "paid": status.paid,
        "resource_id": status.resource_id,
        "amount_sats": status.amount_sats,
    }))
    .into_response()
}

/// `GET /api/stats`: Aggregate payment counters. Sweeps expired records
/// opportunistically before counting.
#[instrument(skip_all)]
async fn get_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.gate.stats().await;
    Json(json!({
        "total_resources": stats.total_resources,
        "payments_24h": stats.settled_payments,
        "sats_24h": stats.settled_sats,
    }))
}

fn gate_error_response(error: GateError) -> Response {
    match error {
        GateError::ResourceNotFound => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Resource not found" })),
        )
            .into_response(),
        GateError::BackendUnavailable(e) => {
            tracing::error!(error = %e, "Challenge withheld: backend unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "Payment service unavailable" })),
            )
                .into_response()
        }
        GateError::Verification(e) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": e.to_string(), "reason": e.reason() })),
        )
            .into_response(),
        GateError::ResourceMismatch => (
            StatusCode::FORBIDDEN,
            Json(json!({
                "error": "Token not valid for this resource",
                "reason": "resource_mismatch",
            })),
        )
            .into_response(),
        GateError::StorePersistence(e) => {
            tracing::error!(error = %e, "Challenge withheld: store persistence failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Internal storage failure" })),
            )
                .into_response()
        }
    }
}
