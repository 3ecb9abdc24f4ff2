//! REST and webhook endpoints.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::channels::{ChatEnvelope, ChatNormalizer, fit_to_limits, parse_raw_email};
use crate::error::{ChannelError, PipelineError};
use crate::pipeline::intake::IntakeSender;
use crate::pipeline::processor::SignalProcessor;
use crate::pipeline::routing::PriorityTier;
use crate::pipeline::types::{AggregateStatus, NewSignal, SignalValidator, Source};
use crate::store::{AuditRecord, AuditSink, RecordFilter};

/// Shared state for all routes.
#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<SignalProcessor>,
    pub audit: Arc<dyn AuditSink>,
    pub intake: IntakeSender,
    pub normalizer: Arc<ChatNormalizer>,
    pub limits: SignalValidator,
}

/// Build the API router.
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/signals", post(submit_signal).get(list_signals))
        .route("/api/signals/{id}", get(get_signal))
        .route("/api/stats", get(stats))
        .route("/webhooks/chat", post(chat_webhook))
        .route("/webhooks/mail", post(mail_webhook))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn enqueue_error(e: ChannelError) -> Response {
    warn!("Intake rejected signal: {e}");
    error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "ops-center",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// POST /api/signals
///
/// Runs the full pipeline synchronously and returns decision + outcome.
async fn submit_signal(
    State(state): State<AppState>,
    Json(new): Json<NewSignal>,
) -> Response {
    match state.processor.process(new).await {
        Ok(processed) => Json(processed).into_response(),
        Err(PipelineError::InvalidSignal(e)) => {
            error_response(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
        }
    }
}

/// One row of the signal listing.
#[derive(Debug, Serialize)]
struct SignalSummary {
    id: Uuid,
    source: Source,
    subject: String,
    score: u8,
    tier: PriorityTier,
    status: AggregateStatus,
    destinations: usize,
    created_at: DateTime<Utc>,
}

impl From<AuditRecord> for SignalSummary {
    fn from(record: AuditRecord) -> Self {
        Self {
            id: record.signal.id,
            source: record.signal.source,
            subject: record.signal.subject,
            score: record.decision.score,
            tier: record.decision.tier,
            status: record.outcome.aggregate_status,
            destinations: record.outcome.per_destination.len(),
            created_at: record.signal.created_at,
        }
    }
}

/// GET /api/signals?limit&source&status&min_score
async fn list_signals(
    State(state): State<AppState>,
    Query(filter): Query<RecordFilter>,
) -> Response {
    match state.audit.list_records(&filter).await {
        Ok(records) => {
            let summaries: Vec<SignalSummary> = records.into_iter().map(Into::into).collect();
            Json(json!({ "count": summaries.len(), "signals": summaries })).into_response()
        }
        Err(e) => {
            error!("Failed to list signals: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// GET /api/signals/{id}
async fn get_signal(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.audit.get_record(id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("Signal {id} not found")),
        Err(e) => {
            error!(signal_id = %id, "Failed to load signal: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// GET /api/stats
async fn stats(State(state): State<AppState>) -> Response {
    match state.audit.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => {
            error!("Failed to compute stats: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// POST /webhooks/chat
///
/// Message events are normalized and queued; anything else is acknowledged
/// and dropped.
async fn chat_webhook(
    State(state): State<AppState>,
    Json(envelope): Json<ChatEnvelope>,
) -> Response {
    let Some(signal) = envelope
        .event
        .and_then(|event| state.normalizer.event_to_signal(event))
    else {
        debug!("Ignoring non-message chat event");
        return (StatusCode::OK, Json(json!({ "status": "ignored" }))).into_response();
    };

    match state.intake.submit(fit_to_limits(signal, &state.limits)) {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "status": "queued" }))).into_response(),
        Err(e) => enqueue_error(e),
    }
}

/// POST /webhooks/mail
///
/// Body is a raw RFC 822 message.
async fn mail_webhook(State(state): State<AppState>, body: Bytes) -> Response {
    let item = match parse_raw_email(&body) {
        Ok(item) => item,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    match state
        .intake
        .submit(fit_to_limits(item.into_signal(), &state.limits))
    {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "status": "queued" }))).into_response(),
        Err(e) => enqueue_error(e),
    }
}
