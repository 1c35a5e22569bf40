//! HTTP surface
//!
//! Read-only query endpoints plus the sanctioned write entry points:
//! event and view ingestion, redaction, subject requests and policy reload.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::ingest::{target_from_path, IngestionGateway};
use crate::ledger::{
    ActionKind, ActorRef, DiffPayload, EventCandidate, FieldChange, FieldPath, FieldValue,
    LedgerStore, Order, OriginMetadata, RecordFilter, RecordView, Sensitivity, Target, Verifier,
    VerifyOptions,
};
use crate::redaction::RedactionEngine;
use crate::retention::PolicyStore;
use crate::subject::{RequestType, SubjectRequestProcessor};

pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const MAX_PAGE_SIZE: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    pub store: LedgerStore,
    pub gateway: IngestionGateway,
    pub engine: RedactionEngine,
    pub processor: SubjectRequestProcessor,
    pub policies: Arc<PolicyStore>,
}

impl AppState {
    /// Create the API router
    pub fn router(self) -> Router {
        Router::new()
            .route("/health", get(health_check))
            .route("/tail", get(get_tail))
            .route("/stats", get(get_stats))
            .route("/actors/:id/activity", get(get_actor_activity))
            .route("/records", get(list_records))
            .route("/records/:seq", get(get_record))
            .route("/records/:seq/redact", post(redact_record))
            .route("/verify", get(verify_range))
            .route("/events", post(record_event))
            .route("/views", post(record_view))
            .route(
                "/subject-requests",
                get(list_subject_requests).post(submit_subject_request),
            )
            .route("/subject-requests/:id", get(get_subject_request))
            .route("/subject-requests/:id/cancel", post(cancel_subject_request))
            .route("/policies/reload", post(reload_policies))
            .with_state(self)
    }
}

/// Ledger error rendered as a JSON response
pub struct ApiError(LedgerError);

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            LedgerError::Validation(_) | LedgerError::Encoding(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            LedgerError::NotFound { .. } | LedgerError::RequestNotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::ChainIntegrity { .. } | LedgerError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }

        let mut body = json!({ "error": self.0.to_string() });
        if let LedgerError::ChainIntegrity { sequence, fault } = &self.0 {
            body["sequence"] = json!(sequence);
            body["fault"] = json!(fault);
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn actor_from(actor: Option<String>) -> ActorRef {
    match actor {
        Some(id) => ActorRef::Principal(id),
        None => ActorRef::Unknown,
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "compliance-ledger",
        "timestamp": chrono::Utc::now()
    }))
}

async fn get_tail(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.store.tail()))
}

async fn get_stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.store.stats()))
}

async fn get_actor_activity(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    Json(json!(state.store.actor_activity(&id)))
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub from: Option<u64>,
    pub to: Option<u64>,
    pub limit: Option<usize>,
    pub actor: Option<String>,
    pub action_kind: Option<ActionKind>,
    pub entity_type: Option<String>,
    pub sensitivity: Option<Sensitivity>,
    #[serde(default)]
    pub order: Order,
}

impl RangeQuery {
    fn filter(&self) -> RecordFilter {
        RecordFilter {
            actor: self.actor.clone(),
            action_kind: self.action_kind,
            entity_type: self.entity_type.clone(),
            sensitivity: self.sensitivity,
        }
    }
}

async fn list_records(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Json<Vec<RecordView>> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);
    let views = state
        .store
        .query(
            query.from.unwrap_or(1),
            query.to.unwrap_or(u64::MAX),
            &query.filter(),
            query.order,
            limit,
        )
        .iter()
        .map(|record| record.view())
        .collect();
    Json(views)
}

async fn get_record(State(state): State<AppState>, Path(seq): Path<u64>) -> ApiResult<RecordView> {
    state
        .store
        .get(seq)
        .map(|record| Json(record.view()))
        .ok_or(ApiError(LedgerError::NotFound { sequence: seq }))
}

#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    pub from: Option<u64>,
    pub to: Option<u64>,
    #[serde(default)]
    pub deep: bool,
}

async fn verify_range(State(state): State<AppState>, Query(query): Query<VerifyQuery>) -> ApiResult<Value> {
    let report = Verifier::new(state.store.clone()).verify_with(
        query.from.unwrap_or(1),
        query.to.unwrap_or(u64::MAX),
        VerifyOptions { deep: query.deep },
    )?;
    Ok(Json(json!({
        "status": "valid",
        "report": report,
        "summary": report.summary()
    })))
}

#[derive(Debug, Deserialize)]
pub struct ChangeBody {
    #[serde(default)]
    pub before: Value,
    #[serde(default)]
    pub after: Value,
}

#[derive(Debug, Deserialize)]
pub struct EventBody {
    pub actor: Option<String>,
    pub action_kind: String,
    pub target: Target,
    #[serde(default)]
    pub diff: BTreeMap<String, ChangeBody>,
    #[serde(default)]
    pub origin: OriginMetadata,
    pub sensitivity: Option<String>,
}

impl EventBody {
    fn into_candidate(self) -> Result<EventCandidate, LedgerError> {
        let action_kind: ActionKind = self.action_kind.parse()?;
        let sensitivity: Sensitivity = match self.sensitivity {
            Some(s) => s.parse()?,
            None => Sensitivity::default(),
        };

        let mut diff_payload = DiffPayload::new();
        for (field, change) in self.diff {
            let before = FieldValue::from_json(&field, change.before)?;
            let after = FieldValue::from_json(&field, change.after)?;
            diff_payload.insert(field, FieldChange { before, after });
        }

        Ok(EventCandidate {
            actor_ref: actor_from(self.actor),
            action_kind,
            target: self.target,
            diff_payload,
            origin_metadata: self.origin,
            sensitivity,
        })
    }
}

async fn record_event(
    State(state): State<AppState>,
    Json(body): Json<EventBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let record = state.gateway.submit(body.into_candidate()?).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "sequence": record.sequence(),
            "chain_hash": record.chain_hash()
        })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ViewBody {
    pub actor: Option<String>,
    pub path: String,
    pub target: Option<Target>,
    #[serde(default)]
    pub origin: OriginMetadata,
}

async fn record_view(State(state): State<AppState>, Json(body): Json<ViewBody>) -> ApiResult<Value> {
    let target = body.target.unwrap_or_else(|| target_from_path(&body.path));
    let sequence = state
        .gateway
        .record_view(actor_from(body.actor), target, &body.path, body.origin)
        .await?;
    Ok(Json(json!({ "logged": sequence.is_some(), "sequence": sequence })))
}

#[derive(Debug, Deserialize)]
pub struct RedactBody {
    pub fields: Vec<String>,
    pub reason: String,
    pub actor: String,
}

async fn redact_record(
    State(state): State<AppState>,
    Path(seq): Path<u64>,
    Json(body): Json<RedactBody>,
) -> ApiResult<Value> {
    let fields = body
        .fields
        .iter()
        .map(|f| f.parse::<FieldPath>())
        .collect::<Result<Vec<_>, _>>()?;

    let outcome = state
        .engine
        .redact(seq, &fields, &body.reason, &ActorRef::Principal(body.actor))
        .await?;
    Ok(Json(json!(outcome)))
}

#[derive(Debug, Deserialize)]
pub struct SubjectRequestBody {
    pub subject: String,
    pub request_type: RequestType,
}

async fn submit_subject_request(
    State(state): State<AppState>,
    Json(body): Json<SubjectRequestBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let request = state
        .processor
        .submit(body.subject, body.request_type)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(json!(request))))
}

async fn list_subject_requests(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.processor.list().await))
}

async fn get_subject_request(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Value> {
    let request = state.processor.get_status(id).await?;
    Ok(Json(json!(request)))
}

#[derive(Debug, Deserialize)]
pub struct CancelBody {
    pub reason: String,
}

async fn cancel_subject_request(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<CancelBody>,
) -> ApiResult<Value> {
    let request = state.processor.cancel(id, &body.reason).await?;
    Ok(Json(json!(request)))
}

async fn reload_policies(State(state): State<AppState>) -> ApiResult<Value> {
    let active = state.policies.reload()?;
    info!("Retention policies reloaded via API");
    Ok(Json(json!({ "status": "reloaded", "active_policies": active })))
}
