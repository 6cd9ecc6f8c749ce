//! HTTP surface for the dealdesk back office.
//!
//! Thin handlers over [`BackOfficeEngine`]: request DTOs in, engine calls,
//! JSON out. Error mapping is centralized in [`ApiError`] so every handler
//! returns the same `{"error": ...}` shape.

#![deny(unsafe_code)]

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dealdesk_core::engine::{BackOfficeEngine, EngineConfig};
use dealdesk_core::instrument::ExpectedInstrumentFacts;
use dealdesk_core::settlement::SettlementParams;
use dealdesk_core::store::QueryWindow;
use dealdesk_core::types::{
    DealDraft, DealStatus, InstrumentDraft, InstrumentStage, RequirementStatus,
};
use dealdesk_core::DeskError;
use dealdesk_store::StorageConfig;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

/// Service configuration resolved by the CLI.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub storage: StorageConfig,
}

#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<BackOfficeEngine>,
    pub backend: &'static str,
}

/// Connect storage and assemble the engine.
pub async fn bootstrap(config: ServiceConfig) -> anyhow::Result<ServiceState> {
    let backend = config.storage.backend_name();
    let store = config.storage.connect().await?;
    let engine = Arc::new(BackOfficeEngine::new(store, EngineConfig::default()));
    info!(backend, "back office engine ready");
    Ok(ServiceState { engine, backend })
}

struct ApiError(DeskError);

impl From<DeskError> for ApiError {
    fn from(err: DeskError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DeskError::Validation(_) => StatusCode::BAD_REQUEST,
            DeskError::NotFound(_) => StatusCode::NOT_FOUND,
            DeskError::Conflict(_) => StatusCode::CONFLICT,
            DeskError::Dependency(_) | DeskError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            DeskError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn actor_or_system(actor: Option<String>) -> String {
    actor
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| "system".to_string())
}

#[derive(Debug, Deserialize)]
struct WindowQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

impl WindowQuery {
    fn window(&self) -> QueryWindow {
        let default = QueryWindow::default();
        QueryWindow {
            limit: self.limit.unwrap_or(default.limit),
            offset: self.offset.unwrap_or(default.offset),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IntakeRequest {
    counterparty: String,
    commodity: String,
    value_minor: i64,
    currency: String,
    origin_country: String,
    destination_country: String,
    incoterm: Option<String>,
    #[serde(default)]
    quantity_mt: f64,
    payment_terms: Option<String>,
    actor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ActorRequest {
    actor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResolveFlagRequest {
    resolved_by: String,
    notes: String,
}

#[derive(Debug, Deserialize)]
struct StatusChangeRequest {
    status: DealStatus,
    actor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RequirementStatusRequest {
    status: RequirementStatus,
    reviewer: Option<String>,
    actor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegisterInstrumentRequest {
    instrument_type: String,
    issuing_bank: String,
    issuing_bank_bic: String,
    advising_bank: Option<String>,
    beneficiary: String,
    amount_minor: i64,
    currency: String,
    issued_at: Option<chrono::DateTime<chrono::Utc>>,
    expires_at: Option<chrono::DateTime<chrono::Utc>>,
    actor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerifyInstrumentRequest {
    expected: Option<ExpectedInstrumentFacts>,
    actor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApproveInstrumentRequest {
    approved_by: String,
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RejectInstrumentRequest {
    rejected_by: String,
    reason: String,
}

#[derive(Debug, Deserialize)]
struct StageRequest {
    stage: InstrumentStage,
    actor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateSettlementRequest {
    #[serde(flatten)]
    params: SettlementParams,
    #[serde(default)]
    milestones: Vec<String>,
    actor: Option<String>,
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/rules", get(rules))
        .route("/v1/deals", post(intake_deal).get(list_deals))
        .route("/v1/deals/:id", get(get_deal))
        .route("/v1/deals/:id/screen", post(rescreen_deal))
        .route("/v1/deals/:id/flags", get(list_flags))
        .route("/v1/deals/:id/status", post(change_status))
        .route(
            "/v1/deals/:id/funding/analyze",
            post(analyze_funding),
        )
        .route("/v1/deals/:id/funding", get(funding_status))
        .route(
            "/v1/deals/:id/instruments",
            post(register_instrument).get(list_instruments),
        )
        .route(
            "/v1/deals/:id/settlements",
            post(create_settlement).get(list_settlements),
        )
        .route("/v1/deals/:id/actions", get(deal_actions))
        .route("/v1/flags/:id/resolve", post(resolve_flag))
        .route("/v1/requirements/:id/status", post(review_requirement))
        .route("/v1/instruments/:id/verify", post(verify_instrument))
        .route("/v1/instruments/:id/approve", post(approve_instrument))
        .route("/v1/instruments/:id/reject", post(reject_instrument))
        .route("/v1/instruments/:id/stage", post(advance_stage))
        .route("/v1/settlements/:id", get(get_settlement))
        .route("/v1/settlements/:id/milestones", get(list_milestones))
        .route(
            "/v1/settlements/:id/revalidate",
            post(revalidate_settlement),
        )
        .route("/v1/milestones/:id/release", post(release_milestone))
        .route("/v1/milestones/:id/dispute", post(dispute_milestone))
        .with_state(state)
}

async fn health(State(state): State<ServiceState>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "backend": state.backend }))
}

async fn rules(State(state): State<ServiceState>) -> impl IntoResponse {
    Json(state.engine.catalog().clone())
}

async fn intake_deal(
    State(state): State<ServiceState>,
    Json(req): Json<IntakeRequest>,
) -> ApiResult<impl IntoResponse> {
    let mut draft = DealDraft::new(
        req.counterparty,
        req.commodity,
        req.value_minor,
        req.currency,
        req.origin_country,
        req.destination_country,
    )
    .with_quantity_mt(req.quantity_mt);
    if let Some(incoterm) = req.incoterm {
        draft = draft.with_incoterm(incoterm);
    }
    if let Some(payment_terms) = req.payment_terms {
        draft = draft.with_payment_terms(payment_terms);
    }
    let actor = actor_or_system(req.actor);
    let intake = state.engine.intake_deal(draft, &actor).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "deal": intake.deal,
            "flags": intake.flags,
            "report": intake.report,
        })),
    ))
}

async fn list_deals(
    State(state): State<ServiceState>,
    Query(query): Query<WindowQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.list_deals(query.window()).await?))
}

async fn get_deal(
    State(state): State<ServiceState>,
    Path(deal_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.get_deal(&deal_id).await?))
}

async fn rescreen_deal(
    State(state): State<ServiceState>,
    Path(deal_id): Path<String>,
    body: Option<Json<ActorRequest>>,
) -> ApiResult<impl IntoResponse> {
    let actor = actor_or_system(body.and_then(|Json(b)| b.actor));
    let outcome = state.engine.rescreen_deal(&deal_id, &actor).await?;
    Ok(Json(json!({
        "deal": outcome.deal,
        "new_flags": outcome.flags,
        "report": outcome.report,
    })))
}

async fn list_flags(
    State(state): State<ServiceState>,
    Path(deal_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.deal_flags(&deal_id).await?))
}

async fn resolve_flag(
    State(state): State<ServiceState>,
    Path(flag_id): Path<String>,
    Json(req): Json<ResolveFlagRequest>,
) -> ApiResult<impl IntoResponse> {
    let resolution = state
        .engine
        .resolve_flag(&flag_id, &req.resolved_by, &req.notes)
        .await?;
    Ok(Json(resolution))
}

async fn change_status(
    State(state): State<ServiceState>,
    Path(deal_id): Path<String>,
    Json(req): Json<StatusChangeRequest>,
) -> ApiResult<impl IntoResponse> {
    let actor = actor_or_system(req.actor);
    Ok(Json(
        state
            .engine
            .change_deal_status(&deal_id, req.status, &actor)
            .await?,
    ))
}

async fn analyze_funding(
    State(state): State<ServiceState>,
    Path(deal_id): Path<String>,
    body: Option<Json<ActorRequest>>,
) -> ApiResult<impl IntoResponse> {
    let actor = actor_or_system(body.and_then(|Json(b)| b.actor));
    let outcome = state.engine.analyze_funding(&deal_id, &actor).await?;
    Ok(Json(json!({
        "requirements": outcome.requirements,
        "readiness_score": outcome.readiness_score,
    })))
}

async fn funding_status(
    State(state): State<ServiceState>,
    Path(deal_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state.engine.funding_status(&deal_id).await?;
    Ok(Json(json!({
        "requirements": outcome.requirements,
        "readiness_score": outcome.readiness_score,
    })))
}

async fn review_requirement(
    State(state): State<ServiceState>,
    Path(requirement_id): Path<String>,
    Json(req): Json<RequirementStatusRequest>,
) -> ApiResult<impl IntoResponse> {
    let actor = actor_or_system(req.actor.clone().or_else(|| req.reviewer.clone()));
    let review = state
        .engine
        .review_requirement(&requirement_id, req.status, req.reviewer.as_deref(), &actor)
        .await?;
    Ok(Json(json!({
        "requirement": review.requirement,
        "readiness_score": review.readiness_score,
    })))
}

async fn register_instrument(
    State(state): State<ServiceState>,
    Path(deal_id): Path<String>,
    Json(req): Json<RegisterInstrumentRequest>,
) -> ApiResult<impl IntoResponse> {
    let actor = actor_or_system(req.actor);
    let instrument = state
        .engine
        .register_instrument(
            InstrumentDraft {
                deal_id,
                instrument_type: req.instrument_type,
                issuing_bank: req.issuing_bank,
                issuing_bank_bic: req.issuing_bank_bic,
                advising_bank: req.advising_bank,
                beneficiary: req.beneficiary,
                amount_minor: req.amount_minor,
                currency: req.currency,
                issued_at: req.issued_at,
                expires_at: req.expires_at,
            },
            &actor,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(instrument)))
}

async fn list_instruments(
    State(state): State<ServiceState>,
    Path(deal_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.list_instruments(&deal_id).await?))
}

async fn verify_instrument(
    State(state): State<ServiceState>,
    Path(instrument_id): Path<String>,
    body: Option<Json<VerifyInstrumentRequest>>,
) -> ApiResult<impl IntoResponse> {
    let (expected, actor) = match body {
        Some(Json(req)) => (req.expected, actor_or_system(req.actor)),
        None => (None, actor_or_system(None)),
    };
    let report = state
        .engine
        .verify_instrument(&instrument_id, expected, &actor)
        .await?;
    Ok(Json(report))
}

async fn approve_instrument(
    State(state): State<ServiceState>,
    Path(instrument_id): Path<String>,
    Json(req): Json<ApproveInstrumentRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state
            .engine
            .approve_instrument(&instrument_id, &req.approved_by, req.notes.as_deref())
            .await?,
    ))
}

async fn reject_instrument(
    State(state): State<ServiceState>,
    Path(instrument_id): Path<String>,
    Json(req): Json<RejectInstrumentRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state
            .engine
            .reject_instrument(&instrument_id, &req.rejected_by, &req.reason)
            .await?,
    ))
}

async fn advance_stage(
    State(state): State<ServiceState>,
    Path(instrument_id): Path<String>,
    Json(req): Json<StageRequest>,
) -> ApiResult<impl IntoResponse> {
    let actor = actor_or_system(req.actor);
    Ok(Json(
        state
            .engine
            .advance_instrument_stage(&instrument_id, req.stage, &actor)
            .await?,
    ))
}

async fn create_settlement(
    State(state): State<ServiceState>,
    Path(deal_id): Path<String>,
    Json(req): Json<CreateSettlementRequest>,
) -> ApiResult<impl IntoResponse> {
    let actor = actor_or_system(req.actor);
    let created = state
        .engine
        .create_settlement(&deal_id, req.params, req.milestones, &actor)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "settlement": created.settlement,
            "milestones": created.milestones,
        })),
    ))
}

async fn list_settlements(
    State(state): State<ServiceState>,
    Path(deal_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.list_settlements(&deal_id).await?))
}

async fn get_settlement(
    State(state): State<ServiceState>,
    Path(settlement_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.get_settlement(&settlement_id).await?))
}

async fn list_milestones(
    State(state): State<ServiceState>,
    Path(settlement_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.list_milestones(&settlement_id).await?))
}

async fn revalidate_settlement(
    State(state): State<ServiceState>,
    Path(settlement_id): Path<String>,
    body: Option<Json<ActorRequest>>,
) -> ApiResult<impl IntoResponse> {
    let actor = actor_or_system(body.and_then(|Json(b)| b.actor));
    Ok(Json(
        state
            .engine
            .revalidate_settlement(&settlement_id, &actor)
            .await?,
    ))
}

async fn release_milestone(
    State(state): State<ServiceState>,
    Path(milestone_id): Path<String>,
    body: Option<Json<ActorRequest>>,
) -> ApiResult<impl IntoResponse> {
    let actor = actor_or_system(body.and_then(|Json(b)| b.actor));
    Ok(Json(
        state.engine.release_milestone(&milestone_id, &actor).await?,
    ))
}

async fn dispute_milestone(
    State(state): State<ServiceState>,
    Path(milestone_id): Path<String>,
    body: Option<Json<ActorRequest>>,
) -> ApiResult<impl IntoResponse> {
    let actor = actor_or_system(body.and_then(|Json(b)| b.actor));
    Ok(Json(
        state.engine.dispute_milestone(&milestone_id, &actor).await?,
    ))
}

async fn deal_actions(
    State(state): State<ServiceState>,
    Path(deal_id): Path<String>,
    Query(query): Query<WindowQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state.engine.deal_actions(&deal_id, query.window()).await?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use tower::ServiceExt;

    async fn test_router() -> Router {
        let state = bootstrap(ServiceConfig {
            storage: StorageConfig::Memory,
        })
        .await
        .unwrap();
        build_router(state)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_backend() {
        let router = test_router().await;
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/v1/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["backend"], "memory");
    }

    #[tokio::test]
    async fn intake_screens_and_returns_the_deal() {
        let router = test_router().await;
        let response = router
            .oneshot(post_json(
                "/v1/deals",
                serde_json::json!({
                    "counterparty": "Helvetia Trading AG",
                    "commodity": "copper",
                    "value_minor": 5_000_000,
                    "currency": "USD",
                    "origin_country": "CL",
                    "destination_country": "DE",
                    "incoterm": "CIF",
                    "quantity_mt": 120.0,
                    "actor": "ops.desk"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["deal"]["status"], "inquiry");
        assert_eq!(body["deal"]["compliance_status"], "cleared");
    }

    #[tokio::test]
    async fn embargoed_intake_comes_back_held() {
        let router = test_router().await;
        let response = router
            .oneshot(post_json(
                "/v1/deals",
                serde_json::json!({
                    "counterparty": "Helvetia Trading AG",
                    "commodity": "copper",
                    "value_minor": 5_000_000,
                    "currency": "USD",
                    "origin_country": "CL",
                    "destination_country": "IR"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["deal"]["status"], "on_hold");
        assert!(body["flags"]
            .as_array()
            .unwrap()
            .iter()
            .any(|f| f["rule_code"] == "EMBARGOED_DESTINATION"));
    }

    #[tokio::test]
    async fn invalid_intake_is_a_bad_request() {
        let router = test_router().await;
        let response = router
            .oneshot(post_json(
                "/v1/deals",
                serde_json::json!({
                    "counterparty": "",
                    "commodity": "copper",
                    "value_minor": 5_000_000,
                    "currency": "USD",
                    "origin_country": "CL",
                    "destination_country": "DE"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("counterparty"));
    }

    #[tokio::test]
    async fn missing_deal_is_not_found() {
        let router = test_router().await;
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/v1/deals/deal-does-not-exist")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rules_endpoint_serves_the_catalog() {
        let router = test_router().await;
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/v1/rules")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["version"], "dealdesk-rules-v1");
        assert!(!body["rules"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn settlement_on_held_deal_conflicts() {
        let router = test_router().await;
        let intake = router
            .clone()
            .oneshot(post_json(
                "/v1/deals",
                serde_json::json!({
                    "counterparty": "Aurum Trade House",
                    "commodity": "precious-metals",
                    "value_minor": 8_000_000,
                    "currency": "USD",
                    "origin_country": "CH",
                    "destination_country": "AE"
                }),
            ))
            .await
            .unwrap();
        let deal = body_json(intake).await;
        let deal_id = deal["deal"]["deal_id"].as_str().unwrap().to_string();

        let response = router
            .oneshot(post_json(
                &format!("/v1/deals/{deal_id}/settlements"),
                serde_json::json!({
                    "rail": "xrpl",
                    "destination_address": "rN7n7otQDd6FczFgLdSqtcsAUxDkw6fzRH",
                    "destination_tag": 7,
                    "amount_minor": 8_000_000,
                    "currency": "USD"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn funding_analysis_round_trips() {
        let router = test_router().await;
        let intake = router
            .clone()
            .oneshot(post_json(
                "/v1/deals",
                serde_json::json!({
                    "counterparty": "Helvetia Trading AG",
                    "commodity": "copper",
                    "value_minor": 60_000_000,
                    "currency": "USD",
                    "origin_country": "CL",
                    "destination_country": "DE",
                    "incoterm": "CIF"
                }),
            ))
            .await
            .unwrap();
        let deal = body_json(intake).await;
        let deal_id = deal["deal"]["deal_id"].as_str().unwrap().to_string();

        let response = router
            .clone()
            .oneshot(post_json(
                &format!("/v1/deals/{deal_id}/funding/analyze"),
                serde_json::json!({ "actor": "ops.desk" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let score = body["readiness_score"].as_u64().unwrap();
        assert!(score <= 100);
        assert!(!body["requirements"].as_array().unwrap().is_empty());

        let status = router
            .oneshot(
                Request::builder()
                    .uri(format!("/v1/deals/{deal_id}/funding"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status_body = body_json(status).await;
        assert_eq!(status_body["readiness_score"].as_u64().unwrap(), score);
    }
}
