//! Axum REST API handlers.
//!
//! The HTTP layer is a thin shell: request shapes in, service calls,
//! error-to-status mapping out. Workflow responses carry only the
//! transaction hash — the on-ledger outcome is communicated later through
//! notifications, never through these responses.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::ServiceError;
use crate::ledger::SigningIdentity;
use crate::notify::ExpoNotifier;
use crate::service::ProjectLifecycleService;
use crate::store::{FundingQuery, FundingRecord, Project, ProjectRef, ProjectStore};
use crate::wallets::WalletResolver;

pub struct ApiState {
    pub service: ProjectLifecycleService,
    pub store: ProjectStore,
    pub wallets: WalletResolver,
    pub notifier: Arc<ExpoNotifier>,
    /// Platform operating account; signs project creation.
    pub operator: SigningIdentity,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/projects", post(create_project).get(get_all_projects))
        .route("/projects/:reference", get(get_project))
        .route("/projects/:reference/funds", post(fund_project))
        .route(
            "/projects/:reference/stages/:stage/complete",
            post(complete_stage),
        )
        .route("/wallets", post(register_wallet))
        .route("/wallets/fundings", get(get_all_fundings))
        .route("/wallets/:wallet_id/fundings", get(get_wallet_fundings))
        .route(
            "/wallets/:wallet_id/push-token",
            post(add_push_token).delete(remove_push_token),
        )
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectRequest {
    pub stages_cost: Vec<Decimal>,
    /// Internal wallet id of the project owner.
    pub owner_id: String,
    /// Internal wallet id of the project reviewer.
    pub reviewer_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundRequest {
    pub wallet_id: String,
    pub address: String,
    pub key: String,
    pub amount: Decimal,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteStageRequest {
    pub wallet_id: String,
    pub address: String,
    pub key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterWalletRequest {
    pub wallet_id: String,
    pub address: String,
}

#[derive(Deserialize)]
pub struct PushTokenRequest {
    pub token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TxResponse {
    pub tx_hash: String,
}

#[derive(Serialize)]
pub struct ProjectsResponse {
    pub count: usize,
    pub projects: Vec<Project>,
}

#[derive(Serialize)]
pub struct FundingsResponse {
    pub count: usize,
    pub fundings: Vec<FundingRecord>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(e: ServiceError) -> Response {
    let status =
        StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ErrorResponse { error: e.to_string() })).into_response()
}

/// A path segment names a project either by its assigned numeric identity
/// or, before confirmation, by its creating transaction's hash.
fn parse_reference(raw: &str) -> ProjectRef {
    match raw.parse::<i64>() {
        Ok(id) => ProjectRef::Id(id),
        Err(_) => ProjectRef::TxHash(raw.to_string()),
    }
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /projects`
///
/// Publishes a project signed by the platform's operating account and
/// answers with the creating transaction's hash.
pub async fn create_project(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreateProjectRequest>,
) -> Response {
    let owner_address = match state.wallets.address_for_wallet(&req.owner_id).await {
        Ok(address) => address,
        Err(e) => return error_response(e),
    };
    let reviewer_address = match state.wallets.address_for_wallet(&req.reviewer_id).await {
        Ok(address) => address,
        Err(e) => return error_response(e),
    };

    match state
        .service
        .create(&state.operator, req.stages_cost, owner_address, reviewer_address)
        .await
    {
        Ok(tx_hash) => (StatusCode::OK, Json(TxResponse { tx_hash })).into_response(),
        Err(e) => error_response(e),
    }
}

/// `GET /projects`
pub async fn get_all_projects(State(state): State<Arc<ApiState>>) -> Response {
    match state.service.get_all().await {
        Ok(projects) => (
            StatusCode::OK,
            Json(ProjectsResponse {
                count: projects.len(),
                projects,
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// `GET /projects/:reference`
pub async fn get_project(
    State(state): State<Arc<ApiState>>,
    Path(reference): Path<String>,
) -> Response {
    match state.service.get(&parse_reference(&reference)).await {
        Ok(project) => (StatusCode::OK, Json(project)).into_response(),
        Err(e) => error_response(e),
    }
}

/// `POST /projects/:reference/funds`
pub async fn fund_project(
    State(state): State<Arc<ApiState>>,
    Path(reference): Path<String>,
    Json(req): Json<FundRequest>,
) -> Response {
    let signer = SigningIdentity {
        address: req.address,
        key: req.key,
    };
    match state
        .service
        .fund(&req.wallet_id, &signer, &parse_reference(&reference), req.amount)
        .await
    {
        Ok(tx_hash) => (StatusCode::OK, Json(TxResponse { tx_hash })).into_response(),
        Err(e) => error_response(e),
    }
}

/// `POST /projects/:reference/stages/:stage/complete`
pub async fn complete_stage(
    State(state): State<Arc<ApiState>>,
    Path((reference, stage)): Path<(String, i64)>,
    Json(req): Json<CompleteStageRequest>,
) -> Response {
    let signer = SigningIdentity {
        address: req.address,
        key: req.key,
    };
    match state
        .service
        .set_completed_stage(&req.wallet_id, &signer, &parse_reference(&reference), stage)
        .await
    {
        Ok(tx_hash) => (StatusCode::OK, Json(TxResponse { tx_hash })).into_response(),
        Err(e) => error_response(e),
    }
}

/// `POST /wallets`
pub async fn register_wallet(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<RegisterWalletRequest>,
) -> Response {
    match state.wallets.register(&req.wallet_id, &req.address).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(e) => error_response(e),
    }
}

/// `GET /wallets/fundings`
pub async fn get_all_fundings(State(state): State<Arc<ApiState>>) -> Response {
    fundings_response(&state, FundingQuery::default()).await
}

/// `GET /wallets/:wallet_id/fundings`
pub async fn get_wallet_fundings(
    State(state): State<Arc<ApiState>>,
    Path(wallet_id): Path<String>,
) -> Response {
    fundings_response(
        &state,
        FundingQuery {
            wallet_id: Some(wallet_id),
            project_id: None,
        },
    )
    .await
}

async fn fundings_response(state: &ApiState, query: FundingQuery) -> Response {
    match state.store.fundings(&query).await {
        Ok(fundings) => (
            StatusCode::OK,
            Json(FundingsResponse {
                count: fundings.len(),
                fundings,
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// `POST /wallets/:wallet_id/push-token`
pub async fn add_push_token(
    State(state): State<Arc<ApiState>>,
    Path(wallet_id): Path<String>,
    Json(req): Json<PushTokenRequest>,
) -> Response {
    match state.notifier.register_token(&wallet_id, &req.token).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(e) => error_response(e),
    }
}

/// `DELETE /wallets/:wallet_id/push-token`
pub async fn remove_push_token(
    State(state): State<Arc<ApiState>>,
    Path(wallet_id): Path<String>,
    Json(req): Json<PushTokenRequest>,
) -> Response {
    match state.notifier.remove_token(&wallet_id, &req.token).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
