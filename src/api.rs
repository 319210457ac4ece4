use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    middleware,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, warn};
use uuid::Uuid;

use crate::approval::{ActionReport, ApprovalEngine, FetchOutcome};
use crate::config::Config;
use crate::error::{
    ApiError, ApiErrorWithMeta, E_BAD_AMOUNT, E_DB_FAILURE, E_FETCH_IN_FLIGHT, E_PROCESS_FAILURE,
    E_PURCHASE_CONFLICT, EngineError,
};
use crate::graph::ReferralNode;
use crate::ledger::{CommissionScope, GroupedCommissions};
use crate::network::{NetworkReport, NetworkService};
use crate::plan::CommissionPlan;
use crate::responses::{ApiOk, RequestMeta, meta_middleware};
use crate::source::WithdrawalSource;
use crate::store::{NewPurchase, PgStore};
use crate::types::{AffiliateId, BalanceSnapshot, BankDetails, WithdrawalRequest};
use crate::withdrawal::{WithdrawalEngine, WithdrawalQuery, WithdrawalStats};

/// The application state.
#[derive(Clone)]
pub struct AppState {
    /// The database pool.
    pub pool: PgPool,
    /// The application configuration.
    pub config: Config,
    pub store: Arc<PgStore>,
    pub plan: Arc<CommissionPlan>,
    pub commissions: Arc<ApprovalEngine>,
    pub withdrawals: Arc<WithdrawalEngine>,
    pub network: Arc<NetworkService>,
}

impl AppState {
    /// Wires the engines to one Postgres store.
    pub fn new(pool: PgPool, config: Config) -> Self {
        let settings = config.engine_settings();
        let store = Arc::new(PgStore::new(pool.clone()));
        Self {
            commissions: Arc::new(ApprovalEngine::new(store.clone(), settings)),
            withdrawals: Arc::new(WithdrawalEngine::new(store.clone(), settings)),
            network: Arc::new(NetworkService::new(store.clone(), store.clone(), settings)),
            plan: Arc::new(config.commission_plan()),
            store,
            pool,
            config,
        }
    }
}

/// The request to create a new purchase.
#[derive(Deserialize)]
pub struct CreatePurchaseRequest {
    /// The ID of the affiliate who made the purchase.
    #[serde(alias = "user_id")]
    pub affiliate_id: AffiliateId,
    /// The amount of the purchase.
    pub amount: i64,
    /// The status of the purchase.
    pub status: String,
    /// The ID of the purchase.
    pub id: Option<Uuid>,
}

/// The response after creating a new purchase.
#[derive(Serialize)]
pub struct CreatePurchaseResponse {
    /// The ID of the purchase.
    pub id: Uuid,
}

/// The response after processing a purchase.
#[derive(Serialize)]
pub struct ProcessResponse {
    /// The ID of the processed purchase.
    pub processed: Uuid,
    /// The number of commissions created.
    pub commissions_created: usize,
}

#[derive(Serialize)]
pub struct BalanceResponse {
    #[serde(flatten)]
    pub snapshot: BalanceSnapshot,
    pub available: i64,
    pub minimum_retention_floor: i64,
}

#[derive(Deserialize)]
pub struct CreateWithdrawalRequest {
    pub amount: i64,
    #[serde(flatten)]
    pub bank: BankDetails,
}

#[derive(Deserialize, Default)]
pub struct RefreshQuery {
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Deserialize, Default)]
pub struct PendingQuery {
    pub search: Option<String>,
    pub affiliate_id: Option<AffiliateId>,
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    #[serde(default)]
    pub refresh: bool,
}

impl PageQuery {
    fn query(&self) -> WithdrawalQuery {
        let default = WithdrawalQuery::default();
        WithdrawalQuery {
            page: self.page.unwrap_or(default.page),
            limit: self.limit.unwrap_or(default.limit),
        }
    }
}

#[derive(Deserialize, Default)]
pub struct ApproveRequest {
    pub note: Option<String>,
}

#[derive(Deserialize)]
pub struct RejectRequest {
    pub reason: String,
}

#[derive(Deserialize)]
pub struct CompleteRequest {
    pub transfer_reference: String,
}

#[derive(Deserialize)]
pub struct BatchApproveRequest {
    pub ids: Vec<Uuid>,
}

#[derive(Serialize)]
pub struct BatchFailureResponse {
    pub id: Uuid,
    pub code: &'static str,
    pub error: String,
}

#[derive(Serialize)]
pub struct BatchApproveResponse {
    pub succeeded: Vec<Uuid>,
    pub failed: Vec<BatchFailureResponse>,
}

#[derive(Serialize)]
pub struct WithdrawalListResponse {
    pub withdrawals: Vec<WithdrawalRequest>,
    pub stats: WithdrawalStats,
}

pub fn init_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/affiliates/{id}/network", get(network_handler))
        .route(
            "/affiliates/{id}/network/levels/{level}",
            get(network_level_handler),
        )
        .route("/affiliates/{id}/balance", get(balance_handler))
        .route("/affiliates/{id}/withdrawals", post(create_withdrawal_handler))
        .route("/purchases", post(create_purchase_handler))
        .route("/process/{id}", post(process_purchase_handler))
        .route("/admin/commissions/pending", get(pending_commissions_handler))
        .route(
            "/admin/commissions/batch-approve",
            post(batch_approve_handler),
        )
        .route(
            "/admin/commissions/{id}/approve",
            post(approve_commission_handler),
        )
        .route(
            "/admin/commissions/{id}/reject",
            post(reject_commission_handler),
        )
        .route("/admin/withdrawals", get(list_withdrawals_handler))
        .route(
            "/admin/withdrawals/{id}/approve",
            post(approve_withdrawal_handler),
        )
        .route(
            "/admin/withdrawals/{id}/reject",
            post(reject_withdrawal_handler),
        )
        .route(
            "/admin/withdrawals/{id}/complete",
            post(complete_withdrawal_handler),
        )
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(middleware::from_fn(meta_middleware))
}

fn engine_err(meta: &RequestMeta) -> impl Fn(EngineError) -> ApiErrorWithMeta + '_ {
    move |e| ApiErrorWithMeta::engine(e, meta.clone())
}

fn in_flight(meta: RequestMeta) -> ApiErrorWithMeta {
    ApiError::Unavailable("a fetch for this view is already running, retry shortly".into())
        .with_meta(meta)
        .with_code(E_FETCH_IN_FLIGHT)
}

async fn network_handler(
    State(st): State<AppState>,
    Path(id): Path<AffiliateId>,
    Query(q): Query<RefreshQuery>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<NetworkReport>, ApiErrorWithMeta> {
    if q.refresh {
        st.network.refresh(id).await.map_err(engine_err(&meta))?;
    }
    let report = st.network.report(id).await.map_err(engine_err(&meta))?;
    Ok(ApiOk::ok("network fetched", report, meta))
}

async fn network_level_handler(
    State(st): State<AppState>,
    Path((id, level)): Path<(AffiliateId, u32)>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Vec<ReferralNode>>, ApiErrorWithMeta> {
    if level == 0 {
        return Err(ApiError::BadRequest("level must be at least 1".into()).with_meta(meta));
    }
    let members = st
        .network
        .level_data(id, level)
        .await
        .map_err(engine_err(&meta))?;
    Ok(ApiOk::ok(format!("level {level} members fetched"), members, meta))
}

async fn balance_handler(
    State(st): State<AppState>,
    Path(id): Path<AffiliateId>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<BalanceResponse>, ApiErrorWithMeta> {
    let snapshot = st.store.balance(id).await.map_err(engine_err(&meta))?;
    Ok(ApiOk::ok(
        "balance fetched",
        BalanceResponse {
            available: snapshot.available(),
            minimum_retention_floor: st.config.minimum_retention_floor,
            snapshot,
        },
        meta,
    ))
}

async fn create_withdrawal_handler(
    State(st): State<AppState>,
    Path(id): Path<AffiliateId>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<CreateWithdrawalRequest>,
) -> Result<ApiOk<WithdrawalRequest>, ApiErrorWithMeta> {
    let request = st
        .store
        .create_withdrawal(id, req.amount, &req.bank, st.config.minimum_retention_floor)
        .await
        .map_err(engine_err(&meta))?;

    if let Err(err) = st.withdrawals.refresh().await {
        warn!(error = %err, "withdrawal list refresh after creation failed");
    }
    Ok(ApiOk::created("withdrawal requested", request, meta))
}

async fn create_purchase_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<CreatePurchaseRequest>,
) -> Result<ApiOk<CreatePurchaseResponse>, ApiErrorWithMeta> {
    let purchase = NewPurchase {
        id: req.id.unwrap_or_else(Uuid::new_v4),
        affiliate_id: req.affiliate_id,
        amount: req.amount,
        status: req.status,
    };

    st.store.create_purchase(&purchase).await.map_err(|e| match e {
        EngineError::Validation(msg) => ApiError::BadRequest(msg)
            .with_meta(meta.clone())
            .with_code(E_BAD_AMOUNT),
        EngineError::Conflict(msg) => ApiError::Conflict(msg)
            .with_meta(meta.clone())
            .with_code(E_PURCHASE_CONFLICT),
        other => ApiError::from(other)
            .with_meta(meta.clone())
            .with_code(E_DB_FAILURE),
    })?;

    Ok(ApiOk::created(
        "purchase created",
        CreatePurchaseResponse { id: purchase.id },
        meta,
    ))
}

async fn process_purchase_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<ProcessResponse>, ApiErrorWithMeta> {
    let created = st
        .store
        .process_purchase(id, &st.plan)
        .await
        .map_err(|e| match e {
            EngineError::NotFound(_) => ApiErrorWithMeta::engine(e, meta.clone()),
            other => ApiError::from(other)
                .with_meta(meta.clone())
                .with_code(E_PROCESS_FAILURE),
        })?;

    if created > 0 {
        if let Err(err) = st.commissions.refresh_all().await {
            warn!(error = %err, "pending commissions refresh after purchase failed");
        }
    }
    Ok(ApiOk::ok(
        "purchase processed",
        ProcessResponse {
            processed: id,
            commissions_created: created,
        },
        meta,
    ))
}

async fn pending_commissions_handler(
    State(st): State<AppState>,
    Query(q): Query<PendingQuery>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<GroupedCommissions>, ApiErrorWithMeta> {
    let scope = CommissionScope {
        beneficiary: q.affiliate_id,
        search: None,
    }
    .with_search(q.search.as_deref().unwrap_or_default());

    let outcome = if q.refresh {
        st.commissions.reload(&scope).await
    } else {
        st.commissions.fetch_grouped(&scope).await
    }
    .map_err(engine_err(&meta))?;

    let view = st.commissions.grouped_for(&scope);
    match (outcome, view) {
        (_, Some(view)) => Ok(ApiOk::ok("pending commissions fetched", view, meta)),
        (FetchOutcome::InFlight | FetchOutcome::Superseded, None) => Err(in_flight(meta)),
        (_, None) => Err(ApiError::Unavailable("pending commissions are not loaded".into())
            .with_meta(meta)),
    }
}

async fn approve_commission_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    body: Option<Json<ApproveRequest>>,
) -> Result<ApiOk<ActionReport>, ApiErrorWithMeta> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let report = st
        .commissions
        .approve(id, req.note.as_deref())
        .await
        .map_err(engine_err(&meta))?;
    Ok(ApiOk::ok(report.message.clone(), report, meta))
}

async fn reject_commission_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<RejectRequest>,
) -> Result<ApiOk<ActionReport>, ApiErrorWithMeta> {
    let report = st
        .commissions
        .reject(id, &req.reason)
        .await
        .map_err(engine_err(&meta))?;
    Ok(ApiOk::ok(report.message.clone(), report, meta))
}

async fn batch_approve_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<BatchApproveRequest>,
) -> Result<ApiOk<BatchApproveResponse>, ApiErrorWithMeta> {
    let report = st
        .commissions
        .batch_approve(&req.ids)
        .await
        .map_err(engine_err(&meta))?;

    let response = BatchApproveResponse {
        failed: report
            .failed
            .iter()
            .map(|f| BatchFailureResponse {
                id: f.id,
                code: f.error.code(),
                error: f.error.to_string(),
            })
            .collect(),
        succeeded: report.succeeded,
    };
    Ok(ApiOk::ok(report.message, response, meta))
}

async fn list_withdrawals_handler(
    State(st): State<AppState>,
    Query(q): Query<PageQuery>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<WithdrawalListResponse>, ApiErrorWithMeta> {
    let query = q.query();
    let outcome = if q.refresh {
        st.withdrawals.reload(query).await
    } else {
        st.withdrawals.fetch(query).await
    }
    .map_err(engine_err(&meta))?;

    let Some(page) = st.withdrawals.page_for(query) else {
        return Err(match outcome {
            FetchOutcome::InFlight | FetchOutcome::Superseded => in_flight(meta),
            _ => ApiError::Unavailable("withdrawals are not loaded".into()).with_meta(meta),
        });
    };
    let pagination = page.pagination.clone();
    Ok(ApiOk::ok(
        "withdrawals fetched",
        WithdrawalListResponse {
            stats: page.effective_stats(),
            withdrawals: page.withdrawals,
        },
        meta,
    )
    .with_pagination(pagination))
}

/// Withdrawal actions act on the loaded page; load it if nothing is loaded yet.
async fn ensure_withdrawals_loaded(st: &AppState, q: &PageQuery) -> Result<(), EngineError> {
    if st.withdrawals.page().is_none() || q.page.is_some() || q.limit.is_some() {
        st.withdrawals.fetch(q.query()).await?;
    }
    Ok(())
}

async fn approve_withdrawal_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Query(q): Query<PageQuery>,
    Extension(meta): Extension<RequestMeta>,
    body: Option<Json<ApproveRequest>>,
) -> Result<ApiOk<ActionReport>, ApiErrorWithMeta> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    ensure_withdrawals_loaded(&st, &q)
        .await
        .map_err(engine_err(&meta))?;
    let report = st
        .withdrawals
        .approve(id, req.note.as_deref())
        .await
        .map_err(engine_err(&meta))?;
    Ok(ApiOk::ok(report.message.clone(), report, meta))
}

async fn reject_withdrawal_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Query(q): Query<PageQuery>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<RejectRequest>,
) -> Result<ApiOk<ActionReport>, ApiErrorWithMeta> {
    ensure_withdrawals_loaded(&st, &q)
        .await
        .map_err(engine_err(&meta))?;
    let report = st
        .withdrawals
        .reject(id, &req.reason)
        .await
        .map_err(engine_err(&meta))?;
    Ok(ApiOk::ok(report.message.clone(), report, meta))
}

async fn complete_withdrawal_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Query(q): Query<PageQuery>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<CompleteRequest>,
) -> Result<ApiOk<ActionReport>, ApiErrorWithMeta> {
    ensure_withdrawals_loaded(&st, &q)
        .await
        .map_err(engine_err(&meta))?;
    let report = st
        .withdrawals
        .complete(id, &req.transfer_reference)
        .await
        .map_err(engine_err(&meta))?;
    Ok(ApiOk::ok(report.message.clone(), report, meta))
}
