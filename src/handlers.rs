use crate::agents::NewAgent;
use crate::api_models::*;
use crate::errors::AppError;
use crate::ledger::BalanceSnapshot;
use crate::marketplace::{NewTicketRequest, ReceiptUpload, RequestListing};
use crate::models::*;
use crate::services::{Services, SweepReport};
use crate::store::Reconciliation;
use crate::webhook_handler::{constant_time_compare, payment_webhook};
use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Ledger, marketplace, assignment and bonus services over one store.
    pub services: Services,
    /// Value expected in `X-Admin-Key` on admin routes.
    pub admin_api_key: String,
    /// Value expected in `X-Webhook-Token` on the payment webhook.
    pub payment_webhook_secret: String,
}

/// Agent identity set by the upstream session layer (`X-Agent-Id`).
#[derive(Debug, Clone, Copy)]
pub struct AgentId(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for AgentId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get("X-Agent-Id")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Unauthorized("Missing X-Agent-Id header".to_string()))?;
        Uuid::parse_str(raw.trim())
            .map(AgentId)
            .map_err(|_| AppError::Unauthorized("Malformed X-Agent-Id header".to_string()))
    }
}

/// Passes only requests carrying the admin key. Holds the reviewer name
/// from `X-Admin-User`, or "admin".
#[derive(Debug, Clone)]
pub struct AdminUser(pub String);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AdminUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let key = parts
            .headers
            .get("X-Admin-Key")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Unauthorized("Missing X-Admin-Key header".to_string()))?;
        if !constant_time_compare(key, &state.admin_api_key) {
            return Err(AppError::Unauthorized("Invalid admin key".to_string()));
        }
        let reviewer = parts
            .headers
            .get("X-Admin-User")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or("admin");
        Ok(AdminUser(reviewer.to_string()))
    }
}

/// Health check endpoint.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "agent-float-api",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// Health check plus every API route, without the rate limiter `main` adds.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(api_routes())
        .with_state(state)
}

/// All `/api/v1` routes, still waiting for their state.
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Agent self-service
        .route("/api/v1/agents", post(register_agent))
        .route("/api/v1/agents/me", get(get_me))
        .route(
            "/api/v1/agents/me/phone-verification",
            post(request_phone_verification),
        )
        .route(
            "/api/v1/agents/me/phone-verification/confirm",
            post(confirm_phone_verification),
        )
        // Ledger
        .route("/api/v1/float/balance", get(get_balance))
        .route("/api/v1/float/transactions", get(list_transactions))
        .route("/api/v1/float/purchases", post(begin_purchase))
        // Marketplace
        .route(
            "/api/v1/ticket-requests",
            get(list_open_requests).post(submit_ticket_request),
        )
        .route("/api/v1/ticket-requests/:id/view", post(view_request))
        .route("/api/v1/ticket-requests/:id/claim", post(claim_request))
        .route("/api/v1/ticket-requests/:id/complete", post(complete_request))
        // Assignments, tiers, bonuses
        .route("/api/v1/assignments", get(list_my_assignments))
        .route(
            "/api/v1/assignments/:booking_id/respond",
            post(respond_to_assignment),
        )
        .route("/api/v1/performance", get(get_performance))
        .route("/api/v1/bonuses", get(list_bonuses))
        .route("/api/v1/bonuses/:id/claim", post(claim_bonus))
        // Payment provider
        .route("/api/v1/webhooks/payments", post(payment_webhook))
        // Admin review surface
        .route("/api/v1/admin/agents/:id/approve", post(approve_agent))
        .route("/api/v1/admin/agents/:id/suspend", post(suspend_agent))
        .route("/api/v1/admin/agents/:id/reject", post(reject_agent))
        .route("/api/v1/admin/agents/:id/reinstate", post(reinstate_agent))
        .route("/api/v1/admin/agents/:id/reconcile", post(reconcile_agent))
        .route("/api/v1/admin/agents/:id/bonuses", post(grant_bonus))
        .route("/api/v1/admin/referrals", post(credit_referral))
        .route("/api/v1/admin/receipts/:id/review", post(review_receipt))
        .route("/api/v1/admin/bookings", post(create_booking))
        .route("/api/v1/admin/bookings/:id", get(get_booking))
        .route("/api/v1/admin/bookings/:id/assign", post(assign_booking))
        .route("/api/v1/admin/bookings/:id/history", get(booking_history))
        .route("/api/v1/admin/sweep", post(run_sweep))
}

/// POST /api/v1/agents
pub async fn register_agent(
    State(state): State<Arc<AppState>>,
    Json(input): Json<NewAgent>,
) -> Result<(StatusCode, Json<Agent>), AppError> {
    let agent = state.services.agents.register(input, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

/// GET /api/v1/agents/me
pub async fn get_me(
    State(state): State<Arc<AppState>>,
    AgentId(agent_id): AgentId,
) -> Result<Json<Agent>, AppError> {
    Ok(Json(state.services.agents.get(agent_id).await?))
}

/// POST /api/v1/agents/me/phone-verification
///
/// The code goes out through the notification webhook, never in the response.
pub async fn request_phone_verification(
    State(state): State<Arc<AppState>>,
    AgentId(agent_id): AgentId,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    state
        .services
        .agents
        .request_phone_verification(agent_id)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "code_sent" }))))
}

/// POST /api/v1/agents/me/phone-verification/confirm
pub async fn confirm_phone_verification(
    State(state): State<Arc<AppState>>,
    AgentId(agent_id): AgentId,
    Json(body): Json<ConfirmPhoneRequest>,
) -> Result<Json<Agent>, AppError> {
    let agent = state
        .services
        .agents
        .confirm_phone_verification(agent_id, body.code.trim(), Utc::now())
        .await?;
    Ok(Json(agent))
}

/// GET /api/v1/float/balance
pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    AgentId(agent_id): AgentId,
) -> Result<Json<BalanceSnapshot>, AppError> {
    Ok(Json(
        state.services.ledger.get_balance(agent_id, Utc::now()).await?,
    ))
}

/// GET /api/v1/float/transactions?limit=50
pub async fn list_transactions(
    State(state): State<Arc<AppState>>,
    AgentId(agent_id): AgentId,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<FloatTransaction>>, AppError> {
    Ok(Json(
        state
            .services
            .ledger
            .transactions(agent_id, params.limit)
            .await?,
    ))
}

/// POST /api/v1/float/purchases
///
/// Records a pending purchase; the payment webhook settles it.
pub async fn begin_purchase(
    State(state): State<Arc<AppState>>,
    AgentId(agent_id): AgentId,
    Json(body): Json<PurchaseRequest>,
) -> Result<(StatusCode, Json<FloatTransaction>), AppError> {
    state.services.ledger.ensure_eligible(agent_id).await?;
    let transaction = state
        .services
        .ledger
        .begin_purchase(
            agent_id,
            body.amount_zmw,
            body.requests,
            body.reference,
            Utc::now(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(transaction)))
}

/// GET /api/v1/ticket-requests
pub async fn list_open_requests(
    State(state): State<Arc<AppState>>,
    AgentId(agent_id): AgentId,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<RequestListing>>, AppError> {
    Ok(Json(
        state
            .services
            .marketplace
            .list_open(agent_id, params.limit, Utc::now())
            .await?,
    ))
}

/// POST /api/v1/ticket-requests
///
/// Public intake; no agent identity required.
pub async fn submit_ticket_request(
    State(state): State<Arc<AppState>>,
    Json(input): Json<NewTicketRequest>,
) -> Result<(StatusCode, Json<RequestListing>), AppError> {
    let request = state
        .services
        .marketplace
        .submit_request(input, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(RequestListing::from(&request))))
}

/// POST /api/v1/ticket-requests/:id/view
pub async fn view_request(
    State(state): State<Arc<AppState>>,
    AgentId(agent_id): AgentId,
    Path(request_id): Path<Uuid>,
) -> Result<Json<ViewResponse>, AppError> {
    let record = state
        .services
        .marketplace
        .view(agent_id, request_id, Utc::now())
        .await?;
    Ok(Json(record.into()))
}

/// POST /api/v1/ticket-requests/:id/claim
pub async fn claim_request(
    State(state): State<Arc<AppState>>,
    AgentId(agent_id): AgentId,
    Path(request_id): Path<Uuid>,
) -> Result<Json<ClaimResponse>, AppError> {
    let record = state
        .services
        .marketplace
        .claim(agent_id, request_id, Utc::now())
        .await?;
    Ok(Json(record.into()))
}

/// POST /api/v1/ticket-requests/:id/complete
pub async fn complete_request(
    State(state): State<Arc<AppState>>,
    AgentId(agent_id): AgentId,
    Path(request_id): Path<Uuid>,
    Json(receipt): Json<ReceiptUpload>,
) -> Result<Json<CompletionResponse>, AppError> {
    let record = state
        .services
        .marketplace
        .complete(agent_id, request_id, receipt, Utc::now())
        .await?;
    Ok(Json(record.into()))
}

/// GET /api/v1/assignments
pub async fn list_my_assignments(
    State(state): State<Arc<AppState>>,
    AgentId(agent_id): AgentId,
) -> Result<Json<Vec<Booking>>, AppError> {
    Ok(Json(
        state
            .services
            .assignments
            .agent_assignments(agent_id, Utc::now())
            .await?,
    ))
}

/// POST /api/v1/assignments/:booking_id/respond
pub async fn respond_to_assignment(
    State(state): State<Arc<AppState>>,
    AgentId(agent_id): AgentId,
    Path(booking_id): Path<Uuid>,
    Json(body): Json<AssignmentResponseRequest>,
) -> Result<Json<Booking>, AppError> {
    let booking = state
        .services
        .assignments
        .respond(booking_id, agent_id, body.accept, Utc::now())
        .await?;
    Ok(Json(booking))
}

/// GET /api/v1/performance
pub async fn get_performance(
    State(state): State<Arc<AppState>>,
    AgentId(agent_id): AgentId,
) -> Result<Json<PerformanceTier>, AppError> {
    Ok(Json(state.services.performance.get(agent_id).await?))
}

/// GET /api/v1/bonuses
pub async fn list_bonuses(
    State(state): State<Arc<AppState>>,
    AgentId(agent_id): AgentId,
) -> Result<Json<Vec<Bonus>>, AppError> {
    Ok(Json(state.services.bonuses.list(agent_id).await?))
}

/// POST /api/v1/bonuses/:id/claim
pub async fn claim_bonus(
    State(state): State<Arc<AppState>>,
    AgentId(agent_id): AgentId,
    Path(bonus_id): Path<Uuid>,
) -> Result<Json<BonusClaimResponse>, AppError> {
    let (bonus, transaction) = state
        .services
        .bonuses
        .claim(agent_id, bonus_id, Utc::now())
        .await?;
    Ok(Json(BonusClaimResponse { bonus, transaction }))
}

/// POST /api/v1/admin/agents/:id/approve
pub async fn approve_agent(
    State(state): State<Arc<AppState>>,
    AdminUser(reviewer): AdminUser,
    Path(agent_id): Path<Uuid>,
) -> Result<Json<Agent>, AppError> {
    Ok(Json(
        state
            .services
            .agents
            .approve(agent_id, &reviewer, Utc::now())
            .await?,
    ))
}

/// POST /api/v1/admin/agents/:id/suspend
pub async fn suspend_agent(
    State(state): State<Arc<AppState>>,
    AdminUser(reviewer): AdminUser,
    Path(agent_id): Path<Uuid>,
    Json(body): Json<ReviewRequest>,
) -> Result<Json<Agent>, AppError> {
    Ok(Json(
        state
            .services
            .agents
            .suspend(agent_id, &reviewer, body.reason, Utc::now())
            .await?,
    ))
}

/// POST /api/v1/admin/agents/:id/reject
pub async fn reject_agent(
    State(state): State<Arc<AppState>>,
    AdminUser(reviewer): AdminUser,
    Path(agent_id): Path<Uuid>,
    Json(body): Json<ReviewRequest>,
) -> Result<Json<Agent>, AppError> {
    Ok(Json(
        state
            .services
            .agents
            .reject(agent_id, &reviewer, body.reason, Utc::now())
            .await?,
    ))
}

/// POST /api/v1/admin/agents/:id/reinstate
pub async fn reinstate_agent(
    State(state): State<Arc<AppState>>,
    AdminUser(reviewer): AdminUser,
    Path(agent_id): Path<Uuid>,
) -> Result<Json<Agent>, AppError> {
    Ok(Json(
        state
            .services
            .agents
            .reinstate(agent_id, &reviewer, Utc::now())
            .await?,
    ))
}

/// POST /api/v1/admin/agents/:id/reconcile
pub async fn reconcile_agent(
    State(state): State<Arc<AppState>>,
    AdminUser(reviewer): AdminUser,
    Path(agent_id): Path<Uuid>,
) -> Result<Json<Reconciliation>, AppError> {
    tracing::info!("{} requested reconciliation for agent {}", reviewer, agent_id);
    Ok(Json(
        state.services.ledger.reconcile(agent_id, Utc::now()).await?,
    ))
}

/// POST /api/v1/admin/agents/:id/bonuses
pub async fn grant_bonus(
    State(state): State<Arc<AppState>>,
    AdminUser(reviewer): AdminUser,
    Path(agent_id): Path<Uuid>,
    Json(body): Json<PromotionalBonusRequest>,
) -> Result<(StatusCode, Json<Bonus>), AppError> {
    tracing::info!("{} granting promotional bonus to {}", reviewer, agent_id);
    let bonus = state
        .services
        .bonuses
        .grant_promotional(
            agent_id,
            body.amount_zmw,
            body.description,
            body.expires_at,
            Utc::now(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(bonus)))
}

/// POST /api/v1/admin/referrals
pub async fn credit_referral(
    State(state): State<Arc<AppState>>,
    AdminUser(reviewer): AdminUser,
    Json(body): Json<ReferralRequest>,
) -> Result<(StatusCode, Json<ReferralResponse>), AppError> {
    tracing::info!(
        "{} linking referral {} -> {}",
        reviewer,
        body.referrer_id,
        body.referred_id
    );
    let credit = state
        .services
        .bonuses
        .credit_referral(body.referrer_id, body.referred_id, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(credit.into())))
}

/// POST /api/v1/admin/receipts/:id/review
pub async fn review_receipt(
    State(state): State<Arc<AppState>>,
    AdminUser(reviewer): AdminUser,
    Path(ticket_id): Path<Uuid>,
    Json(body): Json<ReceiptReviewRequest>,
) -> Result<Json<ProcessedTicket>, AppError> {
    let ticket = state
        .services
        .marketplace
        .verify_receipt(
            ticket_id,
            body.approve,
            &reviewer,
            body.reason.as_deref(),
            Utc::now(),
        )
        .await?;
    Ok(Json(ticket))
}

/// POST /api/v1/admin/bookings
pub async fn create_booking(
    State(state): State<Arc<AppState>>,
    AdminUser(_reviewer): AdminUser,
    Json(body): Json<NewBookingRequest>,
) -> Result<(StatusCode, Json<Booking>), AppError> {
    let booking = state
        .services
        .assignments
        .register_booking(body.booking_reference, body.status, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(booking)))
}

/// GET /api/v1/admin/bookings/:id
pub async fn get_booking(
    State(state): State<Arc<AppState>>,
    AdminUser(_reviewer): AdminUser,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<Booking>, AppError> {
    Ok(Json(
        state
            .services
            .assignments
            .booking(booking_id, Utc::now())
            .await?,
    ))
}

/// POST /api/v1/admin/bookings/:id/assign
pub async fn assign_booking(
    State(state): State<Arc<AppState>>,
    AdminUser(reviewer): AdminUser,
    Path(booking_id): Path<Uuid>,
    Json(body): Json<AssignRequest>,
) -> Result<Json<Booking>, AppError> {
    let booking = state
        .services
        .assignments
        .assign(
            booking_id,
            body.agent_id,
            &reviewer,
            body.timeout_minutes,
            Utc::now(),
        )
        .await?;
    Ok(Json(booking))
}

/// GET /api/v1/admin/bookings/:id/history
pub async fn booking_history(
    State(state): State<Arc<AppState>>,
    AdminUser(_reviewer): AdminUser,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<Vec<AssignmentHistory>>, AppError> {
    Ok(Json(state.services.assignments.history(booking_id).await?))
}

/// POST /api/v1/admin/sweep
pub async fn run_sweep(
    State(state): State<Arc<AppState>>,
    AdminUser(_reviewer): AdminUser,
) -> Result<Json<SweepReport>, AppError> {
    Ok(Json(state.services.sweep(Utc::now()).await?))
}
