//! Storage seam for the float ledger and marketplace.
//!
//! Every method is one atomic unit at the storage layer: either all of its
//! writes land or none do. Multi-row changes that must agree (a fee debit and
//! the claim it pays for) live in a single method so no caller can split them.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::*;

/// A ledger debit committed inside a gated store operation.
///
/// The store applies it as a conditional update (`balance >= amount AND
/// quota >= quota_cost`) in the same transaction as the action it pays for.
#[derive(Debug, Clone, PartialEq)]
pub struct Charge {
    pub agent_id: Uuid,
    /// Non-negative; recorded as a negative usage amount.
    pub amount: BigDecimal,
    pub quota_cost: i32,
    pub reference: String,
}

impl Charge {
    /// Nothing to debit and nothing to log.
    pub fn is_free(&self) -> bool {
        self.amount == BigDecimal::from(0) && self.quota_cost == 0
    }

    pub fn usage_transaction(&self, ticket_request_id: Uuid, now: DateTime<Utc>) -> FloatTransaction {
        FloatTransaction::completed(
            self.agent_id,
            TransactionType::Usage,
            -self.amount.clone(),
            -self.quota_cost,
            Some(self.reference.clone()),
            now,
        )
        .for_request(ticket_request_id)
    }
}

/// An admin review transition, applied only if the agent is in one of `from`.
#[derive(Debug, Clone)]
pub struct AgentStatusChange {
    pub agent_id: Uuid,
    pub from: Vec<AgentStatus>,
    pub to: AgentStatus,
    pub reviewer: String,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Rows created the first time an agent is approved.
#[derive(Debug, Clone)]
pub struct AccountOpening {
    pub account: FloatAccount,
    pub performance: PerformanceTier,
}

#[derive(Debug, Clone, Serialize)]
pub struct Reconciliation {
    pub agent_id: Uuid,
    pub recorded_balance: BigDecimal,
    pub derived_balance: BigDecimal,
    /// recorded - derived
    pub drift: BigDecimal,
    pub corrected: bool,
}

#[derive(Debug, Clone)]
pub struct ViewRecord {
    pub request: TicketRequest,
    pub view: RequestView,
    pub transaction: Option<FloatTransaction>,
    /// False when the agent had already paid for this request.
    pub newly_charged: bool,
}

#[derive(Debug, Clone)]
pub struct ClaimRecord {
    pub request: TicketRequest,
    pub transaction: Option<FloatTransaction>,
}

#[derive(Debug, Clone)]
pub struct CompletionRecord {
    pub request: TicketRequest,
    pub ticket: ProcessedTicket,
    pub total_completed: i32,
}

/// A staff (or escalation) offer of a booking to an agent.
#[derive(Debug, Clone)]
pub struct AssignmentOffer {
    pub booking_id: Uuid,
    pub agent_id: Uuid,
    pub assigned_by: String,
    pub deadline: DateTime<Utc>,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait FloatStore: Send + Sync {
    // ---- agents ----

    async fn insert_agent(&self, agent: &Agent) -> Result<(), AppError>;

    async fn get_agent(&self, agent_id: Uuid) -> Result<Option<Agent>, AppError>;

    async fn mark_phone_verified(
        &self,
        agent_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// Compare-and-swap on agent status. When `opening` is given, the float
    /// account and performance rows are created in the same transaction if
    /// they do not exist yet. Returns `None` if the agent was not in `from`.
    async fn transition_agent(
        &self,
        change: &AgentStatusChange,
        opening: Option<&AccountOpening>,
    ) -> Result<Option<Agent>, AppError>;

    /// Approved agent, other than `exclude`, never offered this booking;
    /// most completed requests first.
    async fn find_reassignment_candidate(
        &self,
        booking_id: Uuid,
        exclude: Uuid,
    ) -> Result<Option<Uuid>, AppError>;

    // ---- ledger ----

    async fn get_account(&self, agent_id: Uuid) -> Result<Option<FloatAccount>, AppError>;

    /// Refills quota if `last_quota_reset < today`. Returns the account only
    /// when this call performed the reset.
    async fn reset_daily_quota(
        &self,
        agent_id: Uuid,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Option<FloatAccount>, AppError>;

    /// Appends a completed, non-negative credit and applies it to the account.
    /// Quota grows by `requests_allocated`, capped at the daily limit.
    async fn post_credit(&self, transaction: &FloatTransaction) -> Result<FloatAccount, AppError>;

    async fn insert_pending_transaction(
        &self,
        transaction: &FloatTransaction,
    ) -> Result<(), AppError>;

    /// Moves a pending transaction to `outcome`, applying it to the account
    /// when completed. `None` if the transaction was not pending.
    async fn settle_transaction(
        &self,
        transaction_id: Uuid,
        outcome: TransactionStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<FloatTransaction>, AppError>;

    async fn get_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<FloatTransaction>, AppError>;

    async fn list_transactions(
        &self,
        agent_id: Uuid,
        limit: i64,
    ) -> Result<Vec<FloatTransaction>, AppError>;

    /// Recomputes the balance from the transaction log and corrects drift.
    async fn reconcile_balance(
        &self,
        agent_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Reconciliation>, AppError>;

    // ---- marketplace ----

    async fn insert_ticket_request(&self, request: &TicketRequest) -> Result<(), AppError>;

    async fn get_ticket_request(&self, request_id: Uuid)
        -> Result<Option<TicketRequest>, AppError>;

    async fn list_open_requests(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TicketRequest>, AppError>;

    /// Records a paid view: validates the request is claimable, then (unless
    /// the agent already viewed it) debits `charge` and inserts the view.
    async fn record_view(
        &self,
        request_id: Uuid,
        charge: &Charge,
        now: DateTime<Utc>,
    ) -> Result<ViewRecord, AppError>;

    /// CAS `open -> claimed_by_agent` plus the fee debit, in one transaction.
    async fn claim_request(
        &self,
        request_id: Uuid,
        charge: &Charge,
        now: DateTime<Utc>,
    ) -> Result<ClaimRecord, AppError>;

    /// CAS `claimed_by_agent -> completed` for the claiming agent, inserting
    /// the processed ticket and bumping the completed count.
    async fn complete_request(
        &self,
        ticket: &ProcessedTicket,
        now: DateTime<Utc>,
    ) -> Result<CompletionRecord, AppError>;

    /// Expires one request if it is non-terminal and past its deadline.
    async fn expire_request(
        &self,
        request_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<TicketRequest>, AppError>;

    async fn expire_due_requests(&self, now: DateTime<Utc>) -> Result<u64, AppError>;

    async fn get_processed_ticket(
        &self,
        ticket_id: Uuid,
    ) -> Result<Option<ProcessedTicket>, AppError>;

    /// CAS on `receipt_verification_status = pending`.
    async fn review_processed_ticket(
        &self,
        ticket_id: Uuid,
        outcome: ReceiptVerificationStatus,
        reviewer: &str,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<ProcessedTicket>, AppError>;

    // ---- performance ----

    async fn get_performance(&self, agent_id: Uuid) -> Result<Option<PerformanceTier>, AppError>;

    /// Moves the agent to `tier` only if the stored tier ranks lower.
    async fn upgrade_tier(
        &self,
        agent_id: Uuid,
        tier: Tier,
        cost_per_request: &BigDecimal,
        bonus_percentage: &BigDecimal,
        now: DateTime<Utc>,
    ) -> Result<Option<PerformanceTier>, AppError>;

    // ---- bonuses & referrals ----

    /// False when a bonus with the same dedupe key already exists.
    async fn insert_bonus(&self, bonus: &Bonus) -> Result<bool, AppError>;

    async fn list_bonuses(&self, agent_id: Uuid) -> Result<Vec<Bonus>, AppError>;

    /// CAS `claimed = false` plus the ledger credit.
    async fn claim_bonus(
        &self,
        agent_id: Uuid,
        bonus_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(Bonus, FloatTransaction), AppError>;

    /// Inserts a credited referral and credits both agents. Fails with
    /// `ReferralExists` if either uniqueness rule is violated.
    async fn credit_referral(
        &self,
        referral: &Referral,
    ) -> Result<(FloatTransaction, FloatTransaction), AppError>;

    // ---- assignments ----

    async fn insert_booking(&self, booking: &Booking) -> Result<(), AppError>;

    async fn get_booking(&self, booking_id: Uuid) -> Result<Option<Booking>, AppError>;

    /// CAS from none/rejected/expired to pending, with a history row.
    async fn assign_booking(&self, offer: &AssignmentOffer) -> Result<Booking, AppError>;

    /// Accept or reject a pending, unexpired assignment. Rejection marks the
    /// booking escalated in the same transaction. Past the deadline this
    /// returns `AssignmentExpired` without writing.
    async fn respond_assignment(
        &self,
        booking_id: Uuid,
        agent_id: Uuid,
        accept: bool,
        now: DateTime<Utc>,
    ) -> Result<Booking, AppError>;

    /// CAS overdue `pending -> expired`, marking it escalated.
    async fn expire_assignment(
        &self,
        booking_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Booking>, AppError>;

    async fn list_overdue_assignments(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, AppError>;

    async fn list_agent_assignments(&self, agent_id: Uuid) -> Result<Vec<Booking>, AppError>;

    async fn assignment_history(
        &self,
        booking_id: Uuid,
    ) -> Result<Vec<AssignmentHistory>, AppError>;
}
