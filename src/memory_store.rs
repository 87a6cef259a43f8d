//! In-process `FloatStore` used by tests and local runs.
//!
//! Each trait method takes the single state lock for its whole body, which
//! gives the same all-or-nothing behavior as one database transaction.
//! Validation always happens before the first mutation.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::*;
use crate::store::*;

#[derive(Default)]
struct MemoryState {
    agents: HashMap<Uuid, Agent>,
    accounts: HashMap<Uuid, FloatAccount>,
    transactions: Vec<FloatTransaction>,
    requests: HashMap<Uuid, TicketRequest>,
    views: HashMap<(Uuid, Uuid), RequestView>,
    processed: HashMap<Uuid, ProcessedTicket>,
    performance: HashMap<Uuid, PerformanceTier>,
    bonuses: HashMap<Uuid, Bonus>,
    referrals: Vec<Referral>,
    bookings: HashMap<Uuid, Booking>,
    history: Vec<AssignmentHistory>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an out-of-band balance write so reconciliation can be drilled.
    pub fn overwrite_balance(&self, agent_id: Uuid, balance: BigDecimal) {
        if let Some(account) = self.state.lock().accounts.get_mut(&agent_id) {
            account.current_balance = balance;
        }
    }
}

impl MemoryState {
    fn debit(
        &mut self,
        charge: &Charge,
        ticket_request_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<FloatTransaction>, AppError> {
        let eligible = self
            .agents
            .get(&charge.agent_id)
            .map(Agent::is_eligible)
            .unwrap_or(false);
        if !eligible {
            return Err(AppError::AgentNotEligible);
        }
        let account = self
            .accounts
            .get_mut(&charge.agent_id)
            .ok_or(AppError::AgentNotEligible)?;

        if account.current_balance < charge.amount {
            return Err(AppError::InsufficientFunds);
        }
        if account.daily_quota_remaining < charge.quota_cost {
            return Err(AppError::QuotaExhausted);
        }
        if charge.is_free() {
            return Ok(None);
        }

        account.current_balance = &account.current_balance - &charge.amount;
        account.daily_quota_remaining -= charge.quota_cost;
        account.updated_at = now;

        let transaction = charge.usage_transaction(ticket_request_id, now);
        self.transactions.push(transaction.clone());
        Ok(Some(transaction))
    }

    fn apply_credit(
        &mut self,
        transaction: &FloatTransaction,
        now: DateTime<Utc>,
    ) -> Result<FloatAccount, AppError> {
        let account = self
            .accounts
            .get_mut(&transaction.agent_id)
            .ok_or_else(|| {
                AppError::NotFound(format!("Float account for {}", transaction.agent_id))
            })?;
        account.current_balance = &account.current_balance + &transaction.amount_zmw;
        account.daily_quota_remaining = (account.daily_quota_remaining
            + transaction.requests_allocated)
            .clamp(0, account.daily_quota_limit);
        account.updated_at = now;
        Ok(account.clone())
    }

    fn require_credit_account(&self, agent_id: Uuid) -> Result<(), AppError> {
        if self.accounts.contains_key(&agent_id) {
            Ok(())
        } else {
            Err(AppError::NotFound(format!("Float account for {}", agent_id)))
        }
    }

    fn push_history(
        &mut self,
        booking_id: Uuid,
        agent_id: Uuid,
        action: AssignmentAction,
        actor: &str,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.history.push(AssignmentHistory::record(
            booking_id, agent_id, action, actor, notes, now,
        ));
    }
}

#[async_trait]
impl FloatStore for MemoryStore {
    async fn insert_agent(&self, agent: &Agent) -> Result<(), AppError> {
        let mut state = self.state.lock();
        if state.agents.values().any(|a| a.phone == agent.phone) {
            return Err(AppError::BadRequest(format!(
                "Phone {} is already registered",
                agent.phone
            )));
        }
        state.agents.insert(agent.id, agent.clone());
        Ok(())
    }

    async fn get_agent(&self, agent_id: Uuid) -> Result<Option<Agent>, AppError> {
        Ok(self.state.lock().agents.get(&agent_id).cloned())
    }

    async fn mark_phone_verified(
        &self,
        agent_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut state = self.state.lock();
        match state.agents.get_mut(&agent_id) {
            Some(agent) => {
                agent.phone_verified = true;
                agent.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn transition_agent(
        &self,
        change: &AgentStatusChange,
        opening: Option<&AccountOpening>,
    ) -> Result<Option<Agent>, AppError> {
        let mut state = self.state.lock();
        let Some(agent) = state.agents.get_mut(&change.agent_id) else {
            return Ok(None);
        };
        if !change.from.contains(&agent.status) {
            return Ok(None);
        }
        agent.status = change.to;
        agent.reviewed_by = Some(change.reviewer.clone());
        agent.reviewed_at = Some(change.at);
        agent.status_reason = change.reason.clone();
        agent.updated_at = change.at;
        let updated = agent.clone();

        if let Some(opening) = opening {
            state
                .accounts
                .entry(change.agent_id)
                .or_insert_with(|| opening.account.clone());
            state
                .performance
                .entry(change.agent_id)
                .or_insert_with(|| opening.performance.clone());
        }
        Ok(Some(updated))
    }

    async fn find_reassignment_candidate(
        &self,
        booking_id: Uuid,
        exclude: Uuid,
    ) -> Result<Option<Uuid>, AppError> {
        let state = self.state.lock();
        let mut candidates: Vec<(&Agent, i32)> = state
            .agents
            .values()
            .filter(|a| a.is_eligible() && a.id != exclude)
            .filter(|a| {
                !state
                    .history
                    .iter()
                    .any(|h| h.booking_id == booking_id && h.agent_id == a.id)
            })
            .map(|a| {
                let completed = state
                    .performance
                    .get(&a.id)
                    .map(|p| p.total_requests_completed)
                    .unwrap_or(0);
                (a, completed)
            })
            .collect();
        candidates.sort_by(|(a, ca), (b, cb)| cb.cmp(ca).then(a.created_at.cmp(&b.created_at)));
        Ok(candidates.first().map(|(a, _)| a.id))
    }

    async fn get_account(&self, agent_id: Uuid) -> Result<Option<FloatAccount>, AppError> {
        Ok(self.state.lock().accounts.get(&agent_id).cloned())
    }

    async fn reset_daily_quota(
        &self,
        agent_id: Uuid,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Option<FloatAccount>, AppError> {
        let mut state = self.state.lock();
        match state.accounts.get_mut(&agent_id) {
            Some(account) if account.last_quota_reset < today => {
                account.daily_quota_remaining = account.daily_quota_limit;
                account.last_quota_reset = today;
                account.updated_at = now;
                Ok(Some(account.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn post_credit(&self, transaction: &FloatTransaction) -> Result<FloatAccount, AppError> {
        let mut state = self.state.lock();
        state.require_credit_account(transaction.agent_id)?;
        let now = transaction.completed_at.unwrap_or(transaction.created_at);
        let account = state.apply_credit(transaction, now)?;
        state.transactions.push(transaction.clone());
        Ok(account)
    }

    async fn insert_pending_transaction(
        &self,
        transaction: &FloatTransaction,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock();
        state.require_credit_account(transaction.agent_id)?;
        state.transactions.push(transaction.clone());
        Ok(())
    }

    async fn settle_transaction(
        &self,
        transaction_id: Uuid,
        outcome: TransactionStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<FloatTransaction>, AppError> {
        let mut state = self.state.lock();
        let Some(index) = state
            .transactions
            .iter()
            .position(|t| t.id == transaction_id && t.status.can_transition_to(outcome))
        else {
            return Ok(None);
        };

        let mut settled = state.transactions[index].clone();
        settled.status = outcome;
        settled.completed_at = Some(now);
        if outcome == TransactionStatus::Completed {
            state.apply_credit(&settled, now)?;
        }
        state.transactions[index] = settled.clone();
        Ok(Some(settled))
    }

    async fn get_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<FloatTransaction>, AppError> {
        let state = self.state.lock();
        Ok(state
            .transactions
            .iter()
            .find(|t| t.id == transaction_id)
            .cloned())
    }

    async fn list_transactions(
        &self,
        agent_id: Uuid,
        limit: i64,
    ) -> Result<Vec<FloatTransaction>, AppError> {
        let state = self.state.lock();
        Ok(state
            .transactions
            .iter()
            .rev()
            .filter(|t| t.agent_id == agent_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn reconcile_balance(
        &self,
        agent_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Reconciliation>, AppError> {
        let mut state = self.state.lock();
        let ledger_sum = state
            .transactions
            .iter()
            .filter(|t| t.agent_id == agent_id && t.status == TransactionStatus::Completed)
            .fold(BigDecimal::from(0), |acc, t| acc + &t.amount_zmw);

        let Some(account) = state.accounts.get_mut(&agent_id) else {
            return Ok(None);
        };
        let derived = &account.welcome_bonus + &ledger_sum;
        let recorded = account.current_balance.clone();
        let drift = &recorded - &derived;
        let corrected = drift != BigDecimal::from(0);
        if corrected {
            account.current_balance = derived.clone();
            account.updated_at = now;
        }
        Ok(Some(Reconciliation {
            agent_id,
            recorded_balance: recorded,
            derived_balance: derived,
            drift,
            corrected,
        }))
    }

    async fn insert_ticket_request(&self, request: &TicketRequest) -> Result<(), AppError> {
        self.state
            .lock()
            .requests
            .insert(request.id, request.clone());
        Ok(())
    }

    async fn get_ticket_request(
        &self,
        request_id: Uuid,
    ) -> Result<Option<TicketRequest>, AppError> {
        Ok(self.state.lock().requests.get(&request_id).cloned())
    }

    async fn list_open_requests(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TicketRequest>, AppError> {
        let state = self.state.lock();
        let mut open: Vec<TicketRequest> = state
            .requests
            .values()
            .filter(|r| r.is_claimable(now))
            .cloned()
            .collect();
        open.sort_by_key(|r| (r.request_expires_at, r.created_at));
        open.truncate(limit.max(0) as usize);
        Ok(open)
    }

    async fn record_view(
        &self,
        request_id: Uuid,
        charge: &Charge,
        now: DateTime<Utc>,
    ) -> Result<ViewRecord, AppError> {
        let mut state = self.state.lock();
        let request = state
            .requests
            .get(&request_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Ticket request {}", request_id)))?;
        if let Some(reason) = request.unavailable_reason(now) {
            return Err(reason);
        }

        if let Some(view) = state.views.get(&(charge.agent_id, request_id)).cloned() {
            return Ok(ViewRecord {
                request,
                view,
                transaction: None,
                newly_charged: false,
            });
        }

        let transaction = state.debit(charge, request_id, now)?;
        let view = RequestView {
            agent_id: charge.agent_id,
            ticket_request_id: request_id,
            transaction_id: transaction.as_ref().map(|t| t.id),
            viewed_at: now,
        };
        state
            .views
            .insert((charge.agent_id, request_id), view.clone());
        Ok(ViewRecord {
            request,
            view,
            transaction,
            newly_charged: true,
        })
    }

    async fn claim_request(
        &self,
        request_id: Uuid,
        charge: &Charge,
        now: DateTime<Utc>,
    ) -> Result<ClaimRecord, AppError> {
        let mut state = self.state.lock();
        let current = state
            .requests
            .get(&request_id)
            .ok_or_else(|| AppError::NotFound(format!("Ticket request {}", request_id)))?;
        if let Some(reason) = current.unavailable_reason(now) {
            return Err(reason);
        }

        let transaction = state.debit(charge, request_id, now)?;
        let request = state
            .requests
            .get_mut(&request_id)
            .ok_or_else(|| AppError::NotFound(format!("Ticket request {}", request_id)))?;
        request.status = TicketRequestStatus::ClaimedByAgent;
        request.agent_id = Some(charge.agent_id);
        request.agent_claimed_at = Some(now);
        Ok(ClaimRecord {
            request: request.clone(),
            transaction,
        })
    }

    async fn complete_request(
        &self,
        ticket: &ProcessedTicket,
        now: DateTime<Utc>,
    ) -> Result<CompletionRecord, AppError> {
        let mut state = self.state.lock();
        let approved = state
            .agents
            .get(&ticket.agent_id)
            .map(Agent::is_eligible)
            .unwrap_or(false);
        if !approved {
            return Err(AppError::AgentNotEligible);
        }
        let request = state
            .requests
            .get(&ticket.ticket_request_id)
            .ok_or_else(|| {
                AppError::NotFound(format!("Ticket request {}", ticket.ticket_request_id))
            })?;

        if request.agent_id != Some(ticket.agent_id) {
            return Err(AppError::NotFound(format!(
                "Ticket request {} is not claimed by this agent",
                ticket.ticket_request_id
            )));
        }
        match request.status {
            TicketRequestStatus::ClaimedByAgent if !request.is_past_deadline(now) => {}
            TicketRequestStatus::ClaimedByAgent | TicketRequestStatus::Expired => {
                return Err(AppError::RequestExpired)
            }
            other => {
                return Err(AppError::InvalidTransition(format!(
                    "ticket request is {}",
                    other
                )))
            }
        }
        if !state.performance.contains_key(&ticket.agent_id) {
            return Err(AppError::AgentNotEligible);
        }

        let request = state
            .requests
            .get_mut(&ticket.ticket_request_id)
            .ok_or_else(|| {
                AppError::NotFound(format!("Ticket request {}", ticket.ticket_request_id))
            })?;
        request.status = TicketRequestStatus::Completed;
        request.completed_at = Some(now);
        let request = request.clone();

        state.processed.insert(ticket.id, ticket.clone());

        let performance = state
            .performance
            .get_mut(&ticket.agent_id)
            .ok_or(AppError::AgentNotEligible)?;
        performance.total_requests_completed += 1;
        performance.updated_at = now;

        Ok(CompletionRecord {
            request,
            ticket: ticket.clone(),
            total_completed: performance.total_requests_completed,
        })
    }

    async fn expire_request(
        &self,
        request_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<TicketRequest>, AppError> {
        let mut state = self.state.lock();
        match state.requests.get_mut(&request_id) {
            Some(request) if request.is_due_for_expiry(now) => {
                request.status = TicketRequestStatus::Expired;
                Ok(Some(request.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn expire_due_requests(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let mut state = self.state.lock();
        let mut expired = 0;
        for request in state.requests.values_mut() {
            if request.is_due_for_expiry(now) {
                request.status = TicketRequestStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn get_processed_ticket(
        &self,
        ticket_id: Uuid,
    ) -> Result<Option<ProcessedTicket>, AppError> {
        Ok(self.state.lock().processed.get(&ticket_id).cloned())
    }

    async fn review_processed_ticket(
        &self,
        ticket_id: Uuid,
        outcome: ReceiptVerificationStatus,
        reviewer: &str,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<ProcessedTicket>, AppError> {
        let mut state = self.state.lock();
        match state.processed.get_mut(&ticket_id) {
            Some(ticket) if ticket.receipt_verification_status.can_transition_to(outcome) => {
                ticket.receipt_verification_status = outcome;
                ticket.verified_by = Some(reviewer.to_string());
                ticket.verified_at = Some(now);
                ticket.rejection_reason = reason.map(str::to_string);
                Ok(Some(ticket.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn get_performance(&self, agent_id: Uuid) -> Result<Option<PerformanceTier>, AppError> {
        Ok(self.state.lock().performance.get(&agent_id).cloned())
    }

    async fn upgrade_tier(
        &self,
        agent_id: Uuid,
        tier: Tier,
        cost_per_request: &BigDecimal,
        bonus_percentage: &BigDecimal,
        now: DateTime<Utc>,
    ) -> Result<Option<PerformanceTier>, AppError> {
        let mut state = self.state.lock();
        match state.performance.get_mut(&agent_id) {
            Some(performance) if performance.tier < tier => {
                performance.tier = tier;
                performance.cost_per_request = cost_per_request.clone();
                performance.bonus_percentage = bonus_percentage.clone();
                performance.updated_at = now;
                Ok(Some(performance.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn insert_bonus(&self, bonus: &Bonus) -> Result<bool, AppError> {
        let mut state = self.state.lock();
        if let Some(ref key) = bonus.dedupe_key {
            if state
                .bonuses
                .values()
                .any(|b| b.dedupe_key.as_ref() == Some(key))
            {
                return Ok(false);
            }
        }
        state.bonuses.insert(bonus.id, bonus.clone());
        Ok(true)
    }

    async fn list_bonuses(&self, agent_id: Uuid) -> Result<Vec<Bonus>, AppError> {
        let state = self.state.lock();
        let mut bonuses: Vec<Bonus> = state
            .bonuses
            .values()
            .filter(|b| b.agent_id == agent_id)
            .cloned()
            .collect();
        bonuses.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(bonuses)
    }

    async fn claim_bonus(
        &self,
        agent_id: Uuid,
        bonus_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(Bonus, FloatTransaction), AppError> {
        let mut state = self.state.lock();
        let bonus = state
            .bonuses
            .get(&bonus_id)
            .filter(|b| b.agent_id == agent_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Bonus {}", bonus_id)))?;
        if bonus.claimed {
            return Err(AppError::AlreadyClaimedBonus);
        }
        if bonus.is_expired(now) {
            return Err(AppError::BonusExpired);
        }
        state.require_credit_account(agent_id)?;

        let transaction = FloatTransaction::completed(
            agent_id,
            TransactionType::Bonus,
            bonus.amount.clone(),
            0,
            Some(format!("bonus:{}", bonus_id)),
            now,
        );
        state.apply_credit(&transaction, now)?;
        state.transactions.push(transaction.clone());

        let stored = state
            .bonuses
            .get_mut(&bonus_id)
            .ok_or_else(|| AppError::NotFound(format!("Bonus {}", bonus_id)))?;
        stored.claimed = true;
        stored.claimed_at = Some(now);
        Ok((stored.clone(), transaction))
    }

    async fn credit_referral(
        &self,
        referral: &Referral,
    ) -> Result<(FloatTransaction, FloatTransaction), AppError> {
        let mut state = self.state.lock();
        // One referral per recruit, and none back along an existing link
        let linked = state.referrals.iter().any(|r| {
            r.referred_id == referral.referred_id
                || (r.referrer_id == referral.referred_id && r.referred_id == referral.referrer_id)
        });
        if linked {
            return Err(AppError::ReferralExists);
        }
        state.require_credit_account(referral.referrer_id)?;
        state.require_credit_account(referral.referred_id)?;

        let now = referral.credited_at.unwrap_or(referral.created_at);
        let reference = Some(format!("referral:{}", referral.id));
        let referrer_tx = FloatTransaction::completed(
            referral.referrer_id,
            TransactionType::Referral,
            referral.referrer_amount.clone(),
            0,
            reference.clone(),
            now,
        );
        let referred_tx = FloatTransaction::completed(
            referral.referred_id,
            TransactionType::Referral,
            referral.referred_amount.clone(),
            0,
            reference,
            now,
        );
        state.apply_credit(&referrer_tx, now)?;
        state.apply_credit(&referred_tx, now)?;
        state.transactions.push(referrer_tx.clone());
        state.transactions.push(referred_tx.clone());
        state.referrals.push(referral.clone());
        Ok((referrer_tx, referred_tx))
    }

    async fn insert_booking(&self, booking: &Booking) -> Result<(), AppError> {
        self.state
            .lock()
            .bookings
            .insert(booking.id, booking.clone());
        Ok(())
    }

    async fn get_booking(&self, booking_id: Uuid) -> Result<Option<Booking>, AppError> {
        Ok(self.state.lock().bookings.get(&booking_id).cloned())
    }

    async fn assign_booking(&self, offer: &AssignmentOffer) -> Result<Booking, AppError> {
        let mut state = self.state.lock();
        let eligible = state
            .agents
            .get(&offer.agent_id)
            .map(Agent::is_eligible)
            .unwrap_or(false);
        if !eligible {
            return Err(AppError::AgentNotEligible);
        }
        let booking = state
            .bookings
            .get_mut(&offer.booking_id)
            .ok_or_else(|| AppError::NotFound(format!("Booking {}", offer.booking_id)))?;
        if booking.status != BookingStatus::Confirmed {
            return Err(AppError::InvalidTransition(format!(
                "booking is {}, only confirmed bookings can be assigned",
                booking.status
            )));
        }
        if !AssignmentStatus::can_transition(booking.assignment_status, AssignmentStatus::Pending)
        {
            return Err(AppError::Conflict(format!(
                "booking assignment is already {}",
                booking
                    .assignment_status
                    .map(|s| s.as_str())
                    .unwrap_or("none")
            )));
        }

        booking.assigned_agent_id = Some(offer.agent_id);
        booking.assignment_status = Some(AssignmentStatus::Pending);
        booking.assignment_response_deadline = Some(offer.deadline);
        booking.assigned_at = Some(offer.at);
        booking.assigned_by = Some(offer.assigned_by.clone());
        booking.updated_at = offer.at;
        let booking = booking.clone();

        state.push_history(
            offer.booking_id,
            offer.agent_id,
            AssignmentAction::Assigned,
            &offer.assigned_by,
            Some(format!("deadline {}", offer.deadline.to_rfc3339())),
            offer.at,
        );
        Ok(booking)
    }

    async fn respond_assignment(
        &self,
        booking_id: Uuid,
        agent_id: Uuid,
        accept: bool,
        now: DateTime<Utc>,
    ) -> Result<Booking, AppError> {
        let mut state = self.state.lock();
        let booking = state
            .bookings
            .get_mut(&booking_id)
            .filter(|b| b.assigned_agent_id == Some(agent_id))
            .ok_or_else(|| {
                AppError::NotFound(format!("Booking {} is not assigned to this agent", booking_id))
            })?;
        if booking.assignment_status != Some(AssignmentStatus::Pending) {
            return Err(AppError::InvalidTransition(format!(
                "assignment is {}",
                booking
                    .assignment_status
                    .map(|s| s.as_str())
                    .unwrap_or("none")
            )));
        }
        if booking.is_response_overdue(now) {
            return Err(AppError::AssignmentExpired);
        }

        let (status, action) = if accept {
            (AssignmentStatus::Accepted, AssignmentAction::Accepted)
        } else {
            (AssignmentStatus::Rejected, AssignmentAction::Rejected)
        };
        booking.assignment_status = Some(status);
        booking.updated_at = now;
        if !accept {
            booking.escalated = true;
            booking.escalated_at = Some(now);
        }
        let booking = booking.clone();

        let actor = agent_id.to_string();
        state.push_history(booking_id, agent_id, action, &actor, None, now);
        if !accept {
            state.push_history(
                booking_id,
                agent_id,
                AssignmentAction::Escalated,
                "system",
                Some("rejected by agent".to_string()),
                now,
            );
        }
        Ok(booking)
    }

    async fn expire_assignment(
        &self,
        booking_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Booking>, AppError> {
        let mut state = self.state.lock();
        let Some(booking) = state.bookings.get_mut(&booking_id) else {
            return Ok(None);
        };
        if !booking.is_response_overdue(now) {
            return Ok(None);
        }
        let Some(agent_id) = booking.assigned_agent_id else {
            return Ok(None);
        };

        booking.assignment_status = Some(AssignmentStatus::Expired);
        booking.escalated = true;
        booking.escalated_at = Some(now);
        booking.updated_at = now;
        let booking = booking.clone();

        state.push_history(booking_id, agent_id, AssignmentAction::Expired, "system", None, now);
        state.push_history(
            booking_id,
            agent_id,
            AssignmentAction::Escalated,
            "system",
            Some("response deadline elapsed".to_string()),
            now,
        );
        Ok(Some(booking))
    }

    async fn list_overdue_assignments(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, AppError> {
        let state = self.state.lock();
        Ok(state
            .bookings
            .values()
            .filter(|b| b.is_response_overdue(now))
            .map(|b| b.id)
            .collect())
    }

    async fn list_agent_assignments(&self, agent_id: Uuid) -> Result<Vec<Booking>, AppError> {
        let state = self.state.lock();
        let mut bookings: Vec<Booking> = state
            .bookings
            .values()
            .filter(|b| b.assigned_agent_id == Some(agent_id))
            .cloned()
            .collect();
        bookings.sort_by(|a, b| b.assigned_at.cmp(&a.assigned_at));
        Ok(bookings)
    }

    async fn assignment_history(
        &self,
        booking_id: Uuid,
    ) -> Result<Vec<AssignmentHistory>, AppError> {
        let state = self.state.lock();
        Ok(state
            .history
            .iter()
            .filter(|h| h.booking_id == booking_id)
            .cloned()
            .collect())
    }
}
