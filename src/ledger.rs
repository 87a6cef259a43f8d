//! Float balance and daily quota.
//!
//! The ledger never debits on its own. `reserve` validates and hands back a
//! [`Charge`] that a gated store operation commits together with the action
//! it pays for. Credits go straight to the store as one atomic unit.

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::AppError;
use crate::events::{CoreEvent, EventPublisher};
use crate::models::*;
use crate::store::{Charge, FloatStore, Reconciliation};

/// Runs `op`, and runs it once more if the store reported a lost race.
/// A second conflict is replaced by `exhausted`.
pub async fn retry_once_on_conflict<T, F, Fut>(
    label: &str,
    exhausted: AppError,
    mut op: F,
) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    match op().await {
        Err(e) if matches!(e.root(), AppError::Conflict(_)) => {
            tracing::debug!("{} lost a storage race ({}), retrying once", label, e);
            match op().await {
                Err(e) if matches!(e.root(), AppError::Conflict(_)) => {
                    tracing::warn!("{} conflicted twice: {}", label, e);
                    Err(exhausted)
                }
                other => other,
            }
        }
        other => other,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceSnapshot {
    pub agent_id: Uuid,
    pub balance: BigDecimal,
    pub quota_remaining: i32,
    pub quota_limit: i32,
    pub last_quota_reset: NaiveDate,
}

impl From<&FloatAccount> for BalanceSnapshot {
    fn from(account: &FloatAccount) -> Self {
        Self {
            agent_id: account.agent_id,
            balance: account.current_balance.clone(),
            quota_remaining: account.daily_quota_remaining,
            quota_limit: account.daily_quota_limit,
            last_quota_reset: account.last_quota_reset,
        }
    }
}

#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn FloatStore>,
    events: EventPublisher,
}

impl Ledger {
    pub fn new(store: Arc<dyn FloatStore>, events: EventPublisher) -> Self {
        Self { store, events }
    }

    /// The agent, if approved.
    pub async fn ensure_eligible(&self, agent_id: Uuid) -> Result<Agent, AppError> {
        let agent = self
            .store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Agent {}", agent_id)))?;
        if !agent.is_eligible() {
            tracing::debug!("Agent {} is {}, not eligible", agent_id, agent.status);
            return Err(AppError::AgentNotEligible);
        }
        Ok(agent)
    }

    /// Loads the account, refilling quota first if the agent's day has rolled over.
    pub async fn account(&self, agent_id: Uuid, now: DateTime<Utc>) -> Result<FloatAccount, AppError> {
        let account = self
            .store
            .get_account(agent_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Float account for {}", agent_id)))?;

        if !account.needs_quota_reset(now) {
            return Ok(account);
        }

        let today = account.today(now);
        match self.store.reset_daily_quota(agent_id, today, now).await? {
            Some(reset) => {
                tracing::info!(
                    "Daily quota reset for agent {} ({} -> {})",
                    agent_id,
                    account.last_quota_reset,
                    today
                );
                Ok(reset)
            }
            // Someone else reset it first
            None => self
                .store
                .get_account(agent_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Float account for {}", agent_id))),
        }
    }

    pub async fn get_balance(
        &self,
        agent_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<BalanceSnapshot, AppError> {
        self.ensure_eligible(agent_id).await?;
        let account = self.account(agent_id, now).await?;
        Ok(BalanceSnapshot::from(&account))
    }

    /// Eligibility plus lazy reset; the store's conditional debit does the
    /// funds and quota check when the charge is committed.
    pub async fn prepare_charge(
        &self,
        agent_id: Uuid,
        amount: BigDecimal,
        quota_cost: i32,
        reference: String,
        now: DateTime<Utc>,
    ) -> Result<(Charge, FloatAccount), AppError> {
        if amount < BigDecimal::from(0) || quota_cost < 0 {
            return Err(AppError::BadRequest(
                "Charge amount and quota cost cannot be negative".to_string(),
            ));
        }
        self.ensure_eligible(agent_id).await?;
        let account = self.account(agent_id, now).await?;
        Ok((
            Charge {
                agent_id,
                amount,
                quota_cost,
                reference,
            },
            account,
        ))
    }

    /// Validates that the agent can pay `amount` and `quota_cost` right now.
    pub async fn reserve(
        &self,
        agent_id: Uuid,
        amount: BigDecimal,
        quota_cost: i32,
        reference: String,
        now: DateTime<Utc>,
    ) -> Result<Charge, AppError> {
        let (charge, account) = self
            .prepare_charge(agent_id, amount, quota_cost, reference, now)
            .await?;
        if account.current_balance < charge.amount {
            return Err(AppError::InsufficientFunds);
        }
        if account.daily_quota_remaining < charge.quota_cost {
            return Err(AppError::QuotaExhausted);
        }
        Ok(charge)
    }

    /// Appends a completed credit and applies it in one store operation.
    pub async fn credit(
        &self,
        agent_id: Uuid,
        transaction_type: TransactionType,
        amount: BigDecimal,
        quota_delta: i32,
        reference: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<FloatTransaction, AppError> {
        if amount < BigDecimal::from(0) || quota_delta < 0 {
            return Err(AppError::BadRequest(
                "Credits must be non-negative".to_string(),
            ));
        }
        let transaction = FloatTransaction::completed(
            agent_id,
            transaction_type,
            amount,
            quota_delta,
            reference,
            now,
        );
        let account = self.store.post_credit(&transaction).await?;
        tracing::info!(
            "Credited {} ZMW ({}) to agent {}, balance now {}",
            transaction.amount_zmw,
            transaction_type,
            agent_id,
            account.current_balance
        );
        Ok(transaction)
    }

    /// Records a purchase awaiting payment confirmation.
    pub async fn begin_purchase(
        &self,
        agent_id: Uuid,
        amount: BigDecimal,
        requests: i32,
        reference: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<FloatTransaction, AppError> {
        if amount <= BigDecimal::from(0) || requests < 0 {
            return Err(AppError::BadRequest(
                "Purchase amount must be positive".to_string(),
            ));
        }
        let transaction = FloatTransaction::pending(
            agent_id,
            TransactionType::Purchase,
            amount,
            requests,
            reference,
            now,
        );
        self.store.insert_pending_transaction(&transaction).await?;
        tracing::info!(
            "Pending purchase {} of {} ZMW for agent {}",
            transaction.id,
            transaction.amount_zmw,
            agent_id
        );
        Ok(transaction)
    }

    /// Settles a pending purchase. Repeated confirmations return the settled
    /// transaction without crediting again.
    pub async fn settle_purchase(
        &self,
        transaction_id: Uuid,
        succeeded: bool,
        now: DateTime<Utc>,
    ) -> Result<FloatTransaction, AppError> {
        let existing = self
            .store
            .get_transaction(transaction_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Transaction {}", transaction_id)))?;
        if existing.transaction_type != TransactionType::Purchase {
            return Err(AppError::BadRequest(format!(
                "Transaction {} is a {}, not a purchase",
                transaction_id, existing.transaction_type
            )));
        }
        if existing.status != TransactionStatus::Pending {
            tracing::info!(
                "Purchase {} already {}, ignoring repeated confirmation",
                transaction_id,
                existing.status
            );
            return Ok(existing);
        }

        let outcome = if succeeded {
            TransactionStatus::Completed
        } else {
            TransactionStatus::Failed
        };
        match self
            .store
            .settle_transaction(transaction_id, outcome, now)
            .await?
        {
            Some(settled) => {
                tracing::info!("Purchase {} settled as {}", transaction_id, settled.status);
                self.events.emit(CoreEvent::PurchaseSettled {
                    agent_id: settled.agent_id,
                    transaction_id,
                    status: settled.status,
                });
                Ok(settled)
            }
            // A concurrent confirmation won
            None => self
                .store
                .get_transaction(transaction_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Transaction {}", transaction_id))),
        }
    }

    pub async fn transactions(
        &self,
        agent_id: Uuid,
        limit: i64,
    ) -> Result<Vec<FloatTransaction>, AppError> {
        self.ensure_eligible(agent_id).await?;
        self.store
            .list_transactions(agent_id, limit.clamp(1, 500))
            .await
    }

    pub async fn reconcile(
        &self,
        agent_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Reconciliation, AppError> {
        let report = self
            .store
            .reconcile_balance(agent_id, now)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Float account for {}", agent_id)))?;
        if report.corrected {
            tracing::warn!(
                "Balance drift for agent {}: recorded {} vs derived {} (drift {})",
                agent_id,
                report.recorded_balance,
                report.derived_balance,
                report.drift
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retry_runs_twice_then_reports_domain_error() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), AppError> =
            retry_once_on_conflict("test", AppError::AlreadyClaimed, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AppError::Conflict("race".into())) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(result, Err(AppError::AlreadyClaimed)));
    }

    #[tokio::test]
    async fn retry_passes_domain_errors_through_untouched() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), AppError> =
            retry_once_on_conflict("test", AppError::AlreadyClaimed, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AppError::InsufficientFunds) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(AppError::InsufficientFunds)));
    }
}
