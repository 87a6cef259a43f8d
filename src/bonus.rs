//! Claimable bonuses and referral credits.
//!
//! Every bonus credits the ledger at most once; tier bonuses are keyed per
//! agent and tier so a repeated upgrade cannot issue a second one.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::FloatConfig;
use crate::errors::AppError;
use crate::events::{CoreEvent, EventPublisher};
use crate::ledger::{retry_once_on_conflict, Ledger};
use crate::models::*;
use crate::store::FloatStore;

#[derive(Debug, Clone, Serialize)]
pub struct ReferralCredit {
    pub referral: Referral,
    pub referrer_transaction: FloatTransaction,
    pub referred_transaction: FloatTransaction,
}

/// One-shot credits: claimable bonuses and referral payouts.
#[derive(Clone)]
pub struct BonusEngine {
    store: Arc<dyn FloatStore>,
    ledger: Ledger,
    events: EventPublisher,
    config: FloatConfig,
}

impl BonusEngine {
    pub fn new(
        store: Arc<dyn FloatStore>,
        ledger: Ledger,
        events: EventPublisher,
        config: FloatConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            events,
            config,
        }
    }

    pub async fn list(&self, agent_id: Uuid) -> Result<Vec<Bonus>, AppError> {
        self.store.list_bonuses(agent_id).await
    }

    /// Marks the bonus claimed and credits it in one store operation.
    pub async fn claim(
        &self,
        agent_id: Uuid,
        bonus_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(Bonus, FloatTransaction), AppError> {
        self.ledger.ensure_eligible(agent_id).await?;
        let (bonus, transaction) =
            retry_once_on_conflict("claim_bonus", AppError::AlreadyClaimedBonus, || {
                self.store.claim_bonus(agent_id, bonus_id, now)
            })
            .await?;

        tracing::info!(
            "Agent {} claimed {} bonus {} worth {}",
            agent_id,
            bonus.bonus_type,
            bonus_id,
            bonus.amount
        );
        self.events.emit(CoreEvent::BonusCredited {
            agent_id,
            bonus_type: bonus.bonus_type,
            amount: bonus.amount.clone(),
            transaction_id: Some(transaction.id),
        });
        Ok((bonus, transaction))
    }

    /// Admin-issued promotional credit, claimable by the agent.
    pub async fn grant_promotional(
        &self,
        agent_id: Uuid,
        amount: BigDecimal,
        description: Option<String>,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Bonus, AppError> {
        if amount <= BigDecimal::from(0) {
            return Err(AppError::BadRequest(
                "Bonus amount must be positive".to_string(),
            ));
        }
        if expires_at.map(|at| at <= now).unwrap_or(false) {
            return Err(AppError::BadRequest(
                "Bonus expiry must be in the future".to_string(),
            ));
        }
        self.store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Agent {}", agent_id)))?;

        let bonus = Bonus {
            id: Uuid::new_v4(),
            agent_id,
            bonus_type: BonusType::Promotional,
            amount,
            description,
            claimed: false,
            claimed_at: None,
            expires_at,
            dedupe_key: None,
            created_at: now,
        };
        self.store.insert_bonus(&bonus).await?;
        tracing::info!("Promotional bonus {} granted to agent {}", bonus.id, agent_id);
        Ok(bonus)
    }

    /// Issues the claimable bonus for reaching `tier`. At most one per
    /// (agent, tier); returns `None` if it was already issued.
    pub async fn issue_tier_upgrade(
        &self,
        agent_id: Uuid,
        tier: Tier,
        amount: BigDecimal,
        now: DateTime<Utc>,
    ) -> Result<Option<Bonus>, AppError> {
        let bonus = Bonus {
            id: Uuid::new_v4(),
            agent_id,
            bonus_type: BonusType::TierUpgrade,
            amount,
            description: Some(format!("Reached {} tier", tier)),
            claimed: false,
            claimed_at: None,
            expires_at: Some(now + Duration::days(self.config.tier_bonus_validity_days)),
            dedupe_key: Some(format!("tier_upgrade:{}:{}", agent_id, tier)),
            created_at: now,
        };
        if self.store.insert_bonus(&bonus).await? {
            Ok(Some(bonus))
        } else {
            tracing::debug!("Tier bonus for {} at {} already issued", agent_id, tier);
            Ok(None)
        }
    }

    /// Links two approved agents and credits both in one store operation.
    pub async fn credit_referral(
        &self,
        referrer_id: Uuid,
        referred_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReferralCredit, AppError> {
        if referrer_id == referred_id {
            return Err(AppError::BadRequest(
                "An agent cannot refer themselves".to_string(),
            ));
        }
        self.ledger.ensure_eligible(referrer_id).await?;
        self.ledger.ensure_eligible(referred_id).await?;

        let referral = Referral {
            id: Uuid::new_v4(),
            referrer_id,
            referred_id,
            status: ReferralStatus::Credited,
            referrer_amount: self.config.referrer_bonus.clone(),
            referred_amount: self.config.referred_bonus.clone(),
            created_at: now,
            credited_at: Some(now),
        };
        let (referrer_transaction, referred_transaction) =
            retry_once_on_conflict("credit_referral", AppError::ReferralExists, || {
                self.store.credit_referral(&referral)
            })
            .await?;

        tracing::info!(
            "Referral {} credited: {} referred {}",
            referral.id,
            referrer_id,
            referred_id
        );
        for transaction in [&referrer_transaction, &referred_transaction] {
            self.events.emit(CoreEvent::BonusCredited {
                agent_id: transaction.agent_id,
                bonus_type: BonusType::Referral,
                amount: transaction.amount_zmw.clone(),
                transaction_id: Some(transaction.id),
            });
        }

        Ok(ReferralCredit {
            referral,
            referrer_transaction,
            referred_transaction,
        })
    }
}
