//! Tier derivation from completed-request counts.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::bonus::BonusEngine;
use crate::errors::AppError;
use crate::events::{CoreEvent, EventPublisher};
use crate::models::{PerformanceTier, Tier};
use crate::store::FloatStore;

fn zmw(cents: i64) -> BigDecimal {
    BigDecimal::new(cents.into(), 2)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierSpec {
    pub tier: Tier,
    /// Completed requests needed to enter the tier.
    pub threshold: i32,
    pub cost_per_request: BigDecimal,
    pub bonus_percentage: BigDecimal,
    /// Claimable bonus issued on reaching the tier.
    pub upgrade_bonus: Option<BigDecimal>,
}

#[derive(Debug, Clone)]
pub struct TierTable {
    specs: Vec<TierSpec>,
}

impl TierTable {
    pub fn standard() -> Self {
        Self {
            specs: vec![
                TierSpec {
                    tier: Tier::Bronze,
                    threshold: 0,
                    cost_per_request: zmw(200),
                    bonus_percentage: zmw(0),
                    upgrade_bonus: None,
                },
                TierSpec {
                    tier: Tier::Silver,
                    threshold: 50,
                    cost_per_request: zmw(150),
                    bonus_percentage: zmw(500),
                    upgrade_bonus: Some(zmw(1000)),
                },
                TierSpec {
                    tier: Tier::Gold,
                    threshold: 200,
                    cost_per_request: zmw(125),
                    bonus_percentage: zmw(1000),
                    upgrade_bonus: Some(zmw(2500)),
                },
                TierSpec {
                    tier: Tier::Platinum,
                    threshold: 500,
                    cost_per_request: zmw(100),
                    bonus_percentage: zmw(1500),
                    upgrade_bonus: Some(zmw(5000)),
                },
            ],
        }
    }

    /// Highest tier whose threshold `completed` meets.
    pub fn tier_for(&self, completed: i32) -> &TierSpec {
        self.specs
            .iter()
            .rev()
            .find(|spec| completed >= spec.threshold)
            .unwrap_or(&self.specs[0])
    }

    pub fn spec(&self, tier: Tier) -> &TierSpec {
        self.specs
            .iter()
            .find(|spec| spec.tier == tier)
            .unwrap_or(&self.specs[0])
    }

    /// The row every newly approved agent starts with.
    pub fn opening(&self, agent_id: Uuid, now: DateTime<Utc>) -> PerformanceTier {
        let base = &self.specs[0];
        PerformanceTier {
            agent_id,
            tier: base.tier,
            total_requests_completed: 0,
            cost_per_request: base.cost_per_request.clone(),
            bonus_percentage: base.bonus_percentage.clone(),
            updated_at: now,
        }
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Clone)]
pub struct PerformanceEngine {
    store: Arc<dyn FloatStore>,
    table: TierTable,
    bonuses: BonusEngine,
    events: EventPublisher,
}

impl PerformanceEngine {
    pub fn new(
        store: Arc<dyn FloatStore>,
        table: TierTable,
        bonuses: BonusEngine,
        events: EventPublisher,
    ) -> Self {
        Self {
            store,
            table,
            bonuses,
            events,
        }
    }

    pub async fn get(&self, agent_id: Uuid) -> Result<PerformanceTier, AppError> {
        self.store
            .get_performance(agent_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Performance record for {}", agent_id)))
    }

    /// Fee per request at the agent's current tier.
    pub async fn cost_per_request(&self, agent_id: Uuid) -> Result<BigDecimal, AppError> {
        Ok(match self.store.get_performance(agent_id).await? {
            Some(performance) => performance.cost_per_request,
            None => self.table.spec(Tier::Bronze).cost_per_request.clone(),
        })
    }

    /// Re-derives the tier after a completion. Only ever moves up; calling
    /// it twice with the same count is a no-op.
    pub async fn apply_completion(
        &self,
        agent_id: Uuid,
        total_completed: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<PerformanceTier>, AppError> {
        let target = self.table.tier_for(total_completed);
        let current = self.get(agent_id).await?;
        if target.tier <= current.tier {
            return Ok(None);
        }

        let Some(upgraded) = self
            .store
            .upgrade_tier(
                agent_id,
                target.tier,
                &target.cost_per_request,
                &target.bonus_percentage,
                now,
            )
            .await?
        else {
            return Ok(None);
        };

        tracing::info!(
            "Agent {} upgraded {} -> {} at {} completed requests",
            agent_id,
            current.tier,
            upgraded.tier,
            total_completed
        );
        self.events.emit(CoreEvent::TierUpgraded {
            agent_id,
            from: current.tier,
            to: upgraded.tier,
        });

        if let Some(ref amount) = target.upgrade_bonus {
            if let Err(e) = self
                .bonuses
                .issue_tier_upgrade(agent_id, upgraded.tier, amount.clone(), now)
                .await
            {
                tracing::error!("Failed to issue {} bonus to {}: {}", upgraded.tier, agent_id, e);
            }
        }
        Ok(Some(upgraded))
    }
}
