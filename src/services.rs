//! Wires the float components over one store.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::agents::AgentDirectory;
use crate::assignment::AssignmentWorkflow;
use crate::bonus::BonusEngine;
use crate::config::FloatConfig;
use crate::errors::AppError;
use crate::events::EventPublisher;
use crate::ledger::Ledger;
use crate::marketplace::Marketplace;
use crate::otp_store::OtpStore;
use crate::performance::{PerformanceEngine, TierTable};
use crate::store::FloatStore;

/// Every service shares the same store and event publisher.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn FloatStore>,
    pub ledger: Ledger,
    pub bonuses: BonusEngine,
    pub performance: PerformanceEngine,
    pub marketplace: Marketplace,
    pub assignments: AssignmentWorkflow,
    pub agents: AgentDirectory,
    pub events: EventPublisher,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired_requests: u64,
    pub expired_assignments: usize,
}

impl Services {
    pub fn new(store: Arc<dyn FloatStore>, config: FloatConfig, events: EventPublisher) -> Self {
        let tiers = TierTable::standard();
        let ledger = Ledger::new(store.clone(), events.clone());
        let bonuses = BonusEngine::new(
            store.clone(),
            ledger.clone(),
            events.clone(),
            config.clone(),
        );
        let performance =
            PerformanceEngine::new(store.clone(), tiers.clone(), bonuses.clone(), events.clone());
        let marketplace = Marketplace::new(
            store.clone(),
            ledger.clone(),
            performance.clone(),
            events.clone(),
            config.clone(),
        );
        let assignments = AssignmentWorkflow::new(store.clone(), events.clone(), config.clone());
        let otp = OtpStore::new(Duration::from_secs(config.otp_ttl_secs));
        let agents = AgentDirectory::new(store.clone(), otp, tiers, events.clone(), config);

        Self {
            store,
            ledger,
            bonuses,
            performance,
            marketplace,
            assignments,
            agents,
            events,
        }
    }

    /// Applies every deadline that has passed. Reads already expire lazily,
    /// so this only keeps stored state tidy.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, AppError> {
        let expired_requests = self.marketplace.expire_stale(now).await?;
        let expired_assignments = self.assignments.expire_overdue(now).await?;
        if expired_requests > 0 || expired_assignments > 0 {
            tracing::info!(
                "Sweep expired {} request(s) and {} assignment(s)",
                expired_requests,
                expired_assignments
            );
        }
        Ok(SweepReport {
            expired_requests,
            expired_assignments,
        })
    }
}
