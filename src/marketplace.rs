//! Pay-to-view, then claim, then complete.
//!
//! Request-state checks always run before ledger checks so an agent racing
//! for a taken request hears `AlreadyClaimed`, not `InsufficientFunds`.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::FloatConfig;
use crate::errors::AppError;
use crate::events::{CoreEvent, EventPublisher};
use crate::ledger::{retry_once_on_conflict, Ledger};
use crate::models::*;
use crate::performance::PerformanceEngine;
use crate::store::{ClaimRecord, CompletionRecord, FloatStore, ViewRecord};

/// What agents see before paying: no contact details.
#[derive(Debug, Clone, Serialize)]
pub struct RequestListing {
    pub id: Uuid,
    pub origin: String,
    pub destination: String,
    pub travel_date: NaiveDate,
    pub passenger_count: i32,
    pub request_expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl From<&TicketRequest> for RequestListing {
    fn from(request: &TicketRequest) -> Self {
        Self {
            id: request.id,
            origin: request.origin.clone(),
            destination: request.destination.clone(),
            travel_date: request.travel_date,
            passenger_count: request.passenger_count,
            request_expires_at: request.request_expires_at,
            created_at: request.created_at,
        }
    }
}

/// Customer intake payload.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTicketRequest {
    pub origin: String,
    pub destination: String,
    pub travel_date: NaiveDate,
    pub passenger_count: i32,
    #[serde(default)]
    pub passenger_names: Vec<String>,
    pub contact_name: String,
    pub contact_phone: String,
    pub contact_email: Option<String>,
    pub request_expires_at: Option<DateTime<Utc>>,
}

/// Proof-of-sale uploaded on completion.
#[derive(Debug, Clone, Deserialize)]
pub struct ReceiptUpload {
    pub receipt_url: String,
    pub ticket_number: Option<String>,
    pub amount_paid: Option<BigDecimal>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Clone)]
pub struct Marketplace {
    store: Arc<dyn FloatStore>,
    ledger: Ledger,
    performance: PerformanceEngine,
    events: EventPublisher,
    config: FloatConfig,
}

impl Marketplace {
    pub fn new(
        store: Arc<dyn FloatStore>,
        ledger: Ledger,
        performance: PerformanceEngine,
        events: EventPublisher,
        config: FloatConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            performance,
            events,
            config,
        }
    }

    pub async fn submit_request(
        &self,
        input: NewTicketRequest,
        now: DateTime<Utc>,
    ) -> Result<TicketRequest, AppError> {
        if input.passenger_count < 1 {
            return Err(AppError::BadRequest(
                "passenger_count must be at least 1".to_string(),
            ));
        }
        let expires_at = input
            .request_expires_at
            .unwrap_or_else(|| now + Duration::hours(self.config.request_ttl_hours));
        if expires_at <= now {
            return Err(AppError::BadRequest(
                "request_expires_at must be in the future".to_string(),
            ));
        }

        let request = TicketRequest {
            id: Uuid::new_v4(),
            origin: input.origin,
            destination: input.destination,
            travel_date: input.travel_date,
            passenger_count: input.passenger_count,
            passenger_names: input.passenger_names,
            contact_name: input.contact_name,
            contact_phone: input.contact_phone,
            contact_email: input.contact_email,
            status: TicketRequestStatus::Open,
            agent_id: None,
            agent_claimed_at: None,
            request_expires_at: expires_at,
            completed_at: None,
            created_at: now,
        };
        self.store.insert_ticket_request(&request).await?;
        tracing::info!(
            "Ticket request {} submitted ({} -> {}, expires {})",
            request.id,
            request.origin,
            request.destination,
            request.request_expires_at
        );
        Ok(request)
    }

    pub async fn list_open(
        &self,
        agent_id: Uuid,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<RequestListing>, AppError> {
        self.ledger.ensure_eligible(agent_id).await?;
        let open = self
            .store
            .list_open_requests(now, limit.clamp(1, 200))
            .await?;
        Ok(open.iter().map(RequestListing::from).collect())
    }

    async fn fee(&self, agent_id: Uuid, charged: bool) -> Result<BigDecimal, AppError> {
        if charged {
            self.performance.cost_per_request(agent_id).await
        } else {
            Ok(BigDecimal::from(0))
        }
    }

    /// Moves a past-deadline request to `expired` and passes `err` on.
    async fn expire_lazily(&self, request_id: Uuid, err: AppError, now: DateTime<Utc>) -> AppError {
        if matches!(err.root(), AppError::RequestExpired) {
            match self.store.expire_request(request_id, now).await {
                Ok(Some(_)) => tracing::info!("Ticket request {} expired on access", request_id),
                Ok(None) => {}
                Err(e) => tracing::warn!("Lazy expiry of {} failed: {}", request_id, e),
            }
        }
        err
    }

    async fn require_available(
        &self,
        request_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<TicketRequest, AppError> {
        let request = self
            .store
            .get_ticket_request(request_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Ticket request {}", request_id)))?;
        match request.unavailable_reason(now) {
            Some(reason) => Err(self.expire_lazily(request_id, reason, now).await),
            None => Ok(request),
        }
    }

    /// Charges the view fee (once per agent and request) and reveals contact details.
    pub async fn view(
        &self,
        agent_id: Uuid,
        request_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ViewRecord, AppError> {
        self.require_available(request_id, now).await?;

        let fees = &self.config.fees;
        let amount = self.fee(agent_id, fees.charge_on_view).await?;
        // Repeat views are free, so the store's conditional debit decides funds.
        let (charge, _) = self
            .ledger
            .prepare_charge(
                agent_id,
                amount,
                fees.quota_on_view,
                format!("view:{}", request_id),
                now,
            )
            .await?;

        let result = retry_once_on_conflict("record_view", AppError::AlreadyClaimed, || {
            self.store.record_view(request_id, &charge, now)
        })
        .await;
        match result {
            Ok(record) => {
                if record.newly_charged {
                    tracing::info!("Agent {} viewed request {}", agent_id, request_id);
                }
                Ok(record)
            }
            Err(e) => Err(self.expire_lazily(request_id, e, now).await),
        }
    }

    /// Claims an open request for the agent. Exactly one concurrent claimer wins.
    pub async fn claim(
        &self,
        agent_id: Uuid,
        request_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ClaimRecord, AppError> {
        self.require_available(request_id, now).await?;

        let fees = &self.config.fees;
        let amount = self.fee(agent_id, fees.charge_on_claim).await?;
        let charge = self
            .ledger
            .reserve(
                agent_id,
                amount,
                fees.quota_on_claim,
                format!("claim:{}", request_id),
                now,
            )
            .await?;

        let result = retry_once_on_conflict("claim_request", AppError::AlreadyClaimed, || {
            self.store.claim_request(request_id, &charge, now)
        })
        .await;
        let record = match result {
            Ok(record) => record,
            Err(e) => return Err(self.expire_lazily(request_id, e, now).await),
        };

        tracing::info!("Agent {} claimed ticket request {}", agent_id, request_id);
        self.events.emit(CoreEvent::RequestClaimed {
            request_id,
            agent_id,
            claimed_at: now,
        });
        Ok(record)
    }

    /// Records the receipt, completes the request and re-derives the tier.
    pub async fn complete(
        &self,
        agent_id: Uuid,
        request_id: Uuid,
        receipt: ReceiptUpload,
        now: DateTime<Utc>,
    ) -> Result<CompletionRecord, AppError> {
        self.ledger.ensure_eligible(agent_id).await?;
        let parsed = url::Url::parse(&receipt.receipt_url)
            .map_err(|e| AppError::BadRequest(format!("receipt_url is not a valid URL: {}", e)))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(AppError::BadRequest(
                "receipt_url must use http or https".to_string(),
            ));
        }
        if let Some(ref amount) = receipt.amount_paid {
            if *amount < BigDecimal::from(0) {
                return Err(AppError::BadRequest(
                    "amount_paid cannot be negative".to_string(),
                ));
            }
        }

        let ticket = ProcessedTicket {
            id: Uuid::new_v4(),
            ticket_request_id: request_id,
            agent_id,
            receipt_url: receipt.receipt_url,
            ticket_number: receipt.ticket_number,
            amount_paid: receipt.amount_paid,
            metadata: if receipt.metadata.is_null() {
                serde_json::json!({})
            } else {
                receipt.metadata
            },
            receipt_verification_status: ReceiptVerificationStatus::Pending,
            verified_by: None,
            verified_at: None,
            rejection_reason: None,
            created_at: now,
        };

        let record = match self.store.complete_request(&ticket, now).await {
            Ok(record) => record,
            Err(e) => return Err(self.expire_lazily(request_id, e, now).await),
        };

        tracing::info!(
            "Agent {} completed request {} ({} total)",
            agent_id,
            request_id,
            record.total_completed
        );
        self.events.emit(CoreEvent::RequestCompleted {
            request_id,
            agent_id,
            processed_ticket_id: record.ticket.id,
            total_completed: record.total_completed,
        });

        // The completion is committed; a tier hiccup must not fail it.
        if let Err(e) = self
            .performance
            .apply_completion(agent_id, record.total_completed, now)
            .await
        {
            tracing::error!("Tier update after completion failed for {}: {}", agent_id, e);
        }
        Ok(record)
    }

    /// Admin review of an uploaded receipt.
    pub async fn verify_receipt(
        &self,
        ticket_id: Uuid,
        approve: bool,
        reviewer: &str,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ProcessedTicket, AppError> {
        let outcome = if approve {
            ReceiptVerificationStatus::Verified
        } else {
            ReceiptVerificationStatus::Rejected
        };
        if !approve && reason.map(str::trim).unwrap_or("").is_empty() {
            return Err(AppError::BadRequest(
                "A rejection reason is required".to_string(),
            ));
        }

        match self
            .store
            .review_processed_ticket(ticket_id, outcome, reviewer, reason, now)
            .await?
        {
            Some(ticket) => {
                tracing::info!("Receipt {} marked {} by {}", ticket_id, outcome, reviewer);
                Ok(ticket)
            }
            None => {
                let current = self
                    .store
                    .get_processed_ticket(ticket_id)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("Processed ticket {}", ticket_id)))?;
                Err(AppError::InvalidTransition(format!(
                    "receipt is already {}",
                    current.receipt_verification_status
                )))
            }
        }
    }

    /// Sweep: expires every non-terminal request past its deadline.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let expired = self.store.expire_due_requests(now).await?;
        if expired > 0 {
            tracing::info!("Expired {} stale ticket request(s)", expired);
        }
        Ok(expired)
    }
}
