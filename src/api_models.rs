//! Request and response bodies for the HTTP surface.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bonus::ReferralCredit;
use crate::models::*;
use crate::store::{ClaimRecord, CompletionRecord, ViewRecord};

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmPhoneRequest {
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    pub amount_zmw: BigDecimal,
    /// Quota the purchase adds once settled.
    #[serde(default)]
    pub requests: i32,
    pub reference: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReviewRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReceiptReviewRequest {
    pub approve: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NewBookingRequest {
    pub booking_reference: String,
    #[serde(default = "confirmed")]
    pub status: BookingStatus,
}

fn confirmed() -> BookingStatus {
    BookingStatus::Confirmed
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub agent_id: Uuid,
    pub timeout_minutes: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AssignmentResponseRequest {
    pub accept: bool,
}

#[derive(Debug, Deserialize)]
pub struct PromotionalBonusRequest {
    pub amount_zmw: BigDecimal,
    pub description: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct ReferralRequest {
    pub referrer_id: Uuid,
    pub referred_id: Uuid,
}

/// Full request, contact details included, once the agent has paid to view.
#[derive(Debug, Serialize)]
pub struct ViewResponse {
    pub request: TicketRequest,
    pub viewed_at: DateTime<Utc>,
    pub charged: bool,
    pub transaction: Option<FloatTransaction>,
}

impl From<ViewRecord> for ViewResponse {
    fn from(record: ViewRecord) -> Self {
        Self {
            request: record.request,
            viewed_at: record.view.viewed_at,
            charged: record.newly_charged,
            transaction: record.transaction,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ClaimResponse {
    pub request: TicketRequest,
    pub transaction: Option<FloatTransaction>,
}

impl From<ClaimRecord> for ClaimResponse {
    fn from(record: ClaimRecord) -> Self {
        Self {
            request: record.request,
            transaction: record.transaction,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CompletionResponse {
    pub request: TicketRequest,
    pub ticket: ProcessedTicket,
    pub total_completed: i32,
}

impl From<CompletionRecord> for CompletionResponse {
    fn from(record: CompletionRecord) -> Self {
        Self {
            request: record.request,
            ticket: record.ticket,
            total_completed: record.total_completed,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BonusClaimResponse {
    pub bonus: Bonus,
    pub transaction: FloatTransaction,
}

#[derive(Debug, Serialize)]
pub struct ReferralResponse {
    pub referral: Referral,
    pub referrer_transaction: FloatTransaction,
    pub referred_transaction: FloatTransaction,
}

impl From<ReferralCredit> for ReferralResponse {
    fn from(credit: ReferralCredit) -> Self {
        Self {
            referral: credit.referral,
            referrer_transaction: credit.referrer_transaction,
            referred_transaction: credit.referred_transaction,
        }
    }
}
