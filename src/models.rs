use bigdecimal::BigDecimal;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Returned when a stored status string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} value '{}'", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

/// Declares a closed status enum persisted as snake_case text.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

text_enum! {
    /// Agent lifecycle, driven by admin review.
    AgentStatus {
        PendingReview => "pending_review",
        Approved => "approved",
        Suspended => "suspended",
        Rejected => "rejected",
    }
}

impl AgentStatus {
    pub fn can_transition_to(&self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (self, next),
            (PendingReview, Approved)
                | (PendingReview, Rejected)
                | (Approved, Suspended)
                | (Suspended, Approved)
        )
    }

    /// Statuses from which `next` is reachable.
    pub fn sources_of(next: AgentStatus) -> Vec<AgentStatus> {
        [
            AgentStatus::PendingReview,
            AgentStatus::Approved,
            AgentStatus::Suspended,
            AgentStatus::Rejected,
        ]
        .into_iter()
        .filter(|s| s.can_transition_to(next))
        .collect()
    }
}

text_enum! {
    TransactionType {
        Purchase => "purchase",
        Usage => "usage",
        Refund => "refund",
        Bonus => "bonus",
        Referral => "referral",
    }
}

text_enum! {
    TransactionStatus {
        Pending => "pending",
        Completed => "completed",
        Failed => "failed",
    }
}

impl TransactionStatus {
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        matches!(
            (self, next),
            (TransactionStatus::Pending, TransactionStatus::Completed)
                | (TransactionStatus::Pending, TransactionStatus::Failed)
        )
    }
}

text_enum! {
    /// Marketplace lifecycle of a customer ticket request.
    TicketRequestStatus {
        Open => "open",
        ClaimedByAgent => "claimed_by_agent",
        Completed => "completed",
        Expired => "expired",
    }
}

impl TicketRequestStatus {
    pub fn can_transition_to(&self, next: TicketRequestStatus) -> bool {
        use TicketRequestStatus::*;
        matches!(
            (self, next),
            (Open, ClaimedByAgent) | (ClaimedByAgent, Completed) | (Open, Expired) | (ClaimedByAgent, Expired)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TicketRequestStatus::Completed | TicketRequestStatus::Expired
        )
    }
}

text_enum! {
    ReceiptVerificationStatus {
        Pending => "pending",
        Verified => "verified",
        Rejected => "rejected",
    }
}

impl ReceiptVerificationStatus {
    pub fn can_transition_to(&self, next: ReceiptVerificationStatus) -> bool {
        matches!(
            (self, next),
            (ReceiptVerificationStatus::Pending, ReceiptVerificationStatus::Verified)
                | (ReceiptVerificationStatus::Pending, ReceiptVerificationStatus::Rejected)
        )
    }
}

text_enum! {
    BookingStatus {
        Pending => "pending",
        Confirmed => "confirmed",
        Cancelled => "cancelled",
    }
}

text_enum! {
    /// Push-model assignment state stored on a confirmed booking.
    AssignmentStatus {
        Pending => "pending",
        Accepted => "accepted",
        Rejected => "rejected",
        Expired => "expired",
    }
}

impl AssignmentStatus {
    /// `None` is the "never assigned" state.
    pub fn can_transition(from: Option<AssignmentStatus>, to: AssignmentStatus) -> bool {
        use AssignmentStatus::*;
        match (from, to) {
            (None, Pending) => true,
            (Some(Rejected), Pending) | (Some(Expired), Pending) => true,
            (Some(Pending), Accepted) | (Some(Pending), Rejected) | (Some(Pending), Expired) => {
                true
            }
            _ => false,
        }
    }
}

text_enum! {
    AssignmentAction {
        Assigned => "assigned",
        Accepted => "accepted",
        Rejected => "rejected",
        Expired => "expired",
        Escalated => "escalated",
    }
}

text_enum! {
    /// Performance bracket; declaration order is rank order.
    Tier {
        Bronze => "bronze",
        Silver => "silver",
        Gold => "gold",
        Platinum => "platinum",
    }
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Bronze, Tier::Silver, Tier::Gold, Tier::Platinum];

    /// Tiers ranked strictly below this one.
    pub fn lower(&self) -> Vec<Tier> {
        Tier::ALL.into_iter().filter(|t| t < self).collect()
    }
}

text_enum! {
    BonusType {
        Welcome => "welcome",
        Referral => "referral",
        TierUpgrade => "tier_upgrade",
        Promotional => "promotional",
    }
}

text_enum! {
    ReferralStatus {
        Pending => "pending",
        Credited => "credited",
    }
}

/// Calendar day of `now` at a fixed UTC offset.
pub fn local_day(now: DateTime<Utc>, utc_offset_minutes: i32) -> NaiveDate {
    match FixedOffset::east_opt(utc_offset_minutes * 60) {
        Some(offset) => now.with_timezone(&offset).date_naive(),
        None => now.date_naive(),
    }
}

// ============ Agents ============

/// An independent sales agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    /// E.164 phone number.
    pub phone: String,
    pub full_name: String,
    /// National Registration Card number (`NNNNNN/NN/N`).
    pub nrc_number: String,
    pub business_name: Option<String>,
    pub phone_verified: bool,
    pub status: AgentStatus,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn is_eligible(&self) -> bool {
        self.status == AgentStatus::Approved
    }
}

// ============ Ledger ============

/// Prepaid balance and daily quota for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloatAccount {
    pub agent_id: Uuid,
    pub current_balance: BigDecimal,
    /// Opening balance granted at approval; not part of the transaction log.
    pub welcome_bonus: BigDecimal,
    pub daily_quota_remaining: i32,
    pub daily_quota_limit: i32,
    pub last_quota_reset: NaiveDate,
    pub utc_offset_minutes: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FloatAccount {
    pub fn open(
        agent_id: Uuid,
        welcome_bonus: BigDecimal,
        daily_quota_limit: i32,
        utc_offset_minutes: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            agent_id,
            current_balance: welcome_bonus.clone(),
            welcome_bonus,
            daily_quota_remaining: daily_quota_limit,
            daily_quota_limit,
            last_quota_reset: local_day(now, utc_offset_minutes),
            utc_offset_minutes,
            created_at: now,
            updated_at: now,
        }
    }

    /// The agent's calendar day at `now`.
    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        local_day(now, self.utc_offset_minutes)
    }

    pub fn needs_quota_reset(&self, now: DateTime<Utc>) -> bool {
        self.last_quota_reset < self.today(now)
    }
}

/// Immutable ledger entry. Only `status` ever changes (pending -> completed/failed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloatTransaction {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub transaction_type: TransactionType,
    /// Signed: debits are negative.
    pub amount_zmw: BigDecimal,
    /// Signed quota adjustment.
    pub requests_allocated: i32,
    pub status: TransactionStatus,
    pub reference: Option<String>,
    pub ticket_request_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl FloatTransaction {
    pub fn completed(
        agent_id: Uuid,
        transaction_type: TransactionType,
        amount_zmw: BigDecimal,
        requests_allocated: i32,
        reference: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            transaction_type,
            amount_zmw,
            requests_allocated,
            status: TransactionStatus::Completed,
            reference,
            ticket_request_id: None,
            created_at: now,
            completed_at: Some(now),
        }
    }

    pub fn pending(
        agent_id: Uuid,
        transaction_type: TransactionType,
        amount_zmw: BigDecimal,
        requests_allocated: i32,
        reference: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            status: TransactionStatus::Pending,
            completed_at: None,
            ..Self::completed(
                agent_id,
                transaction_type,
                amount_zmw,
                requests_allocated,
                reference,
                now,
            )
        }
    }

    pub fn for_request(mut self, ticket_request_id: Uuid) -> Self {
        self.ticket_request_id = Some(ticket_request_id);
        self
    }
}

// ============ Marketplace ============

/// A customer's travel request waiting for an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketRequest {
    pub id: Uuid,
    pub origin: String,
    pub destination: String,
    pub travel_date: NaiveDate,
    pub passenger_count: i32,
    pub passenger_names: Vec<String>,
    pub contact_name: String,
    pub contact_phone: String,
    pub contact_email: Option<String>,
    pub status: TicketRequestStatus,
    pub agent_id: Option<Uuid>,
    pub agent_claimed_at: Option<DateTime<Utc>>,
    pub request_expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TicketRequest {
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.request_expires_at <= now
    }

    /// Open and still inside its deadline.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == TicketRequestStatus::Open && !self.is_past_deadline(now)
    }

    /// Non-terminal but past its deadline.
    pub fn is_due_for_expiry(&self, now: DateTime<Utc>) -> bool {
        self.status.can_transition_to(TicketRequestStatus::Expired) && self.is_past_deadline(now)
    }

    /// Classifies why a claim/view against this request cannot proceed.
    pub fn unavailable_reason(&self, now: DateTime<Utc>) -> Option<crate::errors::AppError> {
        use crate::errors::AppError;
        match self.status {
            TicketRequestStatus::Expired => Some(AppError::RequestExpired),
            TicketRequestStatus::ClaimedByAgent | TicketRequestStatus::Completed => {
                Some(AppError::AlreadyClaimed)
            }
            TicketRequestStatus::Open if self.is_past_deadline(now) => {
                Some(AppError::RequestExpired)
            }
            TicketRequestStatus::Open => None,
        }
    }
}

/// An agent paid to see a request's contact details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestView {
    pub agent_id: Uuid,
    pub ticket_request_id: Uuid,
    pub transaction_id: Option<Uuid>,
    pub viewed_at: DateTime<Utc>,
}

/// Proof-of-sale uploaded by the claiming agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedTicket {
    pub id: Uuid,
    pub ticket_request_id: Uuid,
    pub agent_id: Uuid,
    pub receipt_url: String,
    pub ticket_number: Option<String>,
    pub amount_paid: Option<BigDecimal>,
    pub metadata: serde_json::Value,
    pub receipt_verification_status: ReceiptVerificationStatus,
    pub verified_by: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============ Assignments ============

/// A staff-confirmed booking with its push-model assignment state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub booking_reference: String,
    pub status: BookingStatus,
    pub assigned_agent_id: Option<Uuid>,
    pub assignment_status: Option<AssignmentStatus>,
    pub assignment_response_deadline: Option<DateTime<Utc>>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub assigned_by: Option<String>,
    pub escalated: bool,
    pub escalated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn is_response_overdue(&self, now: DateTime<Utc>) -> bool {
        self.assignment_status == Some(AssignmentStatus::Pending)
            && self
                .assignment_response_deadline
                .map(|deadline| deadline <= now)
                .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentHistory {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub agent_id: Uuid,
    pub action: AssignmentAction,
    pub performed_by: String,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AssignmentHistory {
    pub fn record(
        booking_id: Uuid,
        agent_id: Uuid,
        action: AssignmentAction,
        performed_by: &str,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            booking_id,
            agent_id,
            action,
            performed_by: performed_by.to_string(),
            notes,
            created_at: now,
        }
    }
}

// ============ Performance & bonuses ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceTier {
    pub agent_id: Uuid,
    pub tier: Tier,
    pub total_requests_completed: i32,
    pub cost_per_request: BigDecimal,
    pub bonus_percentage: BigDecimal,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bonus {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub bonus_type: BonusType,
    pub amount: BigDecimal,
    pub description: Option<String>,
    pub claimed: bool,
    pub claimed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Unique when present; blocks issuing the same one-shot bonus twice.
    pub dedupe_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Bonus {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Referral {
    pub id: Uuid,
    pub referrer_id: Uuid,
    pub referred_id: Uuid,
    pub status: ReferralStatus,
    pub referrer_amount: BigDecimal,
    pub referred_amount: BigDecimal,
    pub created_at: DateTime<Utc>,
    pub credited_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn status_strings_round_trip_through_from_str() {
        for status in [
            TicketRequestStatus::Open,
            TicketRequestStatus::ClaimedByAgent,
            TicketRequestStatus::Completed,
            TicketRequestStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<TicketRequestStatus>(), Ok(status));
        }
        let err = "claimed".parse::<TicketRequestStatus>().unwrap_err();
        assert_eq!(err.kind, "TicketRequestStatus");
    }

    #[test]
    fn serde_and_text_forms_agree() {
        let json = serde_json::to_string(&TicketRequestStatus::ClaimedByAgent).unwrap();
        assert_eq!(json, "\"claimed_by_agent\"");
        let json = serde_json::to_string(&BonusType::TierUpgrade).unwrap();
        assert_eq!(json, format!("\"{}\"", BonusType::TierUpgrade.as_str()));
    }

    #[test]
    fn terminal_request_states_have_no_exits() {
        use TicketRequestStatus::*;
        for from in [Completed, Expired] {
            assert!(from.is_terminal());
            for to in [Open, ClaimedByAgent, Completed, Expired] {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
        assert!(!Open.can_transition_to(Completed));
        assert!(Open.can_transition_to(ClaimedByAgent));
    }

    #[test]
    fn agent_transitions_follow_review_flow() {
        use AgentStatus::*;
        assert!(PendingReview.can_transition_to(Approved));
        assert!(Approved.can_transition_to(Suspended));
        assert!(Suspended.can_transition_to(Approved));
        assert!(!Rejected.can_transition_to(Approved));
        assert!(!PendingReview.can_transition_to(Suspended));
        assert_eq!(AgentStatus::sources_of(Approved), vec![PendingReview, Suspended]);
    }

    #[test]
    fn assignment_reoffer_only_after_terminal_miss() {
        use AssignmentStatus::*;
        assert!(AssignmentStatus::can_transition(None, Pending));
        assert!(AssignmentStatus::can_transition(Some(Expired), Pending));
        assert!(AssignmentStatus::can_transition(Some(Rejected), Pending));
        assert!(!AssignmentStatus::can_transition(Some(Accepted), Pending));
        assert!(!AssignmentStatus::can_transition(Some(Pending), Pending));
        assert!(!AssignmentStatus::can_transition(None, Accepted));
    }

    #[test]
    fn tier_lower_is_strict() {
        assert!(Tier::Bronze.lower().is_empty());
        assert_eq!(Tier::Gold.lower(), vec![Tier::Bronze, Tier::Silver]);
    }

    #[test]
    fn local_day_respects_offset() {
        // 23:30 UTC is already the next day at UTC+2
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 23, 30, 0).unwrap();
        assert_eq!(local_day(now, 0), NaiveDate::from_ymd_opt(2026, 3, 1).unwrap());
        assert_eq!(local_day(now, 120), NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
    }

    #[test]
    fn open_request_past_deadline_reports_expired() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let request = TicketRequest {
            id: Uuid::new_v4(),
            origin: "Lusaka".into(),
            destination: "Ndola".into(),
            travel_date: NaiveDate::from_ymd_opt(2026, 3, 5).unwrap(),
            passenger_count: 1,
            passenger_names: vec!["Mwila Banda".into()],
            contact_name: "Mwila Banda".into(),
            contact_phone: "+260971234567".into(),
            contact_email: None,
            status: TicketRequestStatus::Open,
            agent_id: None,
            agent_claimed_at: None,
            request_expires_at: now - chrono::Duration::minutes(1),
            completed_at: None,
            created_at: now - chrono::Duration::hours(2),
        };
        assert!(!request.is_claimable(now));
        assert!(request.is_due_for_expiry(now));
        assert!(matches!(
            request.unavailable_reason(now),
            Some(crate::errors::AppError::RequestExpired)
        ));
    }
}
