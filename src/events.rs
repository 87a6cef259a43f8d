//! Structured events handed to the notification collaborator.
//!
//! The core never renders message text; it only describes what happened.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::models::{AgentStatus, BonusType, Tier, TransactionStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    RequestClaimed {
        request_id: Uuid,
        agent_id: Uuid,
        claimed_at: DateTime<Utc>,
    },
    RequestCompleted {
        request_id: Uuid,
        agent_id: Uuid,
        processed_ticket_id: Uuid,
        total_completed: i32,
    },
    AssignmentCreated {
        booking_id: Uuid,
        agent_id: Uuid,
        response_deadline: DateTime<Utc>,
    },
    AssignmentResponded {
        booking_id: Uuid,
        agent_id: Uuid,
        accepted: bool,
    },
    AssignmentEscalated {
        booking_id: Uuid,
        previous_agent_id: Uuid,
        reassigned_to: Option<Uuid>,
        escalated_at: DateTime<Utc>,
    },
    BonusCredited {
        agent_id: Uuid,
        bonus_type: BonusType,
        amount: BigDecimal,
        transaction_id: Option<Uuid>,
    },
    TierUpgraded {
        agent_id: Uuid,
        from: Tier,
        to: Tier,
    },
    AgentStatusChanged {
        agent_id: Uuid,
        status: AgentStatus,
    },
    PhoneVerificationRequested {
        agent_id: Uuid,
        phone: String,
        code: String,
    },
    PurchaseSettled {
        agent_id: Uuid,
        transaction_id: Uuid,
        status: TransactionStatus,
    },
}

impl CoreEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CoreEvent::RequestClaimed { .. } => "request_claimed",
            CoreEvent::RequestCompleted { .. } => "request_completed",
            CoreEvent::AssignmentCreated { .. } => "assignment_created",
            CoreEvent::AssignmentResponded { .. } => "assignment_responded",
            CoreEvent::AssignmentEscalated { .. } => "assignment_escalated",
            CoreEvent::BonusCredited { .. } => "bonus_credited",
            CoreEvent::TierUpgraded { .. } => "tier_upgraded",
            CoreEvent::AgentStatusChanged { .. } => "agent_status_changed",
            CoreEvent::PhoneVerificationRequested { .. } => "phone_verification_requested",
            CoreEvent::PurchaseSettled { .. } => "purchase_settled",
        }
    }
}

/// Fire-and-forget event fan-out. Emitting never fails the calling operation.
#[derive(Clone, Default)]
pub struct EventPublisher {
    sender: Option<mpsc::UnboundedSender<CoreEvent>>,
}

impl EventPublisher {
    /// Publisher that only logs.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    /// Publisher plus the receiving end for a dispatcher (or a test).
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CoreEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    pub fn emit(&self, event: CoreEvent) {
        tracing::debug!(event = event.name(), "core event");
        if let Some(ref sender) = self.sender {
            if sender.send(event).is_err() {
                tracing::warn!("Event dispatcher is gone; event dropped");
            }
        }
    }
}
