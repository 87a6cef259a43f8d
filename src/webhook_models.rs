use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payment confirmation payload - can be single object or array
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PaymentWebhookPayload {
    Single(PaymentEvent),
    Batch(Vec<PaymentEvent>),
}

impl PaymentWebhookPayload {
    /// Convert to a vec of events for uniform processing
    pub fn into_events(self) -> Vec<PaymentEvent> {
        match self {
            PaymentWebhookPayload::Single(event) => vec![event],
            PaymentWebhookPayload::Batch(events) => events,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOutcome {
    Succeeded,
    Failed,
}

/// One confirmation from the payment provider.
///
/// With `transaction_id` it settles a pending purchase. Without one it is a
/// direct top-up and needs `agent_id` and `amount_zmw`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PaymentEvent {
    pub transaction_id: Option<Uuid>,
    pub agent_id: Option<Uuid>,
    pub status: PaymentOutcome,
    pub amount_zmw: Option<BigDecimal>,
    /// Quota granted with the purchase.
    #[serde(default)]
    pub requests: i32,
    /// Provider reference, e.g. the mobile-money receipt number.
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentWebhookResponse {
    pub status: String,
    pub received: usize,
    pub settled: usize,
    pub failed: usize,
    pub errors: usize,
}
