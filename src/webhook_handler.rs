use crate::errors::AppError;
use crate::handlers::AppState;
use crate::models::{FloatTransaction, TransactionType};
use crate::webhook_models::{PaymentEvent, PaymentOutcome, PaymentWebhookPayload, PaymentWebhookResponse};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use std::sync::Arc;

/// Payment confirmation webhook
///
/// Receives settlement signals from the payment provider. Each event either
/// settles a pending purchase (idempotently) or credits a direct top-up.
///
/// Expected payload: Single event object OR array of events
/// Authentication: X-Webhook-Token header must match PAYMENT_WEBHOOK_SECRET
pub async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<PaymentWebhookPayload>,
) -> Result<(StatusCode, Json<PaymentWebhookResponse>), AppError> {
    tracing::info!("Received payment webhook");

    validate_webhook_secret(&state, &headers)?;

    let events = payload.into_events();
    let total_received = events.len();

    let mut settled = 0;
    let mut failed = 0;
    let mut errors = 0;

    for event in events {
        match process_payment_event(&state, event).await {
            Ok(transaction) if transaction.status == crate::models::TransactionStatus::Failed => {
                failed += 1;
            }
            Ok(_) => settled += 1,
            Err(e) => {
                errors += 1;
                tracing::error!("Failed to process payment event: {}", e);
                // Continue processing other events even if one fails
            }
        }
    }

    tracing::info!(
        "Payment webhook complete: {} received, {} settled, {} failed, {} errors",
        total_received,
        settled,
        failed,
        errors
    );

    Ok((
        StatusCode::OK,
        Json(PaymentWebhookResponse {
            status: "received".to_string(),
            received: total_received,
            settled,
            failed,
            errors,
        }),
    ))
}

/// Validate webhook secret from X-Webhook-Token header
fn validate_webhook_secret(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let token = headers
        .get("X-Webhook-Token")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing X-Webhook-Token header".to_string()))?;

    if !constant_time_compare(token, &state.payment_webhook_secret) {
        tracing::warn!("Invalid payment webhook token received");
        return Err(AppError::Unauthorized("Invalid webhook token".to_string()));
    }

    Ok(())
}

/// Constant-time string comparison (basic implementation)
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.as_bytes()
        .iter()
        .zip(b.as_bytes().iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

async fn process_payment_event(
    state: &AppState,
    event: PaymentEvent,
) -> Result<FloatTransaction, AppError> {
    let now = Utc::now();
    let ledger = &state.services.ledger;

    if let Some(transaction_id) = event.transaction_id {
        return ledger
            .settle_purchase(transaction_id, event.status == PaymentOutcome::Succeeded, now)
            .await;
    }

    // Direct top-up: nothing pending to settle.
    let agent_id = event.agent_id.ok_or_else(|| {
        AppError::BadRequest("agent_id is required without transaction_id".to_string())
    })?;
    let amount = event.amount_zmw.ok_or_else(|| {
        AppError::BadRequest("amount_zmw is required without transaction_id".to_string())
    })?;
    if event.status == PaymentOutcome::Failed {
        return Err(AppError::BadRequest(
            "Failed direct payments carry nothing to credit".to_string(),
        ));
    }
    ledger
        .credit(
            agent_id,
            TransactionType::Purchase,
            amount,
            event.requests,
            event.reference,
            now,
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_compare_matches_equal_strings_only() {
        assert!(constant_time_compare("secret-token", "secret-token"));
        assert!(!constant_time_compare("secret-token", "secret-tokem"));
        assert!(!constant_time_compare("short", "longer-value"));
    }

    #[test]
    fn payload_accepts_single_and_batch() {
        let single: PaymentWebhookPayload = serde_json::from_value(serde_json::json!({
            "transaction_id": "7c4d2b3e-1f0a-4c55-9d8e-2a1b3c4d5e6f",
            "status": "succeeded"
        }))
        .unwrap();
        assert_eq!(single.into_events().len(), 1);

        let batch: PaymentWebhookPayload = serde_json::from_value(serde_json::json!([
            {"agent_id": "7c4d2b3e-1f0a-4c55-9d8e-2a1b3c4d5e6f", "status": "succeeded", "amount_zmw": "50.00", "requests": 10},
            {"transaction_id": "7c4d2b3e-1f0a-4c55-9d8e-2a1b3c4d5e70", "status": "failed"}
        ]))
        .unwrap();
        let events = batch.into_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].requests, 10);
        assert_eq!(events[1].status, PaymentOutcome::Failed);
    }
}
