/// Ledger behavior against the in-process store: quota resets, purchases,
/// settlement idempotence and reconciliation.
mod common;

use agent_float_api::config::FloatConfig;
use agent_float_api::errors::AppError;
use agent_float_api::events::CoreEvent;
use agent_float_api::models::{TransactionStatus, TransactionType};
use agent_float_api::store::FloatStore;
use chrono::{Duration, Utc};
use common::{hours, ticket_request, zmw, Harness};

#[tokio::test]
async fn approval_opens_account_with_welcome_bonus_and_full_quota() {
    let h = Harness::new(FloatConfig::default());
    let now = Utc::now();
    let agent = h.approved_agent(now).await;

    let (balance, quota) = h.balance(agent, now).await;
    assert_eq!(balance, zmw("10"));
    assert_eq!(quota, 20);
}

#[tokio::test]
async fn pending_agents_are_not_eligible() {
    let h = Harness::new(FloatConfig::default());
    let now = Utc::now();
    let agent = h
        .services
        .agents
        .register(common::new_agent(), now)
        .await
        .unwrap();

    let err = h.services.ledger.get_balance(agent.id, now).await.unwrap_err();
    assert!(matches!(err, AppError::AgentNotEligible));
    // No account exists until approval
    assert!(h.store.get_account(agent.id).await.unwrap().is_none());

    let err = h.services.ledger.ensure_eligible(agent.id).await.unwrap_err();
    assert!(matches!(err, AppError::AgentNotEligible));
}

#[tokio::test]
async fn quota_resets_once_per_day() {
    let config = FloatConfig {
        daily_quota_limit: 2,
        ..FloatConfig::default()
    };
    let h = Harness::new(config);
    let now = Utc::now();
    let agent = h.approved_agent(now).await;
    let market = &h.services.marketplace;

    for _ in 0..2 {
        let request = h
            .services
            .marketplace
            .submit_request(ticket_request(Some(now + hours(72))), now)
            .await
            .unwrap();
        market.claim(agent, request.id, now).await.unwrap();
    }
    assert_eq!(h.balance(agent, now).await.1, 0);
    // Same day: reading again must not refill
    assert_eq!(h.balance(agent, now + Duration::minutes(5)).await.1, 0);

    let tomorrow = now + Duration::days(1);
    assert_eq!(h.balance(agent, tomorrow).await.1, 2);

    let request = market
        .submit_request(ticket_request(Some(now + hours(72))), tomorrow)
        .await
        .unwrap();
    market.claim(agent, request.id, tomorrow).await.unwrap();
    // Second read on the new day sees the decrement, not another reset
    assert_eq!(h.balance(agent, tomorrow).await.1, 1);
}

#[tokio::test]
async fn settled_purchase_credits_once() {
    let mut h = Harness::new(FloatConfig::default());
    let now = Utc::now();
    let agent = h.approved_agent(now).await;
    let ledger = &h.services.ledger;

    let pending = ledger
        .begin_purchase(agent, zmw("50.00"), 5, Some("MOMO-123".to_string()), now)
        .await
        .unwrap();
    assert_eq!(pending.status, TransactionStatus::Pending);
    assert_eq!(h.balance(agent, now).await.0, zmw("10"));

    let settled = ledger.settle_purchase(pending.id, true, now).await.unwrap();
    assert_eq!(settled.status, TransactionStatus::Completed);
    assert_eq!(h.balance(agent, now).await.0, zmw("60"));

    // Provider retries the confirmation
    let again = ledger.settle_purchase(pending.id, true, now).await.unwrap();
    assert_eq!(again.status, TransactionStatus::Completed);
    assert_eq!(h.balance(agent, now).await.0, zmw("60"));

    let settled_events = h
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, CoreEvent::PurchaseSettled { .. }))
        .count();
    assert_eq!(settled_events, 1);
}

#[tokio::test]
async fn failed_purchase_never_credits() {
    let h = Harness::new(FloatConfig::default());
    let now = Utc::now();
    let agent = h.approved_agent(now).await;
    let ledger = &h.services.ledger;

    let pending = ledger
        .begin_purchase(agent, zmw("25.00"), 0, None, now)
        .await
        .unwrap();
    let failed = ledger.settle_purchase(pending.id, false, now).await.unwrap();
    assert_eq!(failed.status, TransactionStatus::Failed);

    // A late success cannot resurrect a failed payment
    let late = ledger.settle_purchase(pending.id, true, now).await.unwrap();
    assert_eq!(late.status, TransactionStatus::Failed);
    assert_eq!(h.balance(agent, now).await.0, zmw("10"));
}

#[tokio::test]
async fn non_purchase_transactions_cannot_be_settled() {
    let h = Harness::new(FloatConfig::default());
    let now = Utc::now();
    let agent = h.approved_agent(now).await;
    let refund = h
        .services
        .ledger
        .credit(agent, TransactionType::Refund, zmw("2.00"), 0, None, now)
        .await
        .unwrap();

    let err = h
        .services
        .ledger
        .settle_purchase(refund.id, true, now)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
}

#[tokio::test]
async fn negative_credits_and_purchases_are_rejected() {
    let h = Harness::new(FloatConfig::default());
    let now = Utc::now();
    let agent = h.approved_agent(now).await;
    let ledger = &h.services.ledger;

    assert!(matches!(
        ledger
            .credit(agent, TransactionType::Bonus, zmw("-1"), 0, None, now)
            .await,
        Err(AppError::BadRequest(_))
    ));
    assert!(matches!(
        ledger.begin_purchase(agent, zmw("0"), 1, None, now).await,
        Err(AppError::BadRequest(_))
    ));
}

#[tokio::test]
async fn reconcile_repairs_out_of_band_balance_writes() {
    let h = Harness::new(FloatConfig::default());
    let now = Utc::now();
    let agent = h.approved_agent(now).await;
    let request = h.open_request(now).await;
    h.services
        .marketplace
        .claim(agent, request.id, now)
        .await
        .unwrap();

    let clean = h.services.ledger.reconcile(agent, now).await.unwrap();
    assert!(!clean.corrected);
    assert_eq!(clean.derived_balance, zmw("8"));

    h.store.overwrite_balance(agent, zmw("500"));
    let repaired = h.services.ledger.reconcile(agent, now).await.unwrap();
    assert!(repaired.corrected);
    assert_eq!(repaired.drift, zmw("492"));
    assert_eq!(h.balance(agent, now).await.0, zmw("8"));
}

#[tokio::test]
async fn transaction_history_is_newest_first() {
    let h = Harness::new(FloatConfig::default());
    let now = Utc::now();
    let agent = h.approved_agent(now).await;
    let ledger = &h.services.ledger;

    ledger
        .credit(agent, TransactionType::Purchase, zmw("5"), 0, Some("first".into()), now)
        .await
        .unwrap();
    ledger
        .credit(agent, TransactionType::Purchase, zmw("7"), 0, Some("second".into()), now)
        .await
        .unwrap();

    let history = ledger.transactions(agent, 10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].reference.as_deref(), Some("second"));

    let limited = ledger.transactions(agent, 0).await.unwrap();
    assert_eq!(limited.len(), 1);
}
