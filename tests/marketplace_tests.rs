/// Pay-to-view, claim and completion against the in-process store,
/// including concurrent claimers.
mod common;

use agent_float_api::config::{FeeSchedule, FloatConfig};
use agent_float_api::errors::AppError;
use agent_float_api::events::CoreEvent;
use agent_float_api::marketplace::{ReceiptUpload, RequestListing};
use agent_float_api::models::*;
use agent_float_api::store::FloatStore;
use chrono::{DateTime, Utc};
use common::{hours, ticket_request, zmw, Harness};
use uuid::Uuid;

fn receipt() -> ReceiptUpload {
    ReceiptUpload {
        receipt_url: "https://receipts.example.com/r/123.jpg".to_string(),
        ticket_number: Some("PB-0001".to_string()),
        amount_paid: Some(zmw("350.00")),
        metadata: serde_json::json!({ "operator": "Power Tools Bus" }),
    }
}

fn claim_only() -> FeeSchedule {
    FeeSchedule {
        charge_on_view: false,
        ..FeeSchedule::default()
    }
}

#[tokio::test]
async fn ten_kwacha_two_fee_one_quota_scenario() {
    let config = FloatConfig {
        daily_quota_limit: 1,
        ..FloatConfig::default()
    };
    let h = Harness::new(config);
    let now = Utc::now();
    let agent = h.approved_agent(now).await;
    let first = h.open_request(now).await;
    let second = h.open_request(now).await;
    let market = &h.services.marketplace;

    let viewed = market.view(agent, first.id, now).await.unwrap();
    assert!(viewed.newly_charged);
    assert_eq!(viewed.request.contact_phone, "+260971112233");
    assert_eq!(h.balance(agent, now).await, (zmw("8"), 1));

    // Looking again is free
    let again = market.view(agent, first.id, now).await.unwrap();
    assert!(!again.newly_charged);
    assert!(again.transaction.is_none());

    let claimed = market.claim(agent, first.id, now).await.unwrap();
    assert_eq!(claimed.request.status, TicketRequestStatus::ClaimedByAgent);
    assert_eq!(claimed.request.agent_id, Some(agent));
    assert_eq!(h.balance(agent, now).await, (zmw("6"), 0));

    let err = market.claim(agent, first.id, now).await.unwrap_err();
    assert!(matches!(err, AppError::AlreadyClaimed));

    let err = market.claim(agent, second.id, now).await.unwrap_err();
    assert!(matches!(err, AppError::QuotaExhausted));
    assert_eq!(h.balance(agent, now).await, (zmw("6"), 0));
}

#[tokio::test]
async fn claim_only_schedule_charges_once() {
    let config = FloatConfig {
        daily_quota_limit: 1,
        fees: claim_only(),
        ..FloatConfig::default()
    };
    let h = Harness::new(config);
    let now = Utc::now();
    let agent = h.approved_agent(now).await;
    let request = h.open_request(now).await;

    let viewed = h.services.marketplace.view(agent, request.id, now).await.unwrap();
    assert!(viewed.transaction.is_none());
    h.services
        .marketplace
        .claim(agent, request.id, now)
        .await
        .unwrap();
    assert_eq!(h.balance(agent, now).await, (zmw("8"), 0));
}

#[tokio::test]
async fn open_request_past_deadline_is_expired_on_access() {
    let h = Harness::new(FloatConfig::default());
    let now = Utc::now();
    let agent = h.approved_agent(now).await;
    let request = h
        .services
        .marketplace
        .submit_request(ticket_request(Some(now + hours(1))), now)
        .await
        .unwrap();

    let later = now + hours(2);
    let err = h
        .services
        .marketplace
        .claim(agent, request.id, later)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::RequestExpired));

    let stored = h.store.get_ticket_request(request.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TicketRequestStatus::Expired);

    let err = h
        .services
        .marketplace
        .view(agent, request.id, later)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::RequestExpired));
    // Nothing was charged for the failed attempts
    assert_eq!(h.balance(agent, later).await.0, zmw("10"));
}

#[tokio::test]
async fn submit_rejects_bad_input() {
    let h = Harness::new(FloatConfig::default());
    let now = Utc::now();

    let mut empty = ticket_request(None);
    empty.passenger_count = 0;
    assert!(matches!(
        h.services.marketplace.submit_request(empty, now).await,
        Err(AppError::BadRequest(_))
    ));

    let past = ticket_request(Some(now - hours(1)));
    assert!(matches!(
        h.services.marketplace.submit_request(past, now).await,
        Err(AppError::BadRequest(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_of_many_concurrent_claimers_wins() {
    let h = Harness::new(FloatConfig::default());
    let now = Utc::now();
    let request = h.open_request(now).await;

    let mut agents = Vec::new();
    for _ in 0..16 {
        agents.push(h.approved_agent(now).await);
    }

    let mut handles = Vec::new();
    for agent in agents.iter().copied() {
        let services = h.services.clone();
        handles.push(tokio::spawn(async move {
            (agent, services.marketplace.claim(agent, request.id, now).await)
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        let (agent, result) = handle.await.unwrap();
        match result {
            Ok(_) => winners.push(agent),
            Err(AppError::AlreadyClaimed) => {}
            Err(other) => panic!("unexpected claim error: {}", other),
        }
    }
    assert_eq!(winners.len(), 1);

    let stored = h.store.get_ticket_request(request.id).await.unwrap().unwrap();
    assert_eq!(stored.agent_id, Some(winners[0]));

    // Only the winner paid
    for agent in agents {
        let expected = if agent == winners[0] { zmw("8") } else { zmw("10") };
        assert_eq!(h.balance(agent, now).await.0, expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_overdraw() {
    let config = FloatConfig {
        fees: claim_only(),
        ..FloatConfig::default()
    };
    let h = Harness::new(config);
    let now = Utc::now();
    let agent = h.approved_agent(now).await;

    let mut requests = Vec::new();
    for _ in 0..12 {
        requests.push(h.open_request(now).await.id);
    }

    let mut handles = Vec::new();
    for request_id in requests {
        let services = h.services.clone();
        handles.push(tokio::spawn(async move {
            services.marketplace.claim(agent, request_id, now).await
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(AppError::InsufficientFunds) => {}
            Err(other) => panic!("unexpected claim error: {}", other),
        }
    }

    assert_eq!(succeeded, 5);
    let (balance, quota) = h.balance(agent, now).await;
    assert_eq!(balance, zmw("0"));
    assert_eq!(quota, 15);
}

async fn claim_and_complete(h: &Harness, agent: Uuid, now: DateTime<Utc>) -> i32 {
    let request = h.open_request(now).await;
    h.services
        .marketplace
        .claim(agent, request.id, now)
        .await
        .unwrap();
    h.services
        .marketplace
        .complete(agent, request.id, receipt(), now)
        .await
        .unwrap()
        .total_completed
}

#[tokio::test]
async fn fiftieth_completion_upgrades_bronze_to_silver() {
    let config = FloatConfig {
        daily_quota_limit: 100,
        fees: claim_only(),
        ..FloatConfig::default()
    };
    let mut h = Harness::new(config);
    let now = Utc::now();
    let agent = h.approved_agent(now).await;
    h.services
        .ledger
        .credit(agent, TransactionType::Purchase, zmw("200"), 0, None, now)
        .await
        .unwrap();

    for _ in 0..49 {
        claim_and_complete(&h, agent, now).await;
    }
    let bronze = h.services.performance.get(agent).await.unwrap();
    assert_eq!(bronze.tier, Tier::Bronze);
    assert_eq!(bronze.cost_per_request, zmw("2.00"));

    assert_eq!(claim_and_complete(&h, agent, now).await, 50);
    let silver = h.services.performance.get(agent).await.unwrap();
    assert_eq!(silver.tier, Tier::Silver);
    assert_eq!(silver.cost_per_request, zmw("1.50"));
    assert_eq!(h.balance(agent, now).await.0, zmw("110"));

    // The next claim is priced at the new tier
    let request = h.open_request(now).await;
    h.services
        .marketplace
        .claim(agent, request.id, now)
        .await
        .unwrap();
    assert_eq!(h.balance(agent, now).await.0, zmw("108.50"));

    let bonuses = h.services.bonuses.list(agent).await.unwrap();
    assert_eq!(bonuses.len(), 1);
    assert_eq!(bonuses[0].bonus_type, BonusType::TierUpgrade);
    assert_eq!(bonuses[0].amount, zmw("10.00"));
    assert!(!bonuses[0].claimed);

    let upgrades: Vec<CoreEvent> = h
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, CoreEvent::TierUpgraded { .. }))
        .collect();
    assert_eq!(
        upgrades,
        vec![CoreEvent::TierUpgraded {
            agent_id: agent,
            from: Tier::Bronze,
            to: Tier::Silver
        }]
    );
}

#[tokio::test]
async fn only_the_claimer_can_complete_before_the_deadline() {
    let h = Harness::new(FloatConfig::default());
    let now = Utc::now();
    let claimer = h.approved_agent(now).await;
    let other = h.approved_agent(now).await;
    let request = h
        .services
        .marketplace
        .submit_request(ticket_request(Some(now + hours(3))), now)
        .await
        .unwrap();
    h.services
        .marketplace
        .claim(claimer, request.id, now)
        .await
        .unwrap();

    let err = h
        .services
        .marketplace
        .complete(other, request.id, receipt(), now)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let mut bad = receipt();
    bad.receipt_url = "ftp://receipts.example.com/r.jpg".to_string();
    let err = h
        .services
        .marketplace
        .complete(claimer, request.id, bad, now)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));

    let err = h
        .services
        .marketplace
        .complete(claimer, request.id, receipt(), now + hours(4))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::RequestExpired));
}

#[tokio::test]
async fn receipts_are_reviewed_once() {
    let h = Harness::new(FloatConfig::default());
    let now = Utc::now();
    let agent = h.approved_agent(now).await;
    let request = h.open_request(now).await;
    h.services
        .marketplace
        .claim(agent, request.id, now)
        .await
        .unwrap();
    let completion = h
        .services
        .marketplace
        .complete(agent, request.id, receipt(), now)
        .await
        .unwrap();
    let ticket_id = completion.ticket.id;
    assert_eq!(
        completion.ticket.receipt_verification_status,
        ReceiptVerificationStatus::Pending
    );

    let err = h
        .services
        .marketplace
        .verify_receipt(ticket_id, false, "ops@test", Some("  "), now)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));

    let verified = h
        .services
        .marketplace
        .verify_receipt(ticket_id, true, "ops@test", None, now)
        .await
        .unwrap();
    assert_eq!(
        verified.receipt_verification_status,
        ReceiptVerificationStatus::Verified
    );
    assert_eq!(verified.verified_by.as_deref(), Some("ops@test"));

    let err = h
        .services
        .marketplace
        .verify_receipt(ticket_id, false, "ops@test", Some("blurry"), now)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition(_)));
}

#[tokio::test]
async fn suspended_agents_are_locked_out() {
    let h = Harness::new(FloatConfig::default());
    let now = Utc::now();
    let agent = h.approved_agent(now).await;
    let request = h.open_request(now).await;
    h.services
        .agents
        .suspend(agent, "ops@test", Some("chargeback".to_string()), now)
        .await
        .unwrap();

    assert!(matches!(
        h.services.marketplace.claim(agent, request.id, now).await,
        Err(AppError::AgentNotEligible)
    ));
    assert!(matches!(
        h.services.marketplace.list_open(agent, 10, now).await,
        Err(AppError::AgentNotEligible)
    ));

    h.services
        .agents
        .reinstate(agent, "ops@test", now)
        .await
        .unwrap();
    assert!(h.services.marketplace.claim(agent, request.id, now).await.is_ok());
    // Reinstatement keeps the original account
    assert_eq!(h.balance(agent, now).await.0, zmw("8"));
}

#[tokio::test]
async fn suspended_agents_cannot_complete_or_read_the_ledger() {
    let h = Harness::new(FloatConfig::default());
    let now = Utc::now();
    let agent = h.approved_agent(now).await;
    let request = h.open_request(now).await;
    h.services
        .marketplace
        .claim(agent, request.id, now)
        .await
        .unwrap();
    h.services
        .agents
        .suspend(agent, "ops@test", None, now)
        .await
        .unwrap();

    assert!(matches!(
        h.services
            .marketplace
            .complete(agent, request.id, receipt(), now)
            .await,
        Err(AppError::AgentNotEligible)
    ));
    assert!(matches!(
        h.services.ledger.get_balance(agent, now).await,
        Err(AppError::AgentNotEligible)
    ));
    assert!(matches!(
        h.services.ledger.transactions(agent, 10).await,
        Err(AppError::AgentNotEligible)
    ));

    // The store refuses the completion on its own as well
    let ticket = ProcessedTicket {
        id: Uuid::new_v4(),
        ticket_request_id: request.id,
        agent_id: agent,
        receipt_url: "https://receipts.example.com/r/9.jpg".to_string(),
        ticket_number: None,
        amount_paid: None,
        metadata: serde_json::json!({}),
        receipt_verification_status: ReceiptVerificationStatus::Pending,
        verified_by: None,
        verified_at: None,
        rejection_reason: None,
        created_at: now,
    };
    assert!(matches!(
        h.store.complete_request(&ticket, now).await,
        Err(AppError::AgentNotEligible)
    ));
    let performance = h.store.get_performance(agent).await.unwrap().unwrap();
    assert_eq!(performance.total_requests_completed, 0);

    h.services
        .agents
        .reinstate(agent, "ops@test", now)
        .await
        .unwrap();
    let record = h
        .services
        .marketplace
        .complete(agent, request.id, receipt(), now)
        .await
        .unwrap();
    assert_eq!(record.total_completed, 1);
}

#[tokio::test]
async fn listings_hide_contact_details() {
    let h = Harness::new(FloatConfig::default());
    let now = Utc::now();
    let agent = h.approved_agent(now).await;
    h.open_request(now).await;

    let listings: Vec<RequestListing> = h
        .services
        .marketplace
        .list_open(agent, 50, now)
        .await
        .unwrap();
    assert_eq!(listings.len(), 1);
    let json = serde_json::to_value(&listings[0]).unwrap();
    assert!(json.get("contact_phone").is_none());
    assert!(json.get("contact_name").is_none());
    assert_eq!(json["origin"], "Lusaka");
}

#[tokio::test]
async fn sweep_expires_stale_requests() {
    let h = Harness::new(FloatConfig::default());
    let now = Utc::now();
    h.services
        .marketplace
        .submit_request(ticket_request(Some(now + hours(1))), now)
        .await
        .unwrap();
    h.open_request(now).await;

    let report = h.services.sweep(now + hours(2)).await.unwrap();
    assert_eq!(report.expired_requests, 1);
    assert_eq!(report.expired_assignments, 0);

    let again = h.services.sweep(now + hours(2)).await.unwrap();
    assert_eq!(again.expired_requests, 0);
}
