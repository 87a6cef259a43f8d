use std::env;
use std::sync::Arc;

use agent_float_api::agents::NewAgent;
use agent_float_api::config::FloatConfig;
use agent_float_api::db::Database;
use agent_float_api::events::EventPublisher;
use agent_float_api::errors::AppError;
use agent_float_api::marketplace::NewTicketRequest;
use agent_float_api::pg_store::PgStore;
use agent_float_api::services::Services;
use bigdecimal::BigDecimal;
use chrono::{Duration, Utc};
use uuid::Uuid;

async fn pg_services() -> anyhow::Result<Services> {
    let db_url = env::var("TEST_DATABASE_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .map_err(|_| anyhow::anyhow!("Set TEST_DATABASE_URL or DATABASE_URL to run this test"))?;

    let db = Database::new(&db_url)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    Ok(Services::new(
        Arc::new(PgStore::new(db.pool.clone())),
        FloatConfig::default(),
        EventPublisher::disabled(),
    ))
}

/// A phone number unlikely to collide with earlier runs.
fn unique_phone() -> String {
    format!("097{:07}", Uuid::new_v4().as_u128() % 10_000_000)
}

/// Integration smoke test for the Postgres store: approval, claim, reconcile.
/// Marked ignored to avoid running against production by accident; set TEST_DATABASE_URL to run.
#[tokio::test]
#[ignore]
async fn claim_debits_balance_in_postgres() -> anyhow::Result<()> {
    let services = pg_services().await?;
    let now = Utc::now();

    let agent = services
        .agents
        .register(
            NewAgent {
                phone: unique_phone(),
                full_name: "Smoke Test Agent".to_string(),
                nrc_number: "123456/78/9".to_string(),
                business_name: None,
            },
            now,
        )
        .await?;
    services.agents.approve(agent.id, "smoke-test", now).await?;

    let request = services
        .marketplace
        .submit_request(
            NewTicketRequest {
                origin: "Kitwe".to_string(),
                destination: "Lusaka".to_string(),
                travel_date: (now + Duration::days(7)).date_naive(),
                passenger_count: 1,
                passenger_names: vec![],
                contact_name: "Smoke Test".to_string(),
                contact_phone: "+260971112233".to_string(),
                contact_email: None,
                request_expires_at: Some(now + Duration::hours(6)),
            },
            now,
        )
        .await?;

    services.marketplace.claim(agent.id, request.id, now).await?;
    let second = services.marketplace.claim(agent.id, request.id, now).await;
    assert!(matches!(second, Err(AppError::AlreadyClaimed)));

    let balance = services.ledger.get_balance(agent.id, now).await?;
    assert_eq!(balance.balance, BigDecimal::from(8));

    let report = services.ledger.reconcile(agent.id, now).await?;
    assert!(!report.corrected);
    Ok(())
}
