//! Shared fixtures for the integration tests: an in-process store wired to
//! the real services, plus helpers for the usual agent and request setup.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use agent_float_api::agents::NewAgent;
use agent_float_api::config::FloatConfig;
use agent_float_api::events::{CoreEvent, EventPublisher};
use agent_float_api::marketplace::NewTicketRequest;
use agent_float_api::memory_store::MemoryStore;
use agent_float_api::models::TicketRequest;
use agent_float_api::services::Services;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

static PHONE_SEQ: AtomicU32 = AtomicU32::new(1);

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub services: Services,
    pub events: UnboundedReceiver<CoreEvent>,
}

impl Harness {
    pub fn new(config: FloatConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let (publisher, events) = EventPublisher::channel();
        let services = Services::new(store.clone(), config, publisher);
        Self {
            store,
            services,
            events,
        }
    }

    /// Registers and approves an agent; the account opens with the welcome bonus.
    pub async fn approved_agent(&self, now: DateTime<Utc>) -> Uuid {
        let agent = self
            .services
            .agents
            .register(new_agent(), now)
            .await
            .expect("register agent");
        self.services
            .agents
            .approve(agent.id, "ops@test", now)
            .await
            .expect("approve agent");
        agent.id
    }

    pub async fn open_request(&self, now: DateTime<Utc>) -> TicketRequest {
        self.services
            .marketplace
            .submit_request(ticket_request(None), now)
            .await
            .expect("submit request")
    }

    pub async fn balance(&self, agent_id: Uuid, now: DateTime<Utc>) -> (BigDecimal, i32) {
        let snapshot = self
            .services
            .ledger
            .get_balance(agent_id, now)
            .await
            .expect("balance");
        (snapshot.balance, snapshot.quota_remaining)
    }

    /// Everything published so far.
    pub fn drain_events(&mut self) -> Vec<CoreEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }
}

/// A fresh, valid Zambian mobile number per call.
pub fn new_agent() -> NewAgent {
    let n = PHONE_SEQ.fetch_add(1, Ordering::SeqCst);
    NewAgent {
        phone: format!("097{:07}", n),
        full_name: format!("Agent {}", n),
        nrc_number: "123456/78/9".to_string(),
        business_name: Some("Intercity Tickets".to_string()),
    }
}

pub fn ticket_request(expires_at: Option<DateTime<Utc>>) -> NewTicketRequest {
    NewTicketRequest {
        origin: "Lusaka".to_string(),
        destination: "Livingstone".to_string(),
        travel_date: NaiveDate::from_ymd_opt(2026, 12, 20).expect("valid date"),
        passenger_count: 2,
        passenger_names: vec!["Mwila Banda".to_string(), "Chanda Phiri".to_string()],
        contact_name: "Mwila Banda".to_string(),
        contact_phone: "+260971112233".to_string(),
        contact_email: None,
        request_expires_at: expires_at,
    }
}

pub fn zmw(value: &str) -> BigDecimal {
    value.parse().expect("decimal literal")
}

pub fn hours(n: i64) -> Duration {
    Duration::hours(n)
}
