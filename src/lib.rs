//! Agent Float Ledger & Ticket-Request Marketplace
//!
//! Prepaid float and daily quota metering for bus-ticket sales agents, a
//! pay-to-view-then-claim marketplace of customer ticket requests, push-model
//! booking assignment with deadlines and escalation, performance tiers and
//! one-time bonuses.
//!
//! # Modules
//!
//! - `agents`: Registration, phone verification and admin review.
//! - `api_models`: HTTP request and response bodies.
//! - `assignment`: Booking assignment workflow.
//! - `bonus`: Claimable bonuses and referral credits.
//! - `circuit_breaker`: Breaker for outbound notifications.
//! - `config`: Configuration management.
//! - `db`: Database pool and migrations.
//! - `errors`: Error handling types.
//! - `events`: Structured core events.
//! - `handlers`: HTTP request handlers and router.
//! - `ledger`: Balance, quota and the transaction log.
//! - `marketplace`: Ticket request view, claim and completion.
//! - `memory_store`: In-process store.
//! - `models`: Core data models.
//! - `notifier`: Notification webhook client.
//! - `otp_store`: Phone verification codes.
//! - `performance`: Tier derivation.
//! - `pg_store`: PostgreSQL store.
//! - `services`: Service wiring and the expiry sweep.
//! - `store`: The storage trait.
//! - `webhook_handler`: Payment confirmation webhook.
//! - `webhook_models`: Payment webhook payloads.

pub mod agents;
pub mod api_models;
pub mod assignment;
pub mod bonus;
pub mod circuit_breaker;
pub mod config;
pub mod db;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod ledger;
pub mod marketplace;
pub mod memory_store;
pub mod models;
pub mod notifier;
pub mod otp_store;
pub mod performance;
pub mod pg_store;
pub mod services;
pub mod store;
pub mod webhook_handler;
pub mod webhook_models;
