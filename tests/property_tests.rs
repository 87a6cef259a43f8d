/// Property-based tests using proptest
/// Tests invariants that should hold for all inputs: tier ranking, input
/// validation and the ledger balance equation.
mod common;

use agent_float_api::agents::{validate_nrc, validate_zm_phone};
use agent_float_api::config::FloatConfig;
use agent_float_api::errors::AppError;
use agent_float_api::models::TransactionType;
use agent_float_api::performance::TierTable;
use bigdecimal::BigDecimal;
use chrono::Utc;
use common::{hours, ticket_request, Harness};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum LedgerOp {
    /// Credit this many ngwee
    Credit(i64),
    Claim,
}

fn ledger_op() -> impl Strategy<Value = LedgerOp> {
    prop_oneof![
        (1i64..=5_000).prop_map(LedgerOp::Credit),
        Just(LedgerOp::Claim),
    ]
}

// Property: tiers only move up as completions grow
proptest! {
    #[test]
    fn tier_ranking_is_monotonic(a in 0i32..2_000, b in 0i32..2_000) {
        let table = TierTable::standard();
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        let low_spec = table.tier_for(low);
        let high_spec = table.tier_for(high);

        prop_assert!(low_spec.tier <= high_spec.tier);
        prop_assert!(low_spec.cost_per_request >= high_spec.cost_per_request);
    }

    #[test]
    fn tier_threshold_is_met(completed in 0i32..2_000) {
        let spec = TierTable::standard().tier_for(completed).clone();
        prop_assert!(spec.threshold <= completed);
    }
}

// Property: identity validation should never panic
proptest! {
    #[test]
    fn phone_validation_never_panics(phone in "\\PC*") {
        let _ = validate_zm_phone(&phone);
    }

    #[test]
    fn nrc_validation_never_panics(nrc in "\\PC*") {
        let _ = validate_nrc(&nrc);
    }

    #[test]
    fn valid_zm_mobiles_normalize_to_e164(
        network in prop::sample::select(vec!["95", "96", "97"]),
        rest in 1_000_000u32..=9_999_999u32
    ) {
        let phone = format!("0{}{}", network, rest);
        if let Ok(normalized) = validate_zm_phone(&phone) {
            prop_assert!(normalized.starts_with("+260"));
            prop_assert_eq!(normalized.len(), 13);
            prop_assert!(normalized[1..].chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn well_formed_nrc_accepted(
        serial in 100_000u32..=999_999u32,
        district in 10u32..=99u32,
        check in 1u32..=9u32
    ) {
        let nrc = format!("{}/{}/{}", serial, district, check);
        prop_assert_eq!(validate_nrc(&format!("  {} ", nrc)).ok(), Some(nrc));
    }
}

// Property: whatever mix of top-ups and claims runs, the stored balance equals
// the ledger sum and never goes negative
proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn balance_always_matches_ledger(ops in prop::collection::vec(ledger_op(), 1..24)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let (expected, report, balance) = runtime.block_on(async {
            let h = Harness::new(FloatConfig::default());
            let now = Utc::now();
            let agent = h.approved_agent(now).await;
            let fee = BigDecimal::new(200.into(), 2);
            let mut expected = BigDecimal::from(10);

            for op in &ops {
                match op {
                    LedgerOp::Credit(ngwee) => {
                        let amount = BigDecimal::new((*ngwee).into(), 2);
                        h.services
                            .ledger
                            .credit(agent, TransactionType::Purchase, amount.clone(), 0, None, now)
                            .await
                            .unwrap();
                        expected += amount;
                    }
                    LedgerOp::Claim => {
                        let request = h
                            .services
                            .marketplace
                            .submit_request(ticket_request(Some(now + hours(48))), now)
                            .await
                            .unwrap();
                        match h.services.marketplace.claim(agent, request.id, now).await {
                            Ok(_) => expected -= fee.clone(),
                            Err(AppError::InsufficientFunds) | Err(AppError::QuotaExhausted) => {}
                            Err(other) => panic!("unexpected claim error: {}", other),
                        }
                    }
                }
            }

            let report = h.services.ledger.reconcile(agent, now).await.unwrap();
            let (balance, _) = h.balance(agent, now).await;
            (expected, report, balance)
        });

        prop_assert!(!report.corrected);
        prop_assert_eq!(report.drift, BigDecimal::from(0));
        prop_assert!(balance >= BigDecimal::from(0));
        prop_assert_eq!(balance, expected);
    }
}
