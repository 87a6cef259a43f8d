use failsafe::backoff::Exponential;
use failsafe::failure_policy::ConsecutiveFailures;
use failsafe::{backoff, failure_policy, Config, StateMachine};
use std::time::Duration;

/// Breaker guarding the outbound notification webhook.
pub type NotifierBreaker = StateMachine<ConsecutiveFailures<Exponential>, ()>;

/// Creates the circuit breaker for notification delivery.
///
/// # Configuration
///
/// - **Failure threshold**: 5 consecutive failures triggers OPEN state.
/// - **Backoff**: Exponential backoff from 10s to 60s before attempting recovery.
///
/// While OPEN, events are dropped (and logged) instead of waiting on a dead
/// endpoint.
pub fn create_notifier_circuit_breaker() -> NotifierBreaker {
    let backoff_strategy = backoff::exponential(
        Duration::from_secs(10), // Initial delay
        Duration::from_secs(60), // Maximum delay
    );

    let failure_policy = failure_policy::consecutive_failures(5, backoff_strategy);

    Config::new().failure_policy(failure_policy).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use failsafe::{CircuitBreaker, Error};

    #[test]
    fn test_circuit_breaker_opens_after_failures() {
        let cb = create_notifier_circuit_breaker();

        for _ in 0..5 {
            let result: Result<(), Error<&str>> = cb.call(|| Err::<(), &str>("webhook down"));
            assert!(result.is_err());
        }

        let result: Result<(), Error<&str>> = cb.call(|| Ok::<(), &str>(()));
        match result {
            Err(Error::Rejected) => {}
            _ => panic!("Expected circuit to be open and reject requests"),
        }
    }

    #[test]
    fn test_circuit_breaker_allows_success() {
        let cb = create_notifier_circuit_breaker();

        let result: Result<i32, Error<&str>> = cb.call(|| Ok::<i32, &str>(42));

        assert_eq!(result.unwrap(), 42);
    }
}
