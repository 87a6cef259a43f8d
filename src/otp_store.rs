use moka::future::Cache;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::errors::AppError;
use crate::webhook_handler::constant_time_compare;

pub const MAX_ATTEMPTS: u32 = 5;

#[derive(Clone)]
struct PendingCode {
    /// SHA-256 of the code, hex encoded. The plain code is never stored.
    digest: String,
    attempts: Arc<AtomicU32>,
}

fn digest(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())
}

/// One-time phone verification codes keyed by agent, expiring after a TTL.
#[derive(Clone)]
pub struct OtpStore {
    codes: Cache<Uuid, PendingCode>,
}

impl OtpStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            codes: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(10_000)
                .build(),
        }
    }

    /// Replaces any pending code for the agent and returns the new one.
    pub async fn issue(&self, agent_id: Uuid) -> String {
        let code = format!("{:06}", Uuid::new_v4().as_u128() % 1_000_000);
        self.codes
            .insert(
                agent_id,
                PendingCode {
                    digest: digest(&code),
                    attempts: Arc::new(AtomicU32::new(0)),
                },
            )
            .await;
        code
    }

    /// Consumes the pending code on success.
    pub async fn verify(&self, agent_id: Uuid, code: &str) -> Result<(), AppError> {
        let pending = self.codes.get(&agent_id).await.ok_or_else(|| {
            AppError::BadRequest("No verification code pending, or it expired".to_string())
        })?;

        if pending.attempts.fetch_add(1, Ordering::SeqCst) >= MAX_ATTEMPTS {
            self.codes.invalidate(&agent_id).await;
            return Err(AppError::BadRequest(
                "Too many attempts; request a new code".to_string(),
            ));
        }
        if !constant_time_compare(&digest(code.trim()), &pending.digest) {
            return Err(AppError::BadRequest("Invalid verification code".to_string()));
        }

        self.codes.invalidate(&agent_id).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn issued_code_verifies_once() {
        let store = OtpStore::new(Duration::from_secs(60));
        let agent = Uuid::new_v4();
        let code = store.issue(agent).await;

        assert_eq!(code.len(), 6);
        assert!(store.verify(agent, &code).await.is_ok());
        assert!(store.verify(agent, &code).await.is_err());
    }

    #[tokio::test]
    async fn locks_out_after_max_attempts() {
        let store = OtpStore::new(Duration::from_secs(60));
        let agent = Uuid::new_v4();
        let code = store.issue(agent).await;
        let wrong = if code == "000000" { "111111" } else { "000000" };

        for _ in 0..MAX_ATTEMPTS {
            assert!(store.verify(agent, wrong).await.is_err());
        }
        // The right code no longer helps
        assert!(store.verify(agent, &code).await.is_err());
    }

    #[tokio::test]
    async fn codes_expire_with_ttl() {
        let store = OtpStore::new(Duration::from_millis(50));
        let agent = Uuid::new_v4();
        let code = store.issue(agent).await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(store.verify(agent, &code).await.is_err());
    }
}
