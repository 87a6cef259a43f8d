//! Agent registration, phone verification and admin review.

use chrono::{DateTime, Utc};
use phonenumber::country::Id as CountryId;
use phonenumber::Mode;
use regex::Regex;
use serde::Deserialize;
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

use crate::config::FloatConfig;
use crate::errors::AppError;
use crate::events::{CoreEvent, EventPublisher};
use crate::models::*;
use crate::otp_store::OtpStore;
use crate::performance::TierTable;
use crate::store::{AccountOpening, AgentStatusChange, FloatStore};

#[derive(Debug, Clone, Deserialize)]
pub struct NewAgent {
    pub phone: String,
    pub full_name: String,
    pub nrc_number: String,
    pub business_name: Option<String>,
}

/// Validate and normalize a Zambian phone number to E.164 (+260971234567).
pub fn validate_zm_phone(raw: &str) -> Result<String, AppError> {
    if raw.trim().len() < 9 {
        return Err(AppError::BadRequest("Phone too short".to_string()));
    }

    match phonenumber::parse(Some(CountryId::ZM), raw.trim()) {
        Ok(number) if phonenumber::is_valid(&number) => {
            let formatted = number.format().mode(Mode::E164).to_string();
            tracing::debug!("Valid ZM phone: {} -> {}", raw, formatted);
            Ok(formatted)
        }
        Ok(_) => {
            tracing::warn!("Invalid ZM phone number: {}", raw);
            Err(AppError::BadRequest(
                "Invalid Zambian phone number".to_string(),
            ))
        }
        Err(e) => {
            tracing::warn!("Failed to parse ZM phone '{}': {:?}", raw, e);
            Err(AppError::BadRequest(format!("Phone parse error: {:?}", e)))
        }
    }
}

fn nrc_pattern() -> Option<&'static Regex> {
    static NRC: OnceLock<Option<Regex>> = OnceLock::new();
    NRC.get_or_init(|| Regex::new(r"^\d{6}/\d{2}/\d$").ok())
        .as_ref()
}

/// National Registration Card number, `NNNNNN/NN/N`.
pub fn validate_nrc(raw: &str) -> Result<String, AppError> {
    let nrc = raw.trim();
    let pattern = nrc_pattern()
        .ok_or_else(|| AppError::InternalError("NRC pattern failed to compile".to_string()))?;
    if pattern.is_match(nrc) {
        Ok(nrc.to_string())
    } else {
        Err(AppError::BadRequest(
            "NRC number must look like 123456/78/9".to_string(),
        ))
    }
}

#[derive(Clone)]
pub struct AgentDirectory {
    store: Arc<dyn FloatStore>,
    otp: OtpStore,
    tiers: TierTable,
    events: EventPublisher,
    config: FloatConfig,
}

impl AgentDirectory {
    pub fn new(
        store: Arc<dyn FloatStore>,
        otp: OtpStore,
        tiers: TierTable,
        events: EventPublisher,
        config: FloatConfig,
    ) -> Self {
        Self {
            store,
            otp,
            tiers,
            events,
            config,
        }
    }

    pub async fn register(&self, input: NewAgent, now: DateTime<Utc>) -> Result<Agent, AppError> {
        let phone = validate_zm_phone(&input.phone)?;
        let nrc_number = validate_nrc(&input.nrc_number)?;
        let full_name = input.full_name.trim().to_string();
        if full_name.is_empty() {
            return Err(AppError::BadRequest("full_name is required".to_string()));
        }

        let agent = Agent {
            id: Uuid::new_v4(),
            phone,
            full_name,
            nrc_number,
            business_name: input
                .business_name
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty()),
            phone_verified: false,
            status: AgentStatus::PendingReview,
            reviewed_by: None,
            reviewed_at: None,
            status_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_agent(&agent).await?;
        tracing::info!("Agent {} registered, pending review", agent.id);
        Ok(agent)
    }

    pub async fn get(&self, agent_id: Uuid) -> Result<Agent, AppError> {
        self.store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Agent {}", agent_id)))
    }

    /// Issues a code and hands it to the notification collaborator.
    pub async fn request_phone_verification(&self, agent_id: Uuid) -> Result<(), AppError> {
        let agent = self.get(agent_id).await?;
        if agent.phone_verified {
            return Err(AppError::BadRequest(
                "Phone is already verified".to_string(),
            ));
        }
        let code = self.otp.issue(agent_id).await;
        self.events.emit(CoreEvent::PhoneVerificationRequested {
            agent_id,
            phone: agent.phone,
            code,
        });
        Ok(())
    }

    pub async fn confirm_phone_verification(
        &self,
        agent_id: Uuid,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<Agent, AppError> {
        self.otp.verify(agent_id, code).await?;
        if !self.store.mark_phone_verified(agent_id, now).await? {
            return Err(AppError::NotFound(format!("Agent {}", agent_id)));
        }
        tracing::info!("Agent {} verified their phone", agent_id);
        self.get(agent_id).await
    }

    /// Approves a pending (or reinstates a suspended) agent. The first
    /// approval opens the float account and performance record.
    pub async fn approve(
        &self,
        agent_id: Uuid,
        reviewer: &str,
        now: DateTime<Utc>,
    ) -> Result<Agent, AppError> {
        let opening = AccountOpening {
            account: FloatAccount::open(
                agent_id,
                self.config.welcome_bonus.clone(),
                self.config.daily_quota_limit,
                self.config.quota_day_utc_offset_minutes,
                now,
            ),
            performance: self.tiers.opening(agent_id, now),
        };
        self.transition(
            agent_id,
            AgentStatus::Approved,
            reviewer,
            None,
            Some(&opening),
            now,
        )
        .await
    }

    /// Alias for approving a suspended agent; the account already exists.
    pub async fn reinstate(
        &self,
        agent_id: Uuid,
        reviewer: &str,
        now: DateTime<Utc>,
    ) -> Result<Agent, AppError> {
        let agent = self.get(agent_id).await?;
        if agent.status != AgentStatus::Suspended {
            return Err(AppError::InvalidTransition(format!(
                "{} -> {} is not a reinstatement",
                agent.status,
                AgentStatus::Approved
            )));
        }
        self.approve(agent_id, reviewer, now).await
    }

    pub async fn suspend(
        &self,
        agent_id: Uuid,
        reviewer: &str,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Agent, AppError> {
        self.transition(agent_id, AgentStatus::Suspended, reviewer, reason, None, now)
            .await
    }

    pub async fn reject(
        &self,
        agent_id: Uuid,
        reviewer: &str,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Agent, AppError> {
        self.transition(agent_id, AgentStatus::Rejected, reviewer, reason, None, now)
            .await
    }

    async fn transition(
        &self,
        agent_id: Uuid,
        to: AgentStatus,
        reviewer: &str,
        reason: Option<String>,
        opening: Option<&AccountOpening>,
        now: DateTime<Utc>,
    ) -> Result<Agent, AppError> {
        let change = AgentStatusChange {
            agent_id,
            from: AgentStatus::sources_of(to),
            to,
            reviewer: reviewer.to_string(),
            reason,
            at: now,
        };

        match self.store.transition_agent(&change, opening).await? {
            Some(agent) => {
                tracing::info!("Agent {} is now {} (by {})", agent_id, to, reviewer);
                self.events.emit(CoreEvent::AgentStatusChanged {
                    agent_id,
                    status: agent.status,
                });
                Ok(agent)
            }
            None => {
                let current = self.get(agent_id).await?;
                Err(AppError::InvalidTransition(format!(
                    "{} -> {}",
                    current.status, to
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zambian_mobile_numbers_normalize_to_e164() {
        assert_eq!(
            validate_zm_phone("0971234567").unwrap(),
            "+260971234567"
        );
        assert_eq!(
            validate_zm_phone("+260 97 123 4567").unwrap(),
            "+260971234567"
        );
    }

    #[test]
    fn short_or_garbage_phones_are_rejected() {
        assert!(validate_zm_phone("12345").is_err());
        assert!(validate_zm_phone("not a phone").is_err());
    }

    #[test]
    fn nrc_format_is_enforced() {
        assert_eq!(validate_nrc(" 123456/78/9 ").unwrap(), "123456/78/9");
        assert!(validate_nrc("12345/78/9").is_err());
        assert!(validate_nrc("123456-78-9").is_err());
    }
}
