//! Push-model assignment of confirmed bookings with a response deadline.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::FloatConfig;
use crate::errors::AppError;
use crate::events::{CoreEvent, EventPublisher};
use crate::models::*;
use crate::store::{AssignmentOffer, FloatStore};

const SYSTEM_ACTOR: &str = "system";

#[derive(Clone)]
pub struct AssignmentWorkflow {
    store: Arc<dyn FloatStore>,
    events: EventPublisher,
    config: FloatConfig,
}

impl AssignmentWorkflow {
    pub fn new(store: Arc<dyn FloatStore>, events: EventPublisher, config: FloatConfig) -> Self {
        Self {
            store,
            events,
            config,
        }
    }

    /// Registers a booking from the surrounding booking system.
    pub async fn register_booking(
        &self,
        booking_reference: String,
        status: BookingStatus,
        now: DateTime<Utc>,
    ) -> Result<Booking, AppError> {
        if booking_reference.trim().is_empty() {
            return Err(AppError::BadRequest(
                "booking_reference is required".to_string(),
            ));
        }
        let booking = Booking {
            id: Uuid::new_v4(),
            booking_reference,
            status,
            assigned_agent_id: None,
            assignment_status: None,
            assignment_response_deadline: None,
            assigned_at: None,
            assigned_by: None,
            escalated: false,
            escalated_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_booking(&booking).await?;
        Ok(booking)
    }

    /// Offers a confirmed booking to an approved agent.
    pub async fn assign(
        &self,
        booking_id: Uuid,
        agent_id: Uuid,
        assigned_by: &str,
        timeout_minutes: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Booking, AppError> {
        // A lapsed offer must be expired before it can be replaced.
        self.expire_if_overdue(booking_id, now).await?;

        let minutes = timeout_minutes.unwrap_or(self.config.assignment_timeout_minutes);
        if minutes <= 0 {
            return Err(AppError::BadRequest(
                "timeout_minutes must be positive".to_string(),
            ));
        }
        let offer = AssignmentOffer {
            booking_id,
            agent_id,
            assigned_by: assigned_by.to_string(),
            deadline: now + Duration::minutes(minutes),
            at: now,
        };
        let booking = self.store.assign_booking(&offer).await?;

        tracing::info!(
            "Booking {} assigned to agent {} by {} (respond by {})",
            booking_id,
            agent_id,
            assigned_by,
            offer.deadline
        );
        self.events.emit(CoreEvent::AssignmentCreated {
            booking_id,
            agent_id,
            response_deadline: offer.deadline,
        });
        Ok(booking)
    }

    /// Accept or reject. Late responses expire the assignment and fail.
    pub async fn respond(
        &self,
        booking_id: Uuid,
        agent_id: Uuid,
        accept: bool,
        now: DateTime<Utc>,
    ) -> Result<Booking, AppError> {
        let booking = match self
            .store
            .respond_assignment(booking_id, agent_id, accept, now)
            .await
        {
            Ok(booking) => booking,
            Err(AppError::AssignmentExpired) => {
                tracing::info!(
                    "Agent {} responded late to booking {}",
                    agent_id,
                    booking_id
                );
                self.expire_if_overdue(booking_id, now).await?;
                return Err(AppError::AssignmentExpired);
            }
            Err(e) => return Err(e),
        };

        tracing::info!(
            "Agent {} {} booking {}",
            agent_id,
            if accept { "accepted" } else { "rejected" },
            booking_id
        );
        self.events.emit(CoreEvent::AssignmentResponded {
            booking_id,
            agent_id,
            accepted: accept,
        });

        if accept {
            return Ok(booking);
        }
        self.escalate(booking, agent_id, now).await
    }

    async fn expire_if_overdue(
        &self,
        booking_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Booking>, AppError> {
        let Some(expired) = self.store.expire_assignment(booking_id, now).await? else {
            return Ok(None);
        };
        let previous = expired.assigned_agent_id.unwrap_or_default();
        tracing::info!(
            "Assignment of booking {} to {} expired unanswered",
            booking_id,
            previous
        );
        Ok(Some(self.escalate(expired, previous, now).await?))
    }

    /// The booking is already marked escalated by the store; this re-offers it
    /// when auto-reassignment is on and a fresh candidate exists.
    async fn escalate(
        &self,
        booking: Booking,
        previous_agent_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Booking, AppError> {
        let mut reassigned_to = None;
        let mut current = booking;

        if self.config.auto_reassign {
            if let Some(candidate) = self
                .store
                .find_reassignment_candidate(current.id, previous_agent_id)
                .await?
            {
                let offer = AssignmentOffer {
                    booking_id: current.id,
                    agent_id: candidate,
                    assigned_by: SYSTEM_ACTOR.to_string(),
                    deadline: now + Duration::minutes(self.config.assignment_timeout_minutes),
                    at: now,
                };
                match self.store.assign_booking(&offer).await {
                    Ok(reassigned) => {
                        reassigned_to = Some(candidate);
                        self.events.emit(CoreEvent::AssignmentCreated {
                            booking_id: reassigned.id,
                            agent_id: candidate,
                            response_deadline: offer.deadline,
                        });
                        current = reassigned;
                    }
                    // Lost to a concurrent reassignment or the candidate changed status.
                    Err(e @ AppError::Conflict(_)) | Err(e @ AppError::AgentNotEligible) => {
                        tracing::warn!("Reassignment of booking {} skipped: {}", current.id, e);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        match reassigned_to {
            Some(agent) => tracing::info!("Booking {} escalated and re-offered to {}", current.id, agent),
            None => tracing::warn!("Booking {} escalated to admins, no agent re-offered", current.id),
        }
        self.events.emit(CoreEvent::AssignmentEscalated {
            booking_id: current.id,
            previous_agent_id,
            reassigned_to,
            escalated_at: current.escalated_at.unwrap_or(now),
        });
        Ok(current)
    }

    /// Sweep: expires and escalates every overdue assignment.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<usize, AppError> {
        let overdue = self.store.list_overdue_assignments(now).await?;
        let mut expired = 0;
        for booking_id in overdue {
            match self.expire_if_overdue(booking_id, now).await {
                Ok(Some(_)) => expired += 1,
                Ok(None) => {}
                Err(e) => tracing::error!("Failed to expire assignment {}: {}", booking_id, e),
            }
        }
        Ok(expired)
    }

    /// Reads a booking, applying any pending expiry first.
    pub async fn booking(&self, booking_id: Uuid, now: DateTime<Utc>) -> Result<Booking, AppError> {
        if let Some(booking) = self.expire_if_overdue(booking_id, now).await? {
            return Ok(booking);
        }
        self.store
            .get_booking(booking_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Booking {}", booking_id)))
    }

    pub async fn agent_assignments(
        &self,
        agent_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Booking>, AppError> {
        let assigned = self.store.list_agent_assignments(agent_id).await?;
        let mut any_expired = false;
        for booking in assigned.iter().filter(|b| b.is_response_overdue(now)) {
            any_expired |= self.expire_if_overdue(booking.id, now).await?.is_some();
        }
        if any_expired {
            return self.store.list_agent_assignments(agent_id).await;
        }
        Ok(assigned)
    }

    pub async fn history(&self, booking_id: Uuid) -> Result<Vec<AssignmentHistory>, AppError> {
        self.store
            .get_booking(booking_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Booking {}", booking_id)))?;
        self.store.assignment_history(booking_id).await
    }
}
