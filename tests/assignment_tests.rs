/// Push-model booking assignment: responses, deadlines and escalation.
mod common;

use agent_float_api::config::FloatConfig;
use agent_float_api::errors::AppError;
use agent_float_api::events::CoreEvent;
use agent_float_api::models::*;
use chrono::{Duration, Utc};
use common::Harness;

fn actions(history: &[AssignmentHistory]) -> Vec<AssignmentAction> {
    history.iter().map(|h| h.action).collect()
}

#[tokio::test]
async fn accepted_assignment_stays_with_the_agent() {
    let mut h = Harness::new(FloatConfig::default());
    let now = Utc::now();
    let agent = h.approved_agent(now).await;
    let workflow = &h.services.assignments;

    let booking = workflow
        .register_booking("BK-1001".to_string(), BookingStatus::Confirmed, now)
        .await
        .unwrap();
    let offered = workflow
        .assign(booking.id, agent, "ops@test", None, now)
        .await
        .unwrap();
    assert_eq!(offered.assignment_status, Some(AssignmentStatus::Pending));
    assert_eq!(
        offered.assignment_response_deadline,
        Some(now + Duration::minutes(30))
    );

    let accepted = workflow
        .respond(booking.id, agent, true, now + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(accepted.assignment_status, Some(AssignmentStatus::Accepted));
    assert!(!accepted.escalated);

    // A settled assignment cannot be answered again
    let err = workflow
        .respond(booking.id, agent, false, now + Duration::minutes(6))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition(_)));

    let names: Vec<&str> = h.drain_events().iter().map(|e| e.name()).collect();
    assert!(names.contains(&"assignment_created"));
    assert!(names.contains(&"assignment_responded"));
    assert!(!names.contains(&"assignment_escalated"));
}

#[tokio::test]
async fn rejection_escalates_and_reoffers_to_another_agent() {
    let mut h = Harness::new(FloatConfig::default());
    let now = Utc::now();
    let first = h.approved_agent(now).await;
    let second = h.approved_agent(now).await;
    let workflow = &h.services.assignments;

    let booking = workflow
        .register_booking("BK-1002".to_string(), BookingStatus::Confirmed, now)
        .await
        .unwrap();
    workflow
        .assign(booking.id, first, "ops@test", None, now)
        .await
        .unwrap();

    let after = workflow
        .respond(booking.id, first, false, now)
        .await
        .unwrap();
    assert!(after.escalated);
    assert_eq!(after.assigned_agent_id, Some(second));
    assert_eq!(after.assignment_status, Some(AssignmentStatus::Pending));
    assert_eq!(after.assigned_by.as_deref(), Some("system"));

    let history = workflow.history(booking.id).await.unwrap();
    assert_eq!(
        actions(&history),
        vec![
            AssignmentAction::Assigned,
            AssignmentAction::Rejected,
            AssignmentAction::Escalated,
            AssignmentAction::Assigned,
        ]
    );

    let escalations: Vec<CoreEvent> = h
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, CoreEvent::AssignmentEscalated { .. }))
        .collect();
    assert_eq!(escalations.len(), 1);
    assert!(matches!(
        escalations[0],
        CoreEvent::AssignmentEscalated {
            reassigned_to: Some(agent),
            ..
        } if agent == second
    ));
}

#[tokio::test]
async fn late_response_expires_the_assignment() {
    let h = Harness::new(FloatConfig::default());
    let now = Utc::now();
    let first = h.approved_agent(now).await;
    let second = h.approved_agent(now).await;
    let workflow = &h.services.assignments;

    let booking = workflow
        .register_booking("BK-1003".to_string(), BookingStatus::Confirmed, now)
        .await
        .unwrap();
    workflow
        .assign(booking.id, first, "ops@test", Some(10), now)
        .await
        .unwrap();

    let late = now + Duration::minutes(11);
    let err = workflow
        .respond(booking.id, first, true, late)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::AssignmentExpired));

    let current = workflow.booking(booking.id, late).await.unwrap();
    assert!(current.escalated);
    assert_eq!(current.assigned_agent_id, Some(second));

    let history = workflow.history(booking.id).await.unwrap();
    assert_eq!(
        actions(&history),
        vec![
            AssignmentAction::Assigned,
            AssignmentAction::Expired,
            AssignmentAction::Escalated,
            AssignmentAction::Assigned,
        ]
    );
}

#[tokio::test]
async fn without_auto_reassign_expired_bookings_wait_for_admins() {
    let config = FloatConfig {
        auto_reassign: false,
        ..FloatConfig::default()
    };
    let h = Harness::new(config);
    let now = Utc::now();
    let first = h.approved_agent(now).await;
    let second = h.approved_agent(now).await;
    let workflow = &h.services.assignments;

    let booking = workflow
        .register_booking("BK-1004".to_string(), BookingStatus::Confirmed, now)
        .await
        .unwrap();
    workflow
        .assign(booking.id, first, "ops@test", None, now)
        .await
        .unwrap();

    let later = now + Duration::minutes(31);
    let expired = workflow.booking(booking.id, later).await.unwrap();
    assert_eq!(expired.assignment_status, Some(AssignmentStatus::Expired));
    assert!(expired.escalated);
    assert_eq!(expired.assigned_agent_id, Some(first));

    // An admin can re-offer an expired booking by hand
    let manual = workflow
        .assign(booking.id, second, "ops@test", None, later)
        .await
        .unwrap();
    assert_eq!(manual.assigned_agent_id, Some(second));
    assert_eq!(manual.assignment_status, Some(AssignmentStatus::Pending));
}

#[tokio::test]
async fn escalation_without_candidates_leaves_booking_unassigned() {
    let h = Harness::new(FloatConfig::default());
    let now = Utc::now();
    let only = h.approved_agent(now).await;
    let workflow = &h.services.assignments;

    let booking = workflow
        .register_booking("BK-1005".to_string(), BookingStatus::Confirmed, now)
        .await
        .unwrap();
    workflow
        .assign(booking.id, only, "ops@test", None, now)
        .await
        .unwrap();
    let after = workflow.respond(booking.id, only, false, now).await.unwrap();

    assert!(after.escalated);
    assert_eq!(after.assignment_status, Some(AssignmentStatus::Rejected));
}

#[tokio::test]
async fn only_confirmed_bookings_and_approved_agents_can_be_assigned() {
    let h = Harness::new(FloatConfig::default());
    let now = Utc::now();
    let agent = h.approved_agent(now).await;
    let pending_agent = h
        .services
        .agents
        .register(common::new_agent(), now)
        .await
        .unwrap();
    let workflow = &h.services.assignments;

    let unconfirmed = workflow
        .register_booking("BK-1006".to_string(), BookingStatus::Pending, now)
        .await
        .unwrap();
    assert!(matches!(
        workflow.assign(unconfirmed.id, agent, "ops@test", None, now).await,
        Err(AppError::InvalidTransition(_))
    ));

    let confirmed = workflow
        .register_booking("BK-1007".to_string(), BookingStatus::Confirmed, now)
        .await
        .unwrap();
    assert!(matches!(
        workflow
            .assign(confirmed.id, pending_agent.id, "ops@test", None, now)
            .await,
        Err(AppError::AgentNotEligible)
    ));

    workflow
        .assign(confirmed.id, agent, "ops@test", None, now)
        .await
        .unwrap();
    // A live offer cannot be replaced
    assert!(matches!(
        workflow.assign(confirmed.id, agent, "ops@test", None, now).await,
        Err(AppError::Conflict(_))
    ));
}

#[tokio::test]
async fn sweep_expires_overdue_assignments() {
    let config = FloatConfig {
        auto_reassign: false,
        ..FloatConfig::default()
    };
    let h = Harness::new(config);
    let now = Utc::now();
    let agent = h.approved_agent(now).await;
    let workflow = &h.services.assignments;

    for reference in ["BK-2001", "BK-2002"] {
        let booking = workflow
            .register_booking(reference.to_string(), BookingStatus::Confirmed, now)
            .await
            .unwrap();
        workflow
            .assign(booking.id, agent, "ops@test", Some(5), now)
            .await
            .unwrap();
    }

    let report = h.services.sweep(now + Duration::minutes(6)).await.unwrap();
    assert_eq!(report.expired_assignments, 2);

    let mine = workflow
        .agent_assignments(agent, now + Duration::minutes(6))
        .await
        .unwrap();
    assert!(mine
        .iter()
        .all(|b| b.assignment_status == Some(AssignmentStatus::Expired)));
}
