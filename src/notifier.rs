use failsafe::futures::CircuitBreaker;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::circuit_breaker::{create_notifier_circuit_breaker, NotifierBreaker};
use crate::errors::AppError;
use crate::events::CoreEvent;

/// Posts core events as JSON to the notification service.
pub struct NotificationClient {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    breaker: NotifierBreaker,
}

impl NotificationClient {
    pub fn new(url: String, token: Option<String>) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| {
                AppError::ExternalApiError(format!("Failed to create notification client: {}", e))
            })?;

        Ok(Self {
            client,
            url,
            token,
            breaker: create_notifier_circuit_breaker(),
        })
    }

    pub async fn send(&self, event: &CoreEvent) -> Result<(), AppError> {
        let mut request = self.client.post(&self.url).json(event);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let delivery = async move {
            request.send().await?.error_for_status()?;
            Ok::<(), reqwest::Error>(())
        };

        match self.breaker.call(delivery).await {
            Ok(()) => {
                tracing::debug!("Delivered {} notification", event.name());
                Ok(())
            }
            Err(failsafe::Error::Rejected) => Err(AppError::ExternalApiError(
                "Notification circuit open".to_string(),
            )),
            Err(failsafe::Error::Inner(e)) => Err(AppError::ExternalApiError(format!(
                "Notification delivery failed: {}",
                e
            ))),
        }
    }
}

/// Drains published events. Without a client events are only logged.
pub fn spawn_dispatcher(
    mut events: UnboundedReceiver<CoreEvent>,
    client: Option<NotificationClient>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(ref client) = client else {
                tracing::info!(event = event.name(), "notification (no webhook configured)");
                continue;
            };
            if let Err(e) = client.send(&event).await {
                tracing::warn!(event = event.name(), "Dropping notification: {}", e);
            }
        }
        tracing::info!("Event dispatcher stopped");
    })
}
