//! Domain event publication.
//!
//! Events go to NATS when a client is configured; otherwise they are only
//! logged. Publishing never fails the operation that raised the event.

use crate::domain::events::DomainEvent;

#[derive(Clone, Default)]
pub struct EventPublisher {
    nats: Option<async_nats::Client>,
}

impl EventPublisher {
    pub fn new(nats: Option<async_nats::Client>) -> Self { Self { nats } }

    /// Publisher that only logs.
    pub fn disabled() -> Self { Self::default() }

    pub fn is_connected(&self) -> bool { self.nats.is_some() }

    pub async fn publish(&self, event: &DomainEvent) {
        let subject = event.subject();
        let payload = match serde_json::to_vec(event) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, %subject, "failed to serialize domain event");
                return;
            }
        };
        match &self.nats {
            Some(client) => {
                if let Err(e) = client.publish(subject.clone(), payload.into()).await {
                    tracing::warn!(error = %e, %subject, "failed to publish domain event");
                } else {
                    tracing::debug!(%subject, "domain event published");
                }
            }
            None => tracing::info!(%subject, event = ?event, "domain event"),
        }
    }

    pub async fn publish_all(&self, events: &[DomainEvent]) {
        for event in events {
            self.publish(event).await;
        }
    }
}
