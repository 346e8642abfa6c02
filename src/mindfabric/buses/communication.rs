//! Communication bus.
//!
//! Routes message delivery and retrieval to the registered
//! [`CommunicationService`] providers. `send_message` is fire-and-forget
//! (queued, delivered by the worker); `send_message_sync` and
//! `fetch_messages` bypass the queue because the caller needs the result.

use crate::mindfabric::buses::base::{BusCore, BusEnvelope, BusStats, MessageProcessor};
use crate::mindfabric::registry::ServiceRegistry;
use crate::mindfabric::service::{capability, FetchedMessage, ServiceType};
use async_trait::async_trait;
use log::{debug, error, warn};
use std::sync::Arc;

/// A queued outbound message.
pub struct SendMessageRequest {
    pub envelope: BusEnvelope,
    pub channel_id: String,
    pub content: String,
}

struct CommunicationWorker {
    registry: Arc<ServiceRegistry>,
}

#[async_trait]
impl MessageProcessor<SendMessageRequest> for CommunicationWorker {
    async fn process_message(&self, request: SendMessageRequest) -> Result<(), String> {
        let registration = self
            .registry
            .communication
            .get(&request.envelope.handler_name, &[capability::SEND_MESSAGE])
            .await
            .ok_or_else(|| {
                format!(
                    "no communication service available for {}",
                    request.envelope.handler_name
                )
            })?;

        match registration
            .service
            .send_message(&request.channel_id, &request.content)
            .await
        {
            Ok(true) => {
                debug!(
                    "sent message to {} via {}",
                    request.channel_id, registration.name
                );
                Ok(())
            }
            Ok(false) => Err(format!(
                "provider {} declined message to {}",
                registration.name, request.channel_id
            )),
            Err(e) => Err(format!(
                "provider {} failed to send to {}: {}",
                registration.name, request.channel_id, e
            )),
        }
    }
}

/// Typed facade over communication providers.
pub struct CommunicationBus {
    core: BusCore<SendMessageRequest>,
    registry: Arc<ServiceRegistry>,
}

impl CommunicationBus {
    pub fn new(registry: Arc<ServiceRegistry>, max_queue_size: usize) -> Self {
        Self {
            core: BusCore::new(ServiceType::Communication, max_queue_size),
            registry,
        }
    }

    pub async fn start(&self) {
        self.core
            .start(Arc::new(CommunicationWorker {
                registry: Arc::clone(&self.registry),
            }))
            .await;
    }

    pub async fn stop(&self) {
        self.core.stop().await;
    }

    /// Queue a message for delivery. Returns `true` if it was accepted;
    /// the caller gets no completion signal.
    pub async fn send_message(
        &self,
        channel_id: impl Into<String>,
        content: impl Into<String>,
        handler_name: &str,
    ) -> bool {
        let accepted = self.core.enqueue(SendMessageRequest {
            envelope: BusEnvelope::new(handler_name),
            channel_id: channel_id.into(),
            content: content.into(),
        });
        if accepted {
            debug!("queued send_message for handler {}", handler_name);
        }
        accepted
    }

    /// Send a message and wait for the provider to confirm delivery.
    pub async fn send_message_sync(
        &self,
        channel_id: &str,
        content: &str,
        handler_name: &str,
    ) -> bool {
        let registration = match self
            .registry
            .communication
            .get(handler_name, &[capability::SEND_MESSAGE])
            .await
        {
            Some(r) => r,
            None => {
                error!("no communication service available for {}", handler_name);
                return false;
            }
        };

        match registration.service.send_message(channel_id, content).await {
            Ok(result) => result,
            Err(e) => {
                error!(
                    "communication provider {} failed for {}: {}",
                    registration.name, handler_name, e
                );
                false
            }
        }
    }

    /// Fetch recent messages from a channel.
    pub async fn fetch_messages(
        &self,
        channel_id: &str,
        limit: usize,
        handler_name: &str,
    ) -> Vec<FetchedMessage> {
        let registration = match self
            .registry
            .communication
            .get(handler_name, &[capability::FETCH_MESSAGES])
            .await
        {
            Some(r) => r,
            None => {
                error!("no communication service available for {}", handler_name);
                return Vec::new();
            }
        };

        match registration.service.fetch_messages(channel_id, limit).await {
            Ok(messages) => messages,
            Err(e) => {
                error!(
                    "communication provider {} failed to fetch from {}: {}",
                    registration.name, channel_id, e
                );
                Vec::new()
            }
        }
    }

    /// Health of the preferred provider for `handler_name`.
    pub async fn is_healthy(&self, handler_name: &str) -> bool {
        match self.registry.communication.get(handler_name, &[]).await {
            Some(registration) => registration.service.is_healthy().await,
            None => {
                warn!("no communication service registered for {}", handler_name);
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    pub fn queue_size(&self) -> usize {
        self.core.queue_size()
    }

    pub fn capacity(&self) -> usize {
        self.core.capacity()
    }

    pub fn stats(&self) -> BusStats {
        self.core.stats()
    }
}
