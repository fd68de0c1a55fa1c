//! NATS event sink
//!
//! Events are published as JSON on `{prefix}.{entity}.{kind}`, e.g.
//! `resources.widget.updated`.

use async_nats::Client;
use async_trait::async_trait;
use std::time::Duration;

use crate::config::NatsConfig;
use crate::entity::Entity;
use crate::error::{Error, Result};

use super::event::DomainEvent;
use super::publisher::EventSink;

/// Sink publishing domain events to NATS
#[derive(Clone)]
pub struct NatsEventSink {
    client: Client,
    subject_prefix: String,
}

impl NatsEventSink {
    /// Wrap an existing client
    pub fn new(client: Client, subject_prefix: impl Into<String>) -> Self {
        Self {
            client,
            subject_prefix: subject_prefix.into(),
        }
    }

    /// Connect with retries as configured
    pub async fn connect(config: &NatsConfig, subject_prefix: impl Into<String>) -> Result<Self> {
        let client = create_client_with_retries(config, config.max_retries).await?;
        Ok(Self::new(client, subject_prefix))
    }

    /// Subject an event of `entity` and `kind` is published on
    pub fn subject(&self, entity: &str, kind: impl std::fmt::Display) -> String {
        subject_for(&self.subject_prefix, entity, kind)
    }
}

fn subject_for(prefix: &str, entity: &str, kind: impl std::fmt::Display) -> String {
    format!("{}.{}.{}", prefix, entity.to_lowercase(), kind)
}

#[async_trait]
impl<E: Entity> EventSink<E> for NatsEventSink {
    fn name(&self) -> &str {
        "nats"
    }

    async fn deliver(&self, event: &DomainEvent<E>) -> anyhow::Result<()> {
        let subject = self.subject(&event.entity_name, event.kind);
        publish_json(&self.client, &subject, event).await?;
        Ok(())
    }
}

/// Publish a JSON payload to NATS
async fn publish_json<T: serde::Serialize>(client: &Client, subject: &str, payload: &T) -> Result<()> {
    let json = serde_json::to_vec(payload)
        .map_err(|e| Error::Internal(format!("Failed to serialize event: {}", e)))?;

    client
        .publish(subject.to_string(), json.into())
        .await
        .map_err(|e| Error::Nats(format!("Failed to publish to {}: {}", subject, e)))?;

    Ok(())
}

/// Create a NATS client with configurable retries
///
/// Uses exponential backoff strategy for retries
async fn create_client_with_retries(config: &NatsConfig, max_retries: u32) -> Result<Client> {
    let mut attempt = 0;
    let base_delay = Duration::from_secs(config.retry_delay_secs);

    loop {
        match try_create_client(config).await {
            Ok(client) => {
                if attempt > 0 {
                    tracing::info!(
                        "NATS connection established after {} attempt(s)",
                        attempt + 1
                    );
                } else {
                    tracing::info!("NATS client connected to {}", config.url);
                }
                return Ok(client);
            }
            Err(e) => {
                attempt += 1;

                if attempt > max_retries {
                    tracing::error!(
                        "Failed to connect to NATS after {} attempts: {}",
                        max_retries + 1,
                        e
                    );
                    return Err(e);
                }

                let delay = base_delay * 2_u32.pow(attempt.saturating_sub(1));
                tracing::warn!(
                    "NATS connection attempt {} failed: {}. Retrying in {:?}...",
                    attempt,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Attempt to create a NATS client (single try)
async fn try_create_client(config: &NatsConfig) -> Result<Client> {
    let mut opts = async_nats::ConnectOptions::new();
    if let Some(name) = &config.name {
        opts = opts.name(name);
    }
    opts = opts.max_reconnects(Some(config.max_reconnects));

    opts.connect(&config.url).await.map_err(|e| {
        Error::Nats(format!(
            "Failed to connect to NATS server at '{}' (client name: {}): {}",
            config.url,
            config.name.as_deref().unwrap_or("<none>"),
            e
        ))
    })
}
