use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;

use crate::config::EventsConfig;
use crate::entity::Entity;

use super::event::{DomainEvent, EventBatch};

/// Destination for committed domain events
#[async_trait]
pub trait EventSink<E: Entity>: Send + Sync {
    /// Sink name for logs
    fn name(&self) -> &str;

    /// Hand one event to the sink; an error triggers a retry
    async fn deliver(&self, event: &DomainEvent<E>) -> anyhow::Result<()>;
}

/// Sink that writes every event to the tracing log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

#[async_trait]
impl<E: Entity> EventSink<E> for TracingEventSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn deliver(&self, event: &DomainEvent<E>) -> anyhow::Result<()> {
        tracing::info!(
            event_id = %event.id,
            entity = %event.entity_name,
            entity_id = %event.entity_id,
            kind = %event.kind,
            permanent = event.permanent,
            actor = %event.actor,
            "Domain event"
        );
        Ok(())
    }
}

/// Fire-and-forget dispatcher for committed event batches
///
/// [`publish`](Self::publish) returns immediately; delivery runs on a tracked
/// background task which hands each event, in batch order, to all sinks at
/// once. The next event starts once every sink has finished the current one.
/// Failed deliveries are retried with exponential backoff up to
/// `max_delivery_attempts`, after which the event is dropped for that sink
/// and logged.
pub struct DomainEventPublisher<E: Entity> {
    sinks: Vec<Arc<dyn EventSink<E>>>,
    config: EventsConfig,
    tracker: TaskTracker,
}

impl<E: Entity> DomainEventPublisher<E> {
    /// Publisher without sinks
    pub fn new(config: EventsConfig) -> Self {
        Self {
            sinks: Vec::new(),
            config,
            tracker: TaskTracker::new(),
        }
    }

    /// Publisher that drops every batch
    pub fn disabled() -> Self {
        Self::new(EventsConfig {
            enabled: false,
            ..EventsConfig::default()
        })
    }

    /// Add a sink
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink<E>>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Configured sink names
    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|sink| sink.name()).collect()
    }

    /// Number of dispatch tasks still running
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Queue a committed batch for delivery
    ///
    /// Must be called from within a Tokio runtime.
    pub fn publish(&self, batch: EventBatch<E>) {
        if batch.is_empty() {
            return;
        }
        if !self.config.enabled || self.sinks.is_empty() {
            tracing::debug!(
                entity = E::entity_name(),
                events = batch.len(),
                "Event dispatch disabled, dropping batch"
            );
            return;
        }

        let sinks = self.sinks.clone();
        let attempts = self.config.max_delivery_attempts.max(1);
        let base_delay = Duration::from_millis(self.config.retry_delay_ms);

        self.tracker.spawn(async move {
            for event in batch {
                join_all(sinks.iter().map(|sink| {
                    deliver_with_retries(sink.as_ref(), &event, attempts, base_delay)
                }))
                .await;
            }
        });
    }

    /// Wait until every batch published so far has been handled
    pub async fn flush(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

impl<E: Entity> Default for DomainEventPublisher<E> {
    fn default() -> Self {
        Self::new(EventsConfig::default()).with_sink(Arc::new(TracingEventSink))
    }
}

impl<E: Entity> Clone for DomainEventPublisher<E> {
    fn clone(&self) -> Self {
        Self {
            sinks: self.sinks.clone(),
            config: self.config.clone(),
            tracker: self.tracker.clone(),
        }
    }
}

/// Deliver one event to one sink, retrying with exponential backoff
/// Longest pause between two delivery attempts
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Exponential backoff after the given failed attempt, capped at [`MAX_BACKOFF`]
fn backoff_delay(base_delay: Duration, attempt: u32) -> Duration {
    let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
    base_delay.saturating_mul(factor).min(MAX_BACKOFF)
}

async fn deliver_with_retries<E: Entity>(
    sink: &dyn EventSink<E>,
    event: &DomainEvent<E>,
    max_attempts: u32,
    base_delay: Duration,
) -> bool {
    let mut attempt = 0;

    loop {
        attempt += 1;
        match sink.deliver(event).await {
            Ok(()) => {
                if attempt > 1 {
                    tracing::info!(
                        sink = sink.name(),
                        event_id = %event.id,
                        "Event delivered after {} attempt(s)",
                        attempt
                    );
                }
                return true;
            }
            Err(e) => {
                if attempt >= max_attempts {
                    tracing::error!(
                        sink = sink.name(),
                        event_id = %event.id,
                        entity = %event.entity_name,
                        entity_id = %event.entity_id,
                        "Giving up on event after {} attempts: {:#}",
                        attempt,
                        e
                    );
                    return false;
                }

                let delay = backoff_delay(base_delay, attempt);
                tracing::warn!(
                    sink = sink.name(),
                    event_id = %event.id,
                    "Event delivery attempt {} failed: {:#}. Retrying in {:?}...",
                    attempt,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
