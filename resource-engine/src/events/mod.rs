//! Post-commit domain events
//!
//! Repository writes record a [`DomainEvent`] in their unit of work. The
//! resulting [`EventBatch`] is only released by a successful commit and is
//! then handed to a [`DomainEventPublisher`], which delivers it to its
//! [`EventSink`]s on a background task. A rolled-back unit of work never
//! produces events.
//!
//! Sinks:
//!
//! - [`TracingEventSink`]: logs every event (default)
//! - `NatsEventSink`: publishes JSON to NATS (`events` feature)
//! - anything implementing [`EventSink`]

mod event;
#[cfg(feature = "events")]
mod nats;
mod publisher;

pub use event::{DomainEvent, DomainEventKind, EventBatch};
#[cfg(feature = "events")]
pub use nats::NatsEventSink;
pub use publisher::{DomainEventPublisher, EventSink, TracingEventSink};
