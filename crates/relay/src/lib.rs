//! Outbox relay.
//!
//! Polls committed outbox rows and hands them to an [`EventPublisher`].
//! A row is marked published only after the publisher confirms it; failed
//! publishes are retried with exponential backoff until the retry budget is
//! spent, then parked as `FAILED`.

pub mod backoff;
pub mod error;
pub mod publisher;
pub mod relay;

pub use backoff::RetryPolicy;
pub use error::{RelayError, Result};
pub use publisher::{EventPublisher, InMemoryPublisher, PublishedMessage, TracingPublisher};
pub use relay::{CycleReport, OutboxRelay, RelayConfig};
