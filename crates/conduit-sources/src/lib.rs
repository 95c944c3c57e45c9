//! Event source adapters feeding the polling worker.
//!
//! Every adapter yields events in strictly increasing id order per
//! organization. The worker polls with its checkpoint (the last id it
//! finished), then acknowledges each event once it has been handled. A
//! failed event is negatively acknowledged and still advances the position;
//! its deliveries have already reached the dead-letter queue.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use conduit_core::models::{Event, EventId};

pub mod config;
pub mod error;
pub mod factory;
pub mod push;
pub mod relational;
pub mod stream;

pub use config::{HttpPushSourceConfig, RelationalSourceConfig, SourceConfig, StreamSourceConfig};
pub use error::{Result, SourceError};
pub use factory::{build_source, SourceHandle};
pub use push::{HttpPushSource, PushedEvent};
pub use relational::RelationalSource;
pub use stream::StreamSource;

/// A feed of events the worker can poll.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Adapter kind, for logs.
    fn name(&self) -> &str;

    /// Up to `batch_size` events with id greater than `checkpoint`, in id
    /// order.
    async fn poll(&self, checkpoint: EventId, batch_size: usize) -> Result<Vec<Event>>;

    /// Marks an event handled.
    async fn ack(&self, event: &Event) -> Result<()>;

    /// Marks an event failed. Position still advances past it.
    async fn nack(&self, event: &Event) -> Result<()>;

    /// Id of the newest event currently available, used to seed a fresh
    /// checkpoint.
    async fn latest_position(&self) -> Result<EventId>;
}
