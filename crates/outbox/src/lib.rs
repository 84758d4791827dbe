//! Transactional outbox: enqueue events alongside business changes, then
//! publish them to a broker from any number of dispatcher instances.

pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod enqueuer;
pub mod message;
pub mod metrics;
pub mod store;
pub mod trace_sink;

#[cfg(feature = "redis")]
pub mod redis_streams;

mod integration_tests;

pub use backoff::{BackoffPolicy, BackoffStrategy};
pub use config::{ConfigError, DispatcherConfig};
pub use dispatcher::{
    BatchReport, DispatchError, DispatcherHandle, IterationOutcome, MessageOutcome,
    OutboxDispatcher, PoisonReason,
};
pub use enqueuer::{EnqueueError, OutboxEnqueuer};
pub use message::{ClaimId, MessageId, MessageStatus, OutboxKind, OutboxMessage};
pub use crate::metrics::{DispatchMetrics, DispatchStats, MetricsFacade, NoopMetrics, RecordingMetrics};
pub use store::{
    DirectWriter, Due, FailedAttempt, InMemoryOutboxStore, InMemoryTransaction, OutboxStats,
    OutboxStore, OutboxStoreError, OutboxWriter, PgOutboxWriter, PostgresOutboxStore,
};
pub use trace_sink::{NoopTraceSink, PublishSpan, TraceSink, TracingSink};

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsPublisher;
