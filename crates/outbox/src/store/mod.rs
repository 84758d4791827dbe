//! Outbox persistence.
//!
//! Every write that changes a row's lifecycle is conditional on the row still
//! being non-terminal, and the claim is a compare-and-swap that re-checks the
//! due predicate. Two dispatchers racing on the same rows therefore never both
//! win, and a slow dispatcher whose claim expired cannot overwrite the outcome
//! recorded by the one that took over.

mod in_memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::message::{ClaimId, MessageId, OutboxMessage};

pub use in_memory::{InMemoryOutboxStore, InMemoryTransaction};
pub use postgres::{PgOutboxWriter, PostgresOutboxStore};

/// Outbox store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OutboxStoreError {
    #[error("outbox message not found: {0}")]
    NotFound(MessageId),
    #[error("outbox message already exists: {0}")]
    AlreadyExists(MessageId),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// The due predicate's inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Due {
    pub now: DateTime<Utc>,
    pub max_attempts: u32,
}

impl Due {
    pub fn at(now: DateTime<Utc>, max_attempts: u32) -> Self {
        Self { now, max_attempts }
    }

    pub fn matches(&self, message: &OutboxMessage) -> bool {
        message.is_due(self.now, self.max_attempts)
    }
}

/// A failed publish attempt, applied only if the row still has
/// `previous_attempts` attempts and is not terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedAttempt {
    pub previous_attempts: u32,
    /// Earliest time the row may be claimed again. `None` when `exhausted`.
    pub retry_at: Option<DateTime<Utc>>,
    pub error: String,
    /// The attempt budget is spent; the row is poisoned in the same write.
    pub exhausted: bool,
}

/// Row counts by [`MessageStatus`](crate::message::MessageStatus).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub backing_off: u64,
    pub claimed: u64,
    pub processed: u64,
    pub poisoned: u64,
    pub stalled: u64,
}

impl OutboxStats {
    pub fn total(&self) -> u64 {
        self.pending + self.backing_off + self.claimed + self.processed + self.poisoned + self.stalled
    }
}

/// Outbox store abstraction.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a new row outside any business transaction.
    async fn insert(&self, message: OutboxMessage) -> Result<(), OutboxStoreError>;

    /// Whether any row is due. Called on every poll, so implementations should
    /// keep it cheap and quiet.
    async fn has_due(&self, due: Due) -> Result<bool, OutboxStoreError>;

    /// Ids of up to `limit` due rows, oldest first.
    async fn select_due_ids(
        &self,
        due: Due,
        limit: usize,
    ) -> Result<Vec<MessageId>, OutboxStoreError>;

    /// Claim those of `ids` that are still due, returning how many were
    /// claimed. Zero means another instance won the race.
    async fn claim(
        &self,
        ids: &[MessageId],
        due: Due,
        claim: &ClaimId,
        until: DateTime<Utc>,
    ) -> Result<u64, OutboxStoreError>;

    /// Rows held by a live `claim`, oldest first.
    async fn fetch_claimed(
        &self,
        claim: &ClaimId,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, OutboxStoreError>;

    async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, OutboxStoreError>;

    /// Record a successful publish. Returns `false` if the row was already
    /// terminal.
    async fn mark_processed(
        &self,
        id: MessageId,
        now: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError>;

    /// Poison the row with `reason`. Returns `false` if it was already terminal.
    async fn mark_poisoned(&self, id: MessageId, reason: &str) -> Result<bool, OutboxStoreError>;

    /// Record a transient failure. Returns `false` if the row changed since it
    /// was read.
    async fn record_failure(
        &self,
        id: MessageId,
        attempt: &FailedAttempt,
    ) -> Result<bool, OutboxStoreError>;

    async fn stats(&self, due: Due) -> Result<OutboxStats, OutboxStoreError>;

    /// Return a poisoned or stalled row to the queue with a fresh attempt
    /// budget. Processed rows are never requeued.
    async fn requeue(&self, id: MessageId) -> Result<bool, OutboxStoreError>;
}

#[async_trait]
impl<S: OutboxStore + ?Sized> OutboxStore for std::sync::Arc<S> {
    async fn insert(&self, message: OutboxMessage) -> Result<(), OutboxStoreError> {
        (**self).insert(message).await
    }

    async fn has_due(&self, due: Due) -> Result<bool, OutboxStoreError> {
        (**self).has_due(due).await
    }

    async fn select_due_ids(
        &self,
        due: Due,
        limit: usize,
    ) -> Result<Vec<MessageId>, OutboxStoreError> {
        (**self).select_due_ids(due, limit).await
    }

    async fn claim(
        &self,
        ids: &[MessageId],
        due: Due,
        claim: &ClaimId,
        until: DateTime<Utc>,
    ) -> Result<u64, OutboxStoreError> {
        (**self).claim(ids, due, claim, until).await
    }

    async fn fetch_claimed(
        &self,
        claim: &ClaimId,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, OutboxStoreError> {
        (**self).fetch_claimed(claim, now).await
    }

    async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, OutboxStoreError> {
        (**self).get(id).await
    }

    async fn mark_processed(
        &self,
        id: MessageId,
        now: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError> {
        (**self).mark_processed(id, now).await
    }

    async fn mark_poisoned(&self, id: MessageId, reason: &str) -> Result<bool, OutboxStoreError> {
        (**self).mark_poisoned(id, reason).await
    }

    async fn record_failure(
        &self,
        id: MessageId,
        attempt: &FailedAttempt,
    ) -> Result<bool, OutboxStoreError> {
        (**self).record_failure(id, attempt).await
    }

    async fn stats(&self, due: Due) -> Result<OutboxStats, OutboxStoreError> {
        (**self).stats(due).await
    }

    async fn requeue(&self, id: MessageId) -> Result<bool, OutboxStoreError> {
        (**self).requeue(id).await
    }
}

/// Destination for rows produced by [`OutboxEnqueuer`](crate::OutboxEnqueuer).
///
/// Transactional writers stage the row in the caller's unit of work so it
/// commits or rolls back with the business change. [`DirectWriter`] inserts
/// immediately.
#[async_trait]
pub trait OutboxWriter: Send {
    async fn write(&mut self, message: OutboxMessage) -> Result<(), OutboxStoreError>;
}

/// Writes straight to a store, outside any transaction.
pub struct DirectWriter<'a, S: ?Sized>(pub &'a S);

#[async_trait]
impl<S: OutboxStore + ?Sized> OutboxWriter for DirectWriter<'_, S> {
    async fn write(&mut self, message: OutboxMessage) -> Result<(), OutboxStoreError> {
        self.0.insert(message).await
    }
}
