//! In-memory outbox store for tests and local development.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Due, FailedAttempt, OutboxStats, OutboxStore, OutboxStoreError, OutboxWriter};
use crate::message::{ClaimId, MessageId, MessageStatus, OutboxMessage};

/// In-memory outbox store.
///
/// A single lock guards all rows, so each operation is atomic with respect to
/// every other, which is what the conditional updates of a real database give.
#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    rows: RwLock<HashMap<MessageId, OutboxMessage>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Start a unit of work whose rows become visible on [`commit`](InMemoryTransaction::commit).
    pub fn begin(&self) -> InMemoryTransaction<'_> {
        InMemoryTransaction {
            store: self,
            staged: Vec::new(),
        }
    }

    /// All rows, oldest first.
    pub fn snapshot(&self) -> Result<Vec<OutboxMessage>, OutboxStoreError> {
        let rows = self.read()?;
        let mut all: Vec<_> = rows.values().cloned().collect();
        sort_oldest_first(&mut all);
        Ok(all)
    }

    /// Apply `f` to a stored row. For tests that need to stage a specific state.
    pub fn update_with(
        &self,
        id: MessageId,
        f: impl FnOnce(&mut OutboxMessage),
    ) -> Result<(), OutboxStoreError> {
        let mut rows = self.write()?;
        let row = rows.get_mut(&id).ok_or(OutboxStoreError::NotFound(id))?;
        f(row);
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<MessageId, OutboxMessage>>, OutboxStoreError> {
        self.rows
            .read()
            .map_err(|_| OutboxStoreError::Storage("outbox lock poisoned".into()))
    }

    fn write(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<MessageId, OutboxMessage>>, OutboxStoreError> {
        self.rows
            .write()
            .map_err(|_| OutboxStoreError::Storage("outbox lock poisoned".into()))
    }

    fn insert_all(&self, messages: Vec<OutboxMessage>) -> Result<usize, OutboxStoreError> {
        let mut rows = self.write()?;
        if let Some(dup) = messages.iter().find(|m| rows.contains_key(&m.id)) {
            return Err(OutboxStoreError::AlreadyExists(dup.id));
        }
        let count = messages.len();
        rows.extend(messages.into_iter().map(|m| (m.id, m)));
        Ok(count)
    }

    /// Apply `f` to a non-terminal row. Returns whether it was applied.
    fn update_live(
        &self,
        id: MessageId,
        f: impl FnOnce(&mut OutboxMessage) -> bool,
    ) -> Result<bool, OutboxStoreError> {
        let mut rows = self.write()?;
        match rows.get_mut(&id) {
            Some(row) if !row.is_terminal() => Ok(f(row)),
            _ => Ok(false),
        }
    }
}

fn sort_oldest_first(rows: &mut [OutboxMessage]) {
    rows.sort_by(|a, b| a.created_utc.cmp(&b.created_utc).then(a.id.cmp(&b.id)));
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn insert(&self, message: OutboxMessage) -> Result<(), OutboxStoreError> {
        self.insert_all(vec![message]).map(|_| ())
    }

    async fn has_due(&self, due: Due) -> Result<bool, OutboxStoreError> {
        Ok(self.read()?.values().any(|m| due.matches(m)))
    }

    async fn select_due_ids(
        &self,
        due: Due,
        limit: usize,
    ) -> Result<Vec<MessageId>, OutboxStoreError> {
        let rows = self.read()?;
        let mut candidates: Vec<_> = rows.values().filter(|m| due.matches(m)).cloned().collect();
        sort_oldest_first(&mut candidates);
        Ok(candidates.into_iter().take(limit).map(|m| m.id).collect())
    }

    async fn claim(
        &self,
        ids: &[MessageId],
        due: Due,
        claim: &ClaimId,
        until: DateTime<Utc>,
    ) -> Result<u64, OutboxStoreError> {
        let mut rows = self.write()?;
        let mut claimed = 0;
        for id in ids {
            if let Some(row) = rows.get_mut(id) {
                if due.matches(row) {
                    row.claimed_by = Some(claim.clone());
                    row.claimed_until = Some(until);
                    claimed += 1;
                }
            }
        }
        Ok(claimed)
    }

    async fn fetch_claimed(
        &self,
        claim: &ClaimId,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, OutboxStoreError> {
        let rows = self.read()?;
        let mut owned: Vec<_> = rows
            .values()
            .filter(|m| m.is_claimed_by(claim, now))
            .cloned()
            .collect();
        sort_oldest_first(&mut owned);
        Ok(owned)
    }

    async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, OutboxStoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn mark_processed(
        &self,
        id: MessageId,
        now: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError> {
        self.update_live(id, |row| {
            row.processed_utc = Some(now);
            true
        })
    }

    async fn mark_poisoned(&self, id: MessageId, reason: &str) -> Result<bool, OutboxStoreError> {
        self.update_live(id, |row| {
            row.is_poisoned = true;
            row.last_error = Some(reason.to_string());
            true
        })
    }

    async fn record_failure(
        &self,
        id: MessageId,
        attempt: &FailedAttempt,
    ) -> Result<bool, OutboxStoreError> {
        self.update_live(id, |row| {
            if row.attempts != attempt.previous_attempts {
                return false;
            }
            row.attempts = attempt.previous_attempts + 1;
            row.do_not_process_before_utc = attempt.retry_at;
            row.last_error = Some(attempt.error.clone());
            row.is_poisoned = attempt.exhausted;
            true
        })
    }

    async fn stats(&self, due: Due) -> Result<OutboxStats, OutboxStoreError> {
        let rows = self.read()?;
        let mut stats = OutboxStats::default();
        for row in rows.values() {
            match row.status(due.now, due.max_attempts) {
                MessageStatus::Pending => stats.pending += 1,
                MessageStatus::BackingOff => stats.backing_off += 1,
                MessageStatus::Claimed => stats.claimed += 1,
                MessageStatus::Processed => stats.processed += 1,
                MessageStatus::Poisoned => stats.poisoned += 1,
                MessageStatus::Stalled => stats.stalled += 1,
            }
        }
        Ok(stats)
    }

    async fn requeue(&self, id: MessageId) -> Result<bool, OutboxStoreError> {
        let mut rows = self.write()?;
        match rows.get_mut(&id) {
            Some(row) if row.processed_utc.is_none() && (row.is_poisoned || row.attempts > 0) => {
                row.is_poisoned = false;
                row.attempts = 0;
                row.do_not_process_before_utc = None;
                row.claimed_by = None;
                row.claimed_until = None;
                row.last_error = None;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(OutboxStoreError::NotFound(id)),
        }
    }
}

/// Unit of work against an [`InMemoryOutboxStore`]. Dropping it without
/// committing discards the staged rows.
#[derive(Debug)]
pub struct InMemoryTransaction<'a> {
    store: &'a InMemoryOutboxStore,
    staged: Vec<OutboxMessage>,
}

impl InMemoryTransaction<'_> {
    /// Make every staged row visible at once. Returns the number written.
    pub fn commit(self) -> Result<usize, OutboxStoreError> {
        self.store.insert_all(self.staged)
    }

    pub fn rollback(self) {}

    pub fn staged(&self) -> &[OutboxMessage] {
        &self.staged
    }
}

#[async_trait]
impl OutboxWriter for InMemoryTransaction<'_> {
    async fn write(&mut self, message: OutboxMessage) -> Result<(), OutboxStoreError> {
        self.staged.push(message);
        Ok(())
    }
}
