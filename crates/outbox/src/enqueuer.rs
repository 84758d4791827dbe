//! Producer side: turn an event envelope into an outbox row.

use std::sync::Arc;

use tracing::debug;

use brushwork_core::{Clock, SystemClock};
use brushwork_events::{Event, EventEnvelope};

use crate::message::{MessageId, OutboxMessage};
use crate::store::{OutboxStoreError, OutboxWriter};
use crate::trace_sink::{TraceSink, TracingSink};

/// Enqueue failure. Nothing is retried here; the caller's unit of work decides.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("failed to serialize {event} payload: {source}")]
    Serialization {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Store(#[from] OutboxStoreError),
}

/// Writes outbox rows through the caller's [`OutboxWriter`].
#[derive(Clone)]
pub struct OutboxEnqueuer {
    clock: Arc<dyn Clock>,
    trace: Arc<dyn TraceSink>,
}

impl Default for OutboxEnqueuer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboxEnqueuer {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            trace: Arc::new(TracingSink),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_trace_sink(mut self, trace: Arc<dyn TraceSink>) -> Self {
        self.trace = trace;
        self
    }

    /// Stage one row for `envelope` in `writer` and return its id.
    ///
    /// The row is only durable once the writer's unit of work commits.
    pub async fn enqueue<E, W>(
        &self,
        writer: &mut W,
        envelope: &EventEnvelope<E>,
    ) -> Result<MessageId, EnqueueError>
    where
        E: Event,
        W: OutboxWriter + ?Sized,
    {
        let payload =
            serde_json::to_string(envelope.payload()).map_err(|source| EnqueueError::Serialization {
                event: E::NAME,
                source,
            })?;
        let trace = self.trace.current_context();
        let message = OutboxMessage::from_envelope(envelope, payload, self.clock.now(), trace.as_ref());
        let id = message.id;

        writer.write(message).await?;
        debug!(message_id = %id, event = E::NAME, version = E::VERSION, "outbox message enqueued");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DirectWriter, InMemoryOutboxStore, OutboxStore};
    use crate::trace_sink::NoopTraceSink;
    use brushwork_core::{ManualClock, TenantId, UserId};
    use brushwork_events::TraceContext;
    use brushwork_events::catalog::domain::UserRegistered;
    use brushwork_events::trace;
    use chrono::Utc;

    fn registered(tenant_id: TenantId) -> EventEnvelope<UserRegistered> {
        let event = UserRegistered {
            user_id: UserId::new(),
            tenant_id,
            username: "ada".into(),
            email: "ada@example.com".into(),
            occurred_at: Utc::now(),
        };
        EventEnvelope::new(tenant_id, "ada", event)
            .with_correlation_id("req-42")
            .with_causation_id("cmd-7")
    }

    #[tokio::test]
    async fn enqueue_writes_a_fresh_row() {
        let store = InMemoryOutboxStore::new();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let enqueuer = OutboxEnqueuer::new()
            .with_clock(clock.clone())
            .with_trace_sink(Arc::new(NoopTraceSink));
        let tenant = TenantId::new();
        let envelope = registered(tenant);

        let id = enqueuer
            .enqueue(&mut DirectWriter(&store), &envelope)
            .await
            .unwrap();

        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.name, "UserRegistered");
        assert_eq!(row.version, 1);
        assert_eq!(row.tenant_id, tenant);
        assert_eq!(row.username, "ada");
        assert_eq!(row.correlation_id.as_deref(), Some("req-42"));
        assert_eq!(row.causation_id.as_deref(), Some("cmd-7"));
        assert_eq!(row.created_utc, clock.now());
        assert_eq!(row.attempts, 0);
        assert!(row.processed_utc.is_none());
        assert!(row.claimed_by.is_none());
        assert!(row.trace_id.is_none());

        let payload: UserRegistered = serde_json::from_str(&row.payload).unwrap();
        assert_eq!(&payload, envelope.payload());
    }

    #[tokio::test]
    async fn enqueue_captures_ambient_trace_context() {
        let store = InMemoryOutboxStore::new();
        let enqueuer = OutboxEnqueuer::new();
        let envelope = registered(TenantId::new());
        let ctx = TraceContext::parse(
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            Some("vendor=1"),
        )
        .unwrap();

        let id = trace::scope(ctx.clone(), async {
            enqueuer.enqueue(&mut DirectWriter(&store), &envelope).await
        })
        .await
        .unwrap();

        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.trace_id.as_deref(), Some("4bf92f3577b34da6a3ce929d0e0e4736"));
        assert_eq!(row.parent_span_id.as_deref(), Some("00f067aa0ba902b7"));
        assert_eq!(row.trace_flags, Some(1));
        assert_eq!(row.trace_state.as_deref(), Some("vendor=1"));
        assert_eq!(row.trace_context(), Some(ctx));
    }

    #[tokio::test]
    async fn enqueue_in_rolled_back_transaction_leaves_no_row() {
        let store = InMemoryOutboxStore::new();
        let enqueuer = OutboxEnqueuer::new();

        let mut tx = store.begin();
        enqueuer
            .enqueue(&mut tx, &registered(TenantId::new()))
            .await
            .unwrap();
        tx.rollback();

        assert!(store.snapshot().unwrap().is_empty());
    }
}
