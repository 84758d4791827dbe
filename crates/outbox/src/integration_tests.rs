//! Dispatch scenarios end to end.
//!
//! Tests: Enqueuer -> OutboxStore -> Dispatcher -> Broker
//!
//! Verifies:
//! - Successful publishes are marked processed exactly once
//! - Unknown types, bad payloads and broker rejections are poisoned
//! - Transient failures back off and retry, and poison once attempts run out
//! - Batches are published oldest first
//! - Two dispatchers never both own a row, and expired claims are reclaimed

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use brushwork_core::{Clock, ManualClock, TenantId};
    use brushwork_events::broker::headers;
    use brushwork_events::catalog;
    use brushwork_events::catalog::integration::MaterialCreated;
    use brushwork_events::{
        Event, EventEnvelope, EventTypeRegistry, InMemoryBroker, PublishError, TraceContext, trace,
    };

    use crate::backoff::{BackoffPolicy, BackoffStrategy};
    use crate::config::DispatcherConfig;
    use crate::dispatcher::{BatchReport, IterationOutcome, OutboxDispatcher};
    use crate::enqueuer::OutboxEnqueuer;
    use crate::message::{ClaimId, MessageId, OutboxKind, OutboxMessage};
    use crate::metrics::RecordingMetrics;
    use crate::store::{DirectWriter, Due, InMemoryOutboxStore, OutboxStore};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: Uuid,
        total_cents: i64,
        occurred_at: DateTime<Utc>,
    }

    impl Event for OrderPlaced {
        const NAME: &'static str = "OrderPlaced";
        const VERSION: u16 = 1;

        fn occurred_at(&self) -> DateTime<Utc> {
            self.occurred_at
        }
    }

    /// Never registered with the dispatcher.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Unknown {
        occurred_at: DateTime<Utc>,
    }

    impl Event for Unknown {
        const NAME: &'static str = "Unknown";
        const VERSION: u16 = 1;

        fn occurred_at(&self) -> DateTime<Utc> {
            self.occurred_at
        }
    }

    type TestDispatcher = OutboxDispatcher<Arc<InMemoryOutboxStore>, Arc<InMemoryBroker>>;

    struct Harness {
        store: Arc<InMemoryOutboxStore>,
        broker: Arc<InMemoryBroker>,
        clock: Arc<ManualClock>,
        metrics: Arc<RecordingMetrics>,
        registry: Arc<EventTypeRegistry>,
        enqueuer: OutboxEnqueuer,
        tenant: TenantId,
    }

    impl Harness {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new(Utc::now()));
            let mut registry = catalog::registry().unwrap();
            registry.register::<OrderPlaced>().unwrap();
            Self {
                store: InMemoryOutboxStore::arc(),
                broker: Arc::new(InMemoryBroker::new()),
                enqueuer: OutboxEnqueuer::new().with_clock(clock.clone()),
                clock,
                metrics: Arc::new(RecordingMetrics::new()),
                registry: Arc::new(registry),
                tenant: TenantId::new(),
            }
        }

        fn dispatcher(&self, config: DispatcherConfig) -> TestDispatcher {
            OutboxDispatcher::new(
                OutboxKind::Domain,
                self.store.clone(),
                self.broker.clone(),
                self.registry.clone(),
                config,
            )
            .with_clock(self.clock.clone())
            .with_metrics(self.metrics.clone())
        }

        async fn enqueue<E: Event>(&self, event: E) -> MessageId {
            let envelope = EventEnvelope::new(self.tenant, "painter", event)
                .with_correlation_id("corr-1");
            self.enqueuer
                .enqueue(&mut DirectWriter(self.store.as_ref()), &envelope)
                .await
                .unwrap()
        }

        async fn row(&self, id: MessageId) -> OutboxMessage {
            self.store.get(id).await.unwrap().unwrap()
        }

        fn now(&self) -> DateTime<Utc> {
            self.clock.now()
        }
    }

    fn config() -> DispatcherConfig {
        DispatcherConfig::default()
            .with_instance_name("test-dispatcher")
            .with_poll_interval(Duration::from_millis(10))
            .with_claim_duration(Duration::from_secs(60))
            .with_max_attempts(5)
            .with_backoff(BackoffPolicy::fixed(Duration::from_secs(10)))
    }

    fn order_placed(occurred_at: DateTime<Utc>) -> OrderPlaced {
        OrderPlaced {
            order_id: Uuid::now_v7(),
            total_cents: 4_250,
            occurred_at,
        }
    }

    fn dispatched(outcome: IterationOutcome) -> BatchReport {
        match outcome {
            IterationOutcome::Dispatched(report) => report,
            other => panic!("expected a dispatched batch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn registered_event_is_published_and_marked_processed() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(config());
        let id = h.enqueue(order_placed(h.now())).await;

        let report = dispatched(dispatcher.run_iteration(&CancellationToken::new()).await.unwrap());
        assert_eq!(report.claimed, 1);
        assert_eq!(report.processed, 1);

        let row = h.row(id).await;
        assert_eq!(row.processed_utc, Some(h.now()));
        assert!(!row.is_poisoned);

        let published = h.broker.published();
        assert_eq!(published.len(), 1);
        let message = &published[0];
        assert_eq!(message.topic, "OrderPlaced.v1");
        assert_eq!(message.payload, row.payload.as_bytes());
        assert_eq!(message.header(headers::MESSAGE_ID), Some(id.to_string().as_str()));
        assert_eq!(message.header(headers::EVENT_NAME), Some("OrderPlaced"));
        assert_eq!(message.header(headers::EVENT_VERSION), Some("1"));
        assert_eq!(message.header(headers::CORRELATION_ID), Some("corr-1"));
        assert!(message.header(headers::TRACEPARENT).is_some());

        assert_eq!(h.metrics.snapshot().processed, 1);
        assert_eq!(
            dispatcher.run_iteration(&CancellationToken::new()).await.unwrap(),
            IterationOutcome::Idle
        );
    }

    #[tokio::test]
    async fn publish_starts_a_new_trace_instead_of_joining_the_producer() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(config());
        let producer = TraceContext::new_root();
        let id = trace::scope(producer.clone(), h.enqueue(order_placed(h.now()))).await;

        assert_eq!(h.row(id).await.trace_context(), Some(producer.clone()));
        dispatcher.run_iteration(&CancellationToken::new()).await.unwrap();

        let published = h.broker.published();
        let traceparent = published[0].header(headers::TRACEPARENT).unwrap();
        let publish_ctx = TraceContext::parse(traceparent, None).unwrap();
        assert_ne!(publish_ctx.trace_id_hex(), producer.trace_id_hex());
    }

    #[tokio::test]
    async fn unknown_event_type_is_poisoned_without_publishing() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(config());
        let id = h.enqueue(Unknown { occurred_at: h.now() }).await;

        let report = dispatched(dispatcher.run_iteration(&CancellationToken::new()).await.unwrap());
        assert_eq!(report.poisoned, 1);

        let row = h.row(id).await;
        assert!(row.is_poisoned);
        assert!(row.processed_utc.is_none());
        assert_eq!(row.attempts, 0);
        assert!(row.last_error.unwrap().contains("Unknown.v1"));
        assert!(h.broker.is_empty());
        assert_eq!(h.metrics.snapshot().poisoned, 1);
    }

    #[tokio::test]
    async fn undeserializable_payload_is_poisoned() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(config());
        let id = h.enqueue(order_placed(h.now())).await;
        h.store
            .update_with(id, |row| row.payload = r#"{"order_id": "not-a-uuid"}"#.into())
            .unwrap();

        dispatcher.run_iteration(&CancellationToken::new()).await.unwrap();

        let row = h.row(id).await;
        assert!(row.is_poisoned);
        assert!(row.processed_utc.is_none());
        assert!(h.broker.is_empty());
    }

    #[tokio::test]
    async fn permanent_broker_rejection_is_poisoned() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(config());
        let id = h.enqueue(order_placed(h.now())).await;
        h.broker.fail_next(PublishError::permanent("no route for OrderPlaced.v1"));

        let report = dispatched(dispatcher.run_iteration(&CancellationToken::new()).await.unwrap());
        assert_eq!(report.poisoned, 1);

        let row = h.row(id).await;
        assert!(row.is_poisoned);
        assert_eq!(row.attempts, 0);
        assert_eq!(row.last_error.as_deref(), Some("no route for OrderPlaced.v1"));
    }

    #[tokio::test]
    async fn transient_failure_backs_off_then_succeeds() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(config());
        let id = h.enqueue(order_placed(h.now())).await;
        h.broker.fail_next(PublishError::transient("connection reset"));

        let report = dispatched(dispatcher.run_iteration(&CancellationToken::new()).await.unwrap());
        assert_eq!(report.failed, 1);

        let row = h.row(id).await;
        assert_eq!(row.attempts, 1);
        assert!(row.do_not_process_before_utc.unwrap() > h.now());
        assert!(row.processed_utc.is_none());
        assert!(!row.is_poisoned);
        assert_eq!(row.last_error.as_deref(), Some("connection reset"));
        assert_eq!(h.metrics.snapshot().failed, 1);

        // Neither the backoff nor the claim has run out yet.
        assert_eq!(
            dispatcher.run_iteration(&CancellationToken::new()).await.unwrap(),
            IterationOutcome::Idle
        );

        h.clock.advance(chrono::Duration::minutes(2));
        let report = dispatched(dispatcher.run_iteration(&CancellationToken::new()).await.unwrap());
        assert_eq!(report.processed, 1);

        let row = h.row(id).await;
        assert_eq!(row.processed_utc, Some(h.now()));
        assert_eq!(row.attempts, 1);
        assert_eq!(h.broker.len(), 1);
    }

    #[tokio::test]
    async fn exhausting_attempts_poisons_the_row() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(config().with_max_attempts(2));
        let id = h.enqueue(order_placed(h.now())).await;
        h.broker.fail_next(PublishError::transient("timeout"));
        h.broker.fail_next(PublishError::transient("timeout"));

        dispatcher.run_iteration(&CancellationToken::new()).await.unwrap();
        h.clock.advance(chrono::Duration::minutes(2));
        let report = dispatched(dispatcher.run_iteration(&CancellationToken::new()).await.unwrap());
        assert_eq!(report.poisoned, 1);

        let row = h.row(id).await;
        assert_eq!(row.attempts, 2);
        assert!(row.is_poisoned);
        assert!(row.last_error.unwrap().starts_with("attempts exhausted"));
        // The exhausting attempt counts as poisoned only.
        let stats = h.metrics.snapshot();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.poisoned, 1);
    }

    #[tokio::test]
    async fn retry_is_always_scheduled_in_the_future() {
        let h = Harness::new();
        let backoff = BackoffPolicy {
            strategy: BackoffStrategy::Fixed,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            jitter: 1.0,
        };
        let dispatcher = h.dispatcher(config().with_max_attempts(10).with_backoff(backoff));
        let id = h.enqueue(order_placed(h.now())).await;

        for attempt in 1..=5 {
            h.broker.fail_next(PublishError::transient("timeout"));
            let report =
                dispatched(dispatcher.run_iteration(&CancellationToken::new()).await.unwrap());
            assert_eq!(report.failed, 1);

            let row = h.row(id).await;
            assert_eq!(row.attempts, attempt);
            assert!(row.do_not_process_before_utc.unwrap() > h.now());
            h.clock.advance(chrono::Duration::minutes(2));
        }
    }

    #[tokio::test]
    async fn batch_is_published_oldest_first() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(config().with_batch_size(3));
        let t = h.now();

        h.clock.set(t + chrono::Duration::seconds(2));
        let third = h.enqueue(order_placed(t)).await;
        h.clock.set(t);
        let first = h.enqueue(order_placed(t)).await;
        h.clock.set(t + chrono::Duration::seconds(1));
        let second = h.enqueue(order_placed(t)).await;
        h.clock.set(t + chrono::Duration::seconds(3));

        let report = dispatched(dispatcher.run_iteration(&CancellationToken::new()).await.unwrap());
        assert_eq!(report.processed, 3);

        let order: Vec<String> = h
            .broker
            .published()
            .iter()
            .map(|m| m.header(headers::MESSAGE_ID).unwrap().to_string())
            .collect();
        assert_eq!(
            order,
            vec![first.to_string(), second.to_string(), third.to_string()]
        );
    }

    #[tokio::test]
    async fn batch_size_limits_one_iteration() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(config().with_batch_size(2));
        for _ in 0..3 {
            h.enqueue(order_placed(h.now())).await;
        }

        let report = dispatched(dispatcher.run_iteration(&CancellationToken::new()).await.unwrap());
        assert_eq!(report.processed, 2);
        let report = dispatched(dispatcher.run_iteration(&CancellationToken::new()).await.unwrap());
        assert_eq!(report.processed, 1);
        assert_eq!(h.broker.len(), 3);
    }

    #[tokio::test]
    async fn only_one_of_two_claimers_wins_a_row() {
        let h = Harness::new();
        let id = h.enqueue(order_placed(h.now())).await;

        let due = Due::at(h.now(), 5);
        let until = h.now() + chrono::Duration::minutes(1);
        let a = ClaimId::generate("instance-a");
        let b = ClaimId::generate("instance-b");
        let ids_a = h.store.select_due_ids(due, 10).await.unwrap();
        let ids_b = h.store.select_due_ids(due, 10).await.unwrap();
        assert_eq!(ids_a, vec![id]);
        assert_eq!(ids_a, ids_b);

        assert_eq!(h.store.claim(&ids_a, due, &a, until).await.unwrap(), 1);
        assert_eq!(h.store.claim(&ids_b, due, &b, until).await.unwrap(), 0);
        assert_eq!(h.row(id).await.claimed_by, Some(a));
    }

    #[tokio::test]
    async fn concurrent_dispatchers_publish_each_row_once() {
        let h = Harness::new();
        let a = h.dispatcher(config().with_instance_name("instance-a"));
        let b = h.dispatcher(config().with_instance_name("instance-b"));
        h.enqueue(order_placed(h.now())).await;

        let cancel = CancellationToken::new();
        let (ra, rb) = tokio::join!(a.run_iteration(&cancel), b.run_iteration(&cancel));
        let processed: usize = [ra.unwrap(), rb.unwrap()]
            .into_iter()
            .map(|outcome| match outcome {
                IterationOutcome::Dispatched(report) => report.processed,
                IterationOutcome::Idle | IterationOutcome::LostRace => 0,
            })
            .sum();

        assert_eq!(processed, 1);
        assert_eq!(h.broker.len(), 1);
    }

    #[tokio::test]
    async fn expired_claim_is_reclaimed_by_another_instance() {
        let h = Harness::new();
        let id = h.enqueue(order_placed(h.now())).await;

        // Instance A claims and dies without processing.
        let dead = ClaimId::generate("instance-a");
        let due = Due::at(h.now(), 5);
        let until = h.now() + chrono::Duration::minutes(1);
        assert_eq!(h.store.claim(&[id], due, &dead, until).await.unwrap(), 1);

        let b = h.dispatcher(config().with_instance_name("instance-b"));
        assert_eq!(
            b.run_iteration(&CancellationToken::new()).await.unwrap(),
            IterationOutcome::Idle
        );

        h.clock.advance(chrono::Duration::seconds(61));
        assert!(h.store.has_due(Due::at(h.now(), 5)).await.unwrap());
        let report = dispatched(b.run_iteration(&CancellationToken::new()).await.unwrap());
        assert_eq!(report.processed, 1);

        let row = h.row(id).await;
        assert!(row.processed_utc.is_some());
        assert!(row.claimed_by.unwrap().as_str().starts_with("instance-b/"));
    }

    #[tokio::test]
    async fn terminal_rows_never_change_again() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(config());
        let processed = h.enqueue(order_placed(h.now())).await;
        let poisoned = h.enqueue(Unknown { occurred_at: h.now() }).await;
        dispatcher.run_iteration(&CancellationToken::new()).await.unwrap();

        let before = (h.row(processed).await, h.row(poisoned).await);
        for _ in 0..3 {
            h.clock.advance(chrono::Duration::hours(1));
            assert_eq!(
                dispatcher.run_iteration(&CancellationToken::new()).await.unwrap(),
                IterationOutcome::Idle
            );
        }
        assert_eq!((h.row(processed).await, h.row(poisoned).await), before);
        assert_eq!(h.broker.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_iteration_leaves_rows_claimed() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(config());
        let id = h.enqueue(order_placed(h.now())).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = dispatched(dispatcher.run_iteration(&cancel).await.unwrap());
        assert_eq!(report.abandoned, 1);

        let row = h.row(id).await;
        assert!(row.processed_utc.is_none());
        assert!(row.claimed_until.unwrap() > h.now());
        assert!(h.broker.is_empty());

        h.clock.advance(chrono::Duration::seconds(61));
        let report = dispatched(dispatcher.run_iteration(&CancellationToken::new()).await.unwrap());
        assert_eq!(report.processed, 1);
    }

    #[tokio::test]
    async fn rolled_back_enqueue_is_never_dispatched() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(config());

        let mut tx = h.store.begin();
        let envelope = EventEnvelope::new(h.tenant, "painter", order_placed(h.now()));
        h.enqueuer.enqueue(&mut tx, &envelope).await.unwrap();
        tx.rollback();

        assert_eq!(
            dispatcher.run_iteration(&CancellationToken::new()).await.unwrap(),
            IterationOutcome::Idle
        );
        assert!(h.broker.is_empty());
    }

    #[tokio::test]
    async fn stats_reflect_row_states() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(config());
        h.enqueue(order_placed(h.now())).await;
        h.enqueue(Unknown { occurred_at: h.now() }).await;
        dispatcher.run_iteration(&CancellationToken::new()).await.unwrap();

        h.broker.fail_next(PublishError::transient("down"));
        let retrying = h.enqueue(order_placed(h.now())).await;
        dispatcher.run_iteration(&CancellationToken::new()).await.unwrap();
        h.enqueue(MaterialCreated {
            material_id: Uuid::now_v7(),
            tenant_id: h.tenant,
            name: "Matte varnish".into(),
            category: None,
            occurred_at: h.now(),
        })
        .await;

        let stats = dispatcher.stats().await.unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.poisoned, 1);
        assert_eq!(stats.claimed, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.total(), 4);

        // Claim gone, backoff still running.
        h.clock.advance(chrono::Duration::seconds(5));
        h.store
            .update_with(retrying, |row| row.claimed_until = None)
            .unwrap();
        let stats = dispatcher.stats().await.unwrap();
        assert_eq!(stats.backing_off, 1);
    }

    #[tokio::test]
    async fn requeued_row_is_dispatched_again() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(config());
        let id = h.enqueue(order_placed(h.now())).await;
        h.broker.fail_next(PublishError::permanent("rejected"));
        dispatcher.run_iteration(&CancellationToken::new()).await.unwrap();
        assert!(h.row(id).await.is_poisoned);

        assert!(h.store.requeue(id).await.unwrap());
        let report = dispatched(dispatcher.run_iteration(&CancellationToken::new()).await.unwrap());
        assert_eq!(report.processed, 1);
        let stats = h.metrics.snapshot();
        assert_eq!(stats.poisoned, 1);
        assert_eq!(stats.processed, 1);
    }

    #[tokio::test]
    async fn spawned_dispatcher_drains_and_shuts_down() {
        let h = Harness::new();
        for _ in 0..3 {
            h.enqueue(order_placed(h.now())).await;
        }

        let handle = h.dispatcher(config()).spawn(CancellationToken::new());
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.broker.len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        handle.shutdown().await;
        assert_eq!(h.broker.len(), 3);
        assert_eq!(h.store.stats(Due::at(h.now(), 5)).await.unwrap().processed, 3);
    }
}
