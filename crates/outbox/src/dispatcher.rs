//! Outbox dispatcher: claims due rows and publishes them to the broker.
//!
//! Any number of dispatchers may run against the same store. Coordination is
//! entirely through the claim columns:
//!
//! 1. Cheap due-check; sleep a jittered poll interval when nothing is due.
//! 2. Select up to `batch_size` due ids, oldest first.
//! 3. Claim them with one conditional update that re-checks the due predicate.
//!    Zero rows claimed means another instance won; start over.
//! 4. Re-read the rows this claim owns. That list is the iteration's work.
//! 5. Per row: re-fetch, resolve the type, validate the payload, publish, and
//!    record the outcome. A failure on one row never aborts the batch.
//!
//! A dispatcher that dies mid-batch leaves its rows claimed; they become due
//! again once the claim expires.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use brushwork_core::{Clock, SystemClock};
use brushwork_events::broker::headers;
use brushwork_events::{BrokerPublisher, EventTypeRegistry, Headers, PublishError, topic_for};

use crate::backoff;
use crate::config::DispatcherConfig;
use crate::message::{ClaimId, MessageId, OutboxKind, OutboxMessage};
use crate::metrics::{DispatchMetrics, NoopMetrics};
use crate::store::{Due, FailedAttempt, OutboxStats, OutboxStore, OutboxStoreError};
use crate::trace_sink::{PublishSpan, TraceSink, TracingSink};

/// A retry is always scheduled strictly after the failure, even when jitter
/// rounds the backoff down to nothing.
const MIN_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Why a row was poisoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoisonReason {
    /// `(name, version)` is not in the registry.
    UnknownType,
    /// The payload does not deserialize into the registered type.
    InvalidPayload,
    /// The broker rejected the message permanently.
    Rejected,
    /// A transient failure used up the last attempt.
    AttemptsExhausted,
}

impl PoisonReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoisonReason::UnknownType => "unknown_type",
            PoisonReason::InvalidPayload => "invalid_payload",
            PoisonReason::Rejected => "rejected",
            PoisonReason::AttemptsExhausted => "attempts_exhausted",
        }
    }
}

impl std::fmt::Display for PoisonReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A whole iteration failed before any per-message work.
#[derive(Debug, thiserror::Error)]
#[error("outbox {stage} failed: {source}")]
pub struct DispatchError {
    pub stage: &'static str,
    #[source]
    pub source: OutboxStoreError,
}

impl DispatchError {
    fn at(stage: &'static str) -> impl FnOnce(OutboxStoreError) -> Self {
        move |source| Self { stage, source }
    }
}

/// What happened to one claimed row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    Processed,
    Poisoned(PoisonReason),
    /// Transient failure; retry no earlier than `retry_at`.
    Failed {
        attempts: u32,
        retry_at: DateTime<Utc>,
    },
    /// Gone, already terminal, or no longer ours.
    Skipped,
    /// Shutdown interrupted the publish; the claim will expire.
    Abandoned,
    /// Reading or writing the row failed; the claim will expire.
    StoreError,
}

/// Tally of one iteration's batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub processed: usize,
    pub poisoned: usize,
    pub failed: usize,
    pub skipped: usize,
    pub abandoned: usize,
    pub store_errors: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: &MessageOutcome) {
        match outcome {
            MessageOutcome::Processed => self.processed += 1,
            MessageOutcome::Poisoned(_) => self.poisoned += 1,
            MessageOutcome::Failed { .. } => self.failed += 1,
            MessageOutcome::Skipped => self.skipped += 1,
            MessageOutcome::Abandoned => self.abandoned += 1,
            MessageOutcome::StoreError => self.store_errors += 1,
        }
    }
}

/// Result of [`OutboxDispatcher::run_iteration`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Nothing due.
    Idle,
    /// Rows were due but another instance claimed them first.
    LostRace,
    Dispatched(BatchReport),
}

/// Publishes one outbox's rows.
pub struct OutboxDispatcher<S, P> {
    kind: OutboxKind,
    store: S,
    publisher: P,
    registry: Arc<EventTypeRegistry>,
    config: DispatcherConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn DispatchMetrics>,
    trace: Arc<dyn TraceSink>,
}

impl<S, P> OutboxDispatcher<S, P>
where
    S: OutboxStore,
    P: BrokerPublisher,
{
    pub fn new(
        kind: OutboxKind,
        store: S,
        publisher: P,
        registry: Arc<EventTypeRegistry>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            kind,
            store,
            publisher,
            registry,
            config,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(NoopMetrics),
            trace: Arc::new(TracingSink),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn DispatchMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_trace_sink(mut self, trace: Arc<dyn TraceSink>) -> Self {
        self.trace = trace;
        self
    }

    pub fn kind(&self) -> OutboxKind {
        self.kind
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Row counts as this dispatcher would classify them right now.
    pub async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        self.store.stats(self.due_now()).await
    }

    /// Loop until `cancel` fires. Iteration errors are logged, never returned.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            outbox = %self.kind,
            instance = %self.config.instance_name,
            batch_size = self.config.batch_size,
            "outbox dispatcher started"
        );

        while !cancel.is_cancelled() {
            let idle = match self.run_iteration(&cancel).await {
                Ok(IterationOutcome::Idle) => true,
                Ok(IterationOutcome::LostRace) => false,
                Ok(IterationOutcome::Dispatched(report)) => {
                    debug!(
                        outbox = %self.kind,
                        claimed = report.claimed,
                        processed = report.processed,
                        poisoned = report.poisoned,
                        failed = report.failed,
                        skipped = report.skipped,
                        "outbox batch finished"
                    );
                    false
                }
                Err(e) => {
                    error!(outbox = %self.kind, error = %e, "outbox dispatch iteration failed");
                    true
                }
            };

            if idle {
                let pause = backoff::jitter(self.config.poll_interval, self.config.poll_jitter);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        info!(outbox = %self.kind, instance = %self.config.instance_name, "outbox dispatcher stopped");
    }

    /// One pass of the claim/publish cycle.
    pub async fn run_iteration(
        &self,
        cancel: &CancellationToken,
    ) -> Result<IterationOutcome, DispatchError> {
        if !self
            .store
            .has_due(self.due_now())
            .await
            .map_err(DispatchError::at("due check"))?
        {
            return Ok(IterationOutcome::Idle);
        }

        let started = Instant::now();
        let ids = self
            .store
            .select_due_ids(self.due_now(), self.config.batch_size)
            .await
            .map_err(DispatchError::at("selection"))?;
        if ids.is_empty() {
            return Ok(IterationOutcome::LostRace);
        }

        let claim = ClaimId::generate(&self.config.instance_name);
        let now = self.clock.now();
        let until = offset(now, self.config.claim_duration);
        let claimed = self
            .store
            .claim(&ids, Due::at(now, self.config.max_attempts), &claim, until)
            .await
            .map_err(DispatchError::at("claim"))?;
        if claimed == 0 {
            debug!(outbox = %self.kind, claim = %claim, candidates = ids.len(), "lost claim race");
            return Ok(IterationOutcome::LostRace);
        }

        let batch = self
            .store
            .fetch_claimed(&claim, self.clock.now())
            .await
            .map_err(DispatchError::at("batch read"))?;
        debug!(outbox = %self.kind, claim = %claim, claimed, owned = batch.len(), "claimed outbox batch");

        let mut report = BatchReport {
            claimed: batch.len(),
            ..BatchReport::default()
        };
        for (index, message) in batch.iter().enumerate() {
            if cancel.is_cancelled() {
                report.abandoned += batch.len() - index;
                break;
            }
            let outcome = self.process(message.id, &claim, cancel).await;
            report.record(&outcome);
        }

        self.metrics.iteration_completed(report.claimed, started.elapsed());
        Ok(IterationOutcome::Dispatched(report))
    }

    /// Run on a background task until the handle is shut down or `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> DispatcherHandle
    where
        S: 'static,
        P: 'static,
    {
        let kind = self.kind;
        let token = cancel.clone();
        let join = tokio::spawn(async move { self.run(token).await });
        DispatcherHandle { kind, cancel, join }
    }

    fn due_now(&self) -> Due {
        Due::at(self.clock.now(), self.config.max_attempts)
    }

    async fn process(
        &self,
        id: MessageId,
        claim: &ClaimId,
        cancel: &CancellationToken,
    ) -> MessageOutcome {
        let message = match self.store.get(id).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!(outbox = %self.kind, message_id = %id, "outbox message vanished");
                return MessageOutcome::Skipped;
            }
            Err(e) => {
                warn!(outbox = %self.kind, message_id = %id, error = %e, "failed to re-read outbox message");
                return MessageOutcome::StoreError;
            }
        };
        if message.is_terminal() || message.claimed_by.as_ref() != Some(claim) {
            debug!(outbox = %self.kind, message_id = %id, "outbox message no longer ours");
            return MessageOutcome::Skipped;
        }

        let link = message.trace_context();
        let publish = self.trace.start_publish_span(&message, link.as_ref());
        let span = publish.span().clone();
        self.dispatch(&message, &publish, cancel)
            .instrument(span)
            .await
    }

    async fn dispatch(
        &self,
        message: &OutboxMessage,
        publish: &PublishSpan,
        cancel: &CancellationToken,
    ) -> MessageOutcome {
        let started = Instant::now();

        let Some(event_type) = self.registry.try_resolve(&message.name, message.version) else {
            let detail = format!("unknown event type {}.v{}", message.name, message.version);
            return self.poison(message, PoisonReason::UnknownType, &detail).await;
        };
        if let Err(e) = event_type.validate(&message.payload) {
            return self
                .poison(message, PoisonReason::InvalidPayload, &e.to_string())
                .await;
        }

        let topic = topic_for(&message.name, message.version);
        let headers = broker_headers(message, publish);
        match self
            .publisher
            .publish(&topic, message.payload.as_bytes(), &headers, cancel)
            .await
        {
            Ok(()) => self.complete(message, started).await,
            Err(PublishError::Permanent(reason)) => {
                self.poison(message, PoisonReason::Rejected, &reason).await
            }
            Err(PublishError::Transient(reason)) => {
                if cancel.is_cancelled() {
                    debug!(message_id = %message.id, "publish interrupted by shutdown");
                    return MessageOutcome::Abandoned;
                }
                self.fail(message, &reason, started).await
            }
        }
    }

    async fn complete(&self, message: &OutboxMessage, started: Instant) -> MessageOutcome {
        match self.store.mark_processed(message.id, self.clock.now()).await {
            Ok(applied) => {
                if !applied {
                    warn!(message_id = %message.id, "published outbox message was already terminal");
                }
                self.metrics.message_processed(&message.name, started.elapsed());
                debug!(message_id = %message.id, event = %message.name, "outbox message published");
                MessageOutcome::Processed
            }
            Err(e) => {
                error!(
                    message_id = %message.id,
                    error = %e,
                    "published but could not mark processed; it will be republished after the claim expires"
                );
                MessageOutcome::StoreError
            }
        }
    }

    async fn poison(
        &self,
        message: &OutboxMessage,
        reason: PoisonReason,
        detail: &str,
    ) -> MessageOutcome {
        warn!(
            message_id = %message.id,
            event = %message.name,
            version = message.version,
            reason = %reason,
            error = %detail,
            "poisoning outbox message"
        );
        match self.store.mark_poisoned(message.id, detail).await {
            Ok(true) => {
                self.metrics.message_poisoned(&message.name, reason);
                MessageOutcome::Poisoned(reason)
            }
            Ok(false) => MessageOutcome::Skipped,
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "failed to poison outbox message");
                MessageOutcome::StoreError
            }
        }
    }

    async fn fail(&self, message: &OutboxMessage, reason: &str, started: Instant) -> MessageOutcome {
        let attempts = message.attempts.saturating_add(1);
        let exhausted = attempts >= self.config.max_attempts;
        let now = self.clock.now();
        let delay = self
            .config
            .backoff
            .delay_for_attempt(attempts)
            .max(MIN_RETRY_DELAY);
        let retry_at = offset(now, delay);
        let failure = FailedAttempt {
            previous_attempts: message.attempts,
            retry_at: (!exhausted).then_some(retry_at),
            error: if exhausted {
                format!("attempts exhausted after {attempts}: {reason}")
            } else {
                reason.to_string()
            },
            exhausted,
        };

        match self.store.record_failure(message.id, &failure).await {
            Ok(true) => {
                if exhausted {
                    warn!(
                        message_id = %message.id,
                        event = %message.name,
                        attempts,
                        error = %reason,
                        "outbox message exhausted its attempts"
                    );
                    self.metrics
                        .message_poisoned(&message.name, PoisonReason::AttemptsExhausted);
                    MessageOutcome::Poisoned(PoisonReason::AttemptsExhausted)
                } else {
                    warn!(
                        message_id = %message.id,
                        event = %message.name,
                        attempts,
                        retry_at = %retry_at,
                        error = %reason,
                        "outbox publish failed, will retry"
                    );
                    self.metrics.message_failed(&message.name, started.elapsed());
                    MessageOutcome::Failed { attempts, retry_at }
                }
            }
            Ok(false) => MessageOutcome::Skipped,
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "failed to record outbox failure");
                MessageOutcome::StoreError
            }
        }
    }
}

/// Handle to a spawned dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    kind: OutboxKind,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl DispatcherHandle {
    pub fn kind(&self) -> OutboxKind {
        self.kind
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Cancel and wait for the loop to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            error!(outbox = %self.kind, error = %e, "outbox dispatcher task failed");
        }
    }
}

fn broker_headers(message: &OutboxMessage, publish: &PublishSpan) -> Headers {
    let mut out = Headers::new();
    publish.inject(&mut out);
    out.insert(headers::MESSAGE_ID.to_string(), message.id.to_string());
    out.insert(headers::EVENT_NAME.to_string(), message.name.clone());
    out.insert(headers::EVENT_VERSION.to_string(), message.version.to_string());
    if let Some(correlation_id) = &message.correlation_id {
        out.insert(headers::CORRELATION_ID.to_string(), correlation_id.clone());
    }
    out
}

fn offset(now: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
