//! Outbox rows and the predicates the dispatcher evaluates against them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use brushwork_core::TenantId;
use brushwork_events::{Event, EventEnvelope, TraceContext};

/// Unique outbox message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one dispatcher iteration's claim on a batch of rows.
///
/// Each iteration generates a fresh value, so a claim left behind by an
/// earlier iteration of the same instance is never mistaken for a live one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimId(String);

impl ClaimId {
    /// `"{instance}/{uuid}"`, unique per call.
    pub fn generate(instance: &str) -> Self {
        Self(format!("{instance}/{}", Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ClaimId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for ClaimId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which outbox a row lives in. Both share one schema and one dispatcher
/// implementation; they differ only in storage location and broker stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxKind {
    /// Events consumed inside the application.
    Domain,
    /// Events published to other systems.
    Integration,
}

impl OutboxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxKind::Domain => "domain",
            OutboxKind::Integration => "integration",
        }
    }

    pub fn table_name(&self) -> &'static str {
        match self {
            OutboxKind::Domain => "domain_outbox",
            OutboxKind::Integration => "integration_outbox",
        }
    }
}

impl std::fmt::Display for OutboxKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derived lifecycle state of a row, for stats and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Eligible for the next claim.
    Pending,
    /// Waiting out a retry delay.
    BackingOff,
    /// Held by a live claim.
    Claimed,
    Processed,
    Poisoned,
    /// Not terminal, but has used every attempt. Never dispatched again until
    /// requeued.
    Stalled,
}

/// One outbox row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: MessageId,
    pub name: String,
    pub version: u16,
    pub tenant_id: TenantId,
    pub username: String,
    pub occurred_utc: DateTime<Utc>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    /// Producer trace id, 32 lowercase hex chars.
    pub trace_id: Option<String>,
    /// Producer span id, 16 lowercase hex chars.
    pub parent_span_id: Option<String>,
    pub trace_flags: Option<u8>,
    pub trace_state: Option<String>,
    /// JSON-serialized event payload.
    pub payload: String,
    pub created_utc: DateTime<Utc>,
    pub processed_utc: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub do_not_process_before_utc: Option<DateTime<Utc>>,
    pub claimed_by: Option<ClaimId>,
    pub claimed_until: Option<DateTime<Utc>>,
    pub is_poisoned: bool,
    pub last_error: Option<String>,
}

impl OutboxMessage {
    /// A fresh row for `envelope`, with `payload` already serialized.
    pub fn from_envelope<E: Event>(
        envelope: &EventEnvelope<E>,
        payload: String,
        now: DateTime<Utc>,
        trace: Option<&TraceContext>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            name: envelope.name().to_string(),
            version: envelope.version(),
            tenant_id: envelope.tenant_id(),
            username: envelope.username().to_string(),
            occurred_utc: envelope.occurred_at(),
            correlation_id: envelope.correlation_id().map(str::to_string),
            causation_id: envelope.causation_id().map(str::to_string),
            trace_id: trace.map(TraceContext::trace_id_hex),
            parent_span_id: trace.map(TraceContext::span_id_hex),
            trace_flags: trace.map(TraceContext::flags),
            trace_state: trace.and_then(|t| t.state().map(str::to_string)),
            payload,
            created_utc: now,
            processed_utc: None,
            attempts: 0,
            do_not_process_before_utc: None,
            claimed_by: None,
            claimed_until: None,
            is_poisoned: false,
            last_error: None,
        }
    }

    /// Processed or poisoned. Terminal rows are never dispatched again.
    pub fn is_terminal(&self) -> bool {
        self.processed_utc.is_some() || self.is_poisoned
    }

    /// Whether the row may be claimed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>, max_attempts: u32) -> bool {
        !self.is_terminal()
            && self.do_not_process_before_utc.is_none_or(|t| t <= now)
            && self.claimed_until.is_none_or(|t| t < now)
            && self.attempts < max_attempts
    }

    /// Whether `claim` holds a live lease on the row at `now`.
    pub fn is_claimed_by(&self, claim: &ClaimId, now: DateTime<Utc>) -> bool {
        self.claimed_by.as_ref() == Some(claim) && self.claimed_until.is_some_and(|t| t >= now)
    }

    pub fn status(&self, now: DateTime<Utc>, max_attempts: u32) -> MessageStatus {
        if self.processed_utc.is_some() {
            MessageStatus::Processed
        } else if self.is_poisoned {
            MessageStatus::Poisoned
        } else if self.attempts >= max_attempts {
            MessageStatus::Stalled
        } else if self.claimed_until.is_some_and(|t| t >= now) {
            MessageStatus::Claimed
        } else if self.do_not_process_before_utc.is_some_and(|t| t > now) {
            MessageStatus::BackingOff
        } else {
            MessageStatus::Pending
        }
    }

    /// The producer's trace context, when one was captured and is well formed.
    pub fn trace_context(&self) -> Option<TraceContext> {
        TraceContext::from_stored(
            self.trace_id.as_deref()?,
            self.parent_span_id.as_deref()?,
            self.trace_flags.unwrap_or(0),
            self.trace_state.as_deref(),
        )
    }
}
