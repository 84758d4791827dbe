use chrono::{DateTime, Utc};

use brushwork_core::TenantId;

use crate::event::Event;

/// Enqueue-time wrapper around an event payload.
///
/// Carries the provenance (tenant + username), the business timestamp and the
/// caller-supplied correlation/causation ids. The logical name and version
/// come from the payload type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope<E> {
    tenant_id: TenantId,
    username: String,
    occurred_at: DateTime<Utc>,
    correlation_id: Option<String>,
    causation_id: Option<String>,
    payload: E,
}

impl<E: Event> EventEnvelope<E> {
    /// Wrap `payload`, taking `occurred_at` from the event itself.
    pub fn new(tenant_id: TenantId, username: impl Into<String>, payload: E) -> Self {
        Self {
            tenant_id,
            username: username.into(),
            occurred_at: payload.occurred_at(),
            correlation_id: None,
            causation_id: None,
            payload,
        }
    }

    pub fn name(&self) -> &'static str {
        E::NAME
    }

    pub fn version(&self) -> u16 {
        E::VERSION
    }
}

impl<E> EventEnvelope<E> {
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    /// Override the business timestamp (e.g. when replaying an import).
    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn causation_id(&self) -> Option<&str> {
        self.causation_id.as_deref()
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
