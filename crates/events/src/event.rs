use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};

/// A publishable event type.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution: a new payload shape is a new `VERSION`)
/// - identified on the wire by `NAME` + `VERSION`, never by the Rust type name
pub trait Event: Serialize + DeserializeOwned + Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable logical event name (e.g. `"PaintColorCreated"`).
    const NAME: &'static str;

    /// Schema version of the payload.
    const VERSION: u16;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}
