//! Events, their wire identity, and the broker port.
//!
//! - [`Event`]: a publishable payload type identified by name + version
//! - [`EventEnvelope`]: enqueue-time metadata around a payload
//! - [`EventTypeRegistry`]: `(name, version)` -> payload type, built at startup
//! - [`BrokerPublisher`]: where dispatched messages go
//! - [`trace`]: W3C trace-context capture and propagation

pub mod broker;
pub mod catalog;
pub mod envelope;
pub mod event;
pub mod in_memory_broker;
pub mod registry;
pub mod trace;

pub use broker::{BrokerPublisher, Headers, PublishError, topic_for};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_broker::{InMemoryBroker, PublishedMessage};
pub use registry::{EventType, EventTypeRegistry, PayloadError, RegistryError};
pub use trace::{TraceContext, TraceContextError};
