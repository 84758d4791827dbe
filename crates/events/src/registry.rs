//! Event type registry: `(name, version)` -> payload type.
//!
//! The dispatcher never publishes a payload whose type it cannot name. The
//! registry is populated once at startup with every event the application can
//! publish and is read-only afterwards, so lookups are plain map reads.
//!
//! An unresolved lookup is a *permanent* condition: retrying cannot teach the
//! process a type it was not built with.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use crate::event::Event;

/// Registration failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("event type {name} v{version} registered twice ({existing} and {duplicate})")]
    Duplicate {
        name: &'static str,
        version: u16,
        existing: &'static str,
        duplicate: &'static str,
    },
}

/// Stored payload did not deserialize into its registered type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("payload is not a valid {type_name}: {reason}")]
pub struct PayloadError {
    pub type_name: &'static str,
    pub reason: String,
}

type Validator = fn(&str) -> Result<(), serde_json::Error>;

fn validate_as<E: Event>(payload: &str) -> Result<(), serde_json::Error> {
    serde_json::from_str::<E>(payload).map(|_| ())
}

/// A resolved payload type.
#[derive(Clone, Copy)]
pub struct EventType {
    name: &'static str,
    version: u16,
    type_name: &'static str,
    validator: Validator,
}

impl EventType {
    pub fn of<E: Event>() -> Self {
        Self {
            name: E::NAME,
            version: E::VERSION,
            type_name: std::any::type_name::<E>(),
            validator: validate_as::<E>,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    /// Rust type the payload deserializes into.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Deserialize `payload` into the registered type and discard the result.
    pub fn validate(&self, payload: &str) -> Result<(), PayloadError> {
        (self.validator)(payload).map_err(|e| PayloadError {
            type_name: self.type_name,
            reason: e.to_string(),
        })
    }
}

impl core::fmt::Debug for EventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventType")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// Registry of publishable event types.
#[derive(Debug, Default, Clone)]
pub struct EventTypeRegistry {
    types: HashMap<&'static str, BTreeMap<u16, EventType>>,
}

impl EventTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `E` under `(E::NAME, E::VERSION)`.
    pub fn register<E: Event>(&mut self) -> Result<(), RegistryError> {
        let event_type = EventType::of::<E>();
        let versions = self.types.entry(E::NAME).or_default();
        if let Some(existing) = versions.get(&E::VERSION) {
            return Err(RegistryError::Duplicate {
                name: E::NAME,
                version: E::VERSION,
                existing: existing.type_name,
                duplicate: event_type.type_name,
            });
        }
        versions.insert(E::VERSION, event_type);
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<E: Event>(mut self) -> Result<Self, RegistryError> {
        self.register::<E>()?;
        Ok(self)
    }

    pub fn try_resolve(&self, name: &str, version: u16) -> Option<&EventType> {
        self.types.get(name)?.get(&version)
    }

    pub fn contains(&self, name: &str, version: u16) -> bool {
        self.try_resolve(name, version).is_some()
    }

    pub fn len(&self) -> usize {
        self.types.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All registered `(name, version)` pairs, sorted.
    pub fn registered(&self) -> Vec<(&'static str, u16)> {
        let mut all: Vec<_> = self
            .types
            .iter()
            .flat_map(|(name, versions)| versions.keys().map(move |v| (*name, *v)))
            .collect();
        all.sort_unstable();
        all
    }
}
