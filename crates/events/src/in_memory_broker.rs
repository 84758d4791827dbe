//! In-memory broker for tests/dev.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerPublisher, Headers, PublishError};

/// A message accepted by [`InMemoryBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

impl PublishedMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Records every publish in order.
///
/// - No IO
/// - Scripted failures: each [`fail_next`](Self::fail_next) call makes one
///   upcoming publish fail with the given error (FIFO)
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    published: Mutex<Vec<PublishedMessage>>,
    failures: Mutex<VecDeque<PublishError>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next not-yet-failed publish with `error`.
    pub fn fail_next(&self, error: PublishError) {
        lock(&self.failures).push_back(error);
    }

    /// Snapshot of accepted messages, in publish order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.published).clone()
    }

    pub fn topics(&self) -> Vec<String> {
        lock(&self.published).iter().map(|m| m.topic.clone()).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.published).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // Ignore poisoning so one panicking test cannot break the others.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl BrokerPublisher for InMemoryBroker {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        headers: &Headers,
        cancel: &CancellationToken,
    ) -> Result<(), PublishError> {
        if cancel.is_cancelled() {
            return Err(PublishError::transient("cancelled"));
        }

        if let Some(err) = lock(&self.failures).pop_front() {
            return Err(err);
        }

        lock(&self.published).push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            headers: headers.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_in_order_and_replays_scripted_failures() {
        let broker = InMemoryBroker::new();
        let cancel = CancellationToken::new();
        broker.fail_next(PublishError::transient("down"));

        let first = broker.publish("A.v1", b"{}", &Headers::new(), &cancel).await;
        assert_eq!(first, Err(PublishError::transient("down")));

        broker.publish("A.v1", b"1", &Headers::new(), &cancel).await.unwrap();
        broker.publish("B.v1", b"2", &Headers::new(), &cancel).await.unwrap();
        assert_eq!(broker.topics(), vec!["A.v1", "B.v1"]);
    }

    #[tokio::test]
    async fn refuses_after_cancellation() {
        let broker = InMemoryBroker::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = broker.publish("A.v1", b"{}", &Headers::new(), &cancel).await;
        assert!(matches!(result, Err(PublishError::Transient(_))));
        assert!(broker.is_empty());
    }
}
