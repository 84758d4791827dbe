//! Redis Streams broker publisher.
//!
//! Each topic maps to its own stream, `<prefix>:<topic>`. An entry carries the
//! broker headers as fields plus the raw JSON under `payload`:
//!
//! ```text
//! XADD brushwork:MaterialCreated.v1 * message-id <uuid> event-name MaterialCreated ... payload {...}
//! ```
//!
//! ## Failure classification
//!
//! | Redis error | PublishError |
//! |-------------|--------------|
//! | IO, timeout, dropped or refused connection, cluster redirects, `LOADING`, `TRYAGAIN` | `Transient` |
//! | `ERR` responses, `WRONGTYPE`, type errors | `Permanent` |
//! | Payload over `max_payload_bytes` | `Permanent` |

use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{ErrorKind, RedisError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use brushwork_events::{BrokerPublisher, Headers, PublishError};

/// Default stream key prefix.
pub const DEFAULT_STREAM_PREFIX: &str = "brushwork";

/// Redis rejects bulk strings over 512 MiB; stay well under it.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct RedisStreamsPublisher {
    client: Arc<redis::Client>,
    connection: Arc<Mutex<Option<MultiplexedConnection>>>,
    stream_prefix: String,
    max_payload_bytes: usize,
}

impl RedisStreamsPublisher {
    /// Create a publisher. No connection is made until the first publish.
    ///
    /// * `redis_url` - e.g. "redis://localhost:6379"
    /// * `stream_prefix` - defaults to [`DEFAULT_STREAM_PREFIX`]
    pub fn new(
        redis_url: impl AsRef<str>,
        stream_prefix: Option<String>,
    ) -> Result<Self, RedisError> {
        let client = redis::Client::open(redis_url.as_ref())?;
        Ok(Self {
            client: Arc::new(client),
            connection: Arc::new(Mutex::new(None)),
            stream_prefix: stream_prefix.unwrap_or_else(|| DEFAULT_STREAM_PREFIX.to_string()),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        })
    }

    pub fn with_max_payload_bytes(mut self, max: usize) -> Self {
        self.max_payload_bytes = max;
        self
    }

    pub fn stream_key(&self, topic: &str) -> String {
        stream_key(&self.stream_prefix, topic)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, RedisError> {
        let mut cached = self.connection.lock().await;
        if let Some(conn) = cached.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        *cached = Some(conn.clone());
        Ok(conn)
    }

    async fn reset_connection(&self) {
        self.connection.lock().await.take();
    }

    async fn xadd(&self, key: &str, payload: &[u8], headers: &Headers) -> Result<(), RedisError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("XADD");
        cmd.arg(key).arg("*");
        for (name, value) in headers {
            cmd.arg(name).arg(value);
        }
        cmd.arg("payload").arg(payload);
        let _: String = cmd.query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl BrokerPublisher for RedisStreamsPublisher {
    #[instrument(skip(self, payload, headers, cancel), fields(stream = %self.stream_key(topic)), err)]
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        headers: &Headers,
        cancel: &CancellationToken,
    ) -> Result<(), PublishError> {
        if payload.len() > self.max_payload_bytes {
            return Err(PublishError::permanent(format!(
                "payload of {} bytes exceeds the {} byte limit",
                payload.len(),
                self.max_payload_bytes
            )));
        }

        let key = self.stream_key(topic);
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(PublishError::transient("cancelled")),
            result = self.xadd(&key, payload, headers) => result,
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                if is_connection_error(&e) {
                    warn!(stream = %key, error = %e, "redis connection lost, reconnecting on next publish");
                    self.reset_connection().await;
                }
                Err(classify(&e))
            }
        }
    }
}

fn stream_key(prefix: &str, topic: &str) -> String {
    format!("{prefix}:{topic}")
}

fn is_connection_error(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
}

fn classify(e: &RedisError) -> PublishError {
    if is_connection_error(e) || e.is_cluster_error() {
        return PublishError::transient(e.to_string());
    }
    match e.kind() {
        ErrorKind::ResponseError | ErrorKind::TypeError => PublishError::permanent(e.to_string()),
        ErrorKind::ExtensionError if e.code() == Some("WRONGTYPE") => {
            PublishError::permanent(e.to_string())
        }
        _ => PublishError::transient(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_key_includes_prefix_and_topic() {
        assert_eq!(stream_key("brushwork", "MaterialCreated.v1"), "brushwork:MaterialCreated.v1");
    }

    #[test]
    fn classifies_connection_errors_as_transient() {
        let io = RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(!classify(&io).is_permanent());

        let loading = RedisError::from((ErrorKind::BusyLoadingError, "loading"));
        assert!(!classify(&loading).is_permanent());
    }

    #[test]
    fn classifies_rejections_as_permanent() {
        let response = RedisError::from((ErrorKind::ResponseError, "syntax error"));
        assert!(classify(&response).is_permanent());

        let wrong_type = RedisError::from((ErrorKind::TypeError, "wrong type"));
        assert!(classify(&wrong_type).is_permanent());
    }

    #[tokio::test]
    async fn oversize_payload_is_rejected_without_connecting() {
        let publisher = RedisStreamsPublisher::new("redis://127.0.0.1:1", None)
            .unwrap()
            .with_max_payload_bytes(4);
        let err = publisher
            .publish("T.v1", b"too large", &Headers::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_permanent());
    }
}
