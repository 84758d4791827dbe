//! Process wiring for the outbox dispatcher service.
//!
//! One process runs a dispatcher for each outbox table (domain and
//! integration) against Postgres, publishing to Redis Streams.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `DATABASE_URL` | - | Postgres connection URL (required) |
//! | `REDIS_URL` | `redis://localhost:6379` | Broker connection URL |
//! | `OUTBOX_STREAM_PREFIX` | `brushwork` | Stream key prefix |
//! | `METRICS_ADDR` | - | Serve Prometheus metrics on this address when set |
//! | `OUTBOX_*` | see `DispatcherConfig` | Poll, batch, claim and retry tuning |
//! | `RUST_LOG` / `LOG_FORMAT` | `info` / `json` | Logging |

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::info;

use brushwork_events::catalog;
use brushwork_outbox::redis_streams::DEFAULT_STREAM_PREFIX;
use brushwork_outbox::{
    DispatcherConfig, MetricsFacade, OutboxDispatcher, OutboxKind, PostgresOutboxStore,
    RedisStreamsPublisher,
};

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_REDIS_URL: &str = "REDIS_URL";
pub const ENV_STREAM_PREFIX: &str = "OUTBOX_STREAM_PREFIX";
pub const ENV_METRICS_ADDR: &str = "METRICS_ADDR";

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid {key}={value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Connection settings for the service process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub database_url: String,
    pub redis_url: String,
    pub stream_prefix: String,
    pub metrics_addr: Option<SocketAddr>,
}

impl Settings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let database_url = get(ENV_DATABASE_URL).ok_or(SettingsError::Missing(ENV_DATABASE_URL))?;
        let metrics_addr = match get(ENV_METRICS_ADDR) {
            Some(v) => Some(v.parse().map_err(|_| SettingsError::Invalid {
                key: ENV_METRICS_ADDR,
                value: v,
            })?),
            None => None,
        };

        Ok(Self {
            database_url,
            redis_url: get(ENV_REDIS_URL).unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
            stream_prefix: get(ENV_STREAM_PREFIX).unwrap_or_else(|| DEFAULT_STREAM_PREFIX.to_string()),
            metrics_addr,
        })
    }
}

/// Start both dispatchers and run until `shutdown` resolves.
pub async fn run<F>(settings: Settings, config: DispatcherConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    if let Some(addr) = settings.metrics_addr {
        brushwork_observability::metrics::install_prometheus(addr)?;
    }

    let pool = PgPool::connect(&settings.database_url)
        .await
        .context("failed to connect to Postgres")?;
    let publisher = Arc::new(
        RedisStreamsPublisher::new(&settings.redis_url, Some(settings.stream_prefix.clone()))
            .context("invalid REDIS_URL")?,
    );
    let registry = Arc::new(catalog::registry().context("event catalog is inconsistent")?);

    let cancel = CancellationToken::new();
    let mut handles = Vec::new();
    for kind in [OutboxKind::Domain, OutboxKind::Integration] {
        let store = PostgresOutboxStore::new(pool.clone(), kind);
        store
            .init_schema()
            .await
            .with_context(|| format!("failed to create {} table", kind.table_name()))?;

        let dispatcher = OutboxDispatcher::new(
            kind,
            Arc::new(store),
            publisher.clone(),
            registry.clone(),
            config.clone(),
        )
        .with_metrics(Arc::new(MetricsFacade::new(kind)));
        handles.push(dispatcher.spawn(cancel.child_token()));
    }

    info!(
        instance = %config.instance_name,
        stream_prefix = %settings.stream_prefix,
        "outbox dispatcher service started"
    );

    shutdown.await;
    info!("shutdown signal received");

    cancel.cancel();
    for handle in handles {
        handle.shutdown().await;
    }
    pool.close().await;

    info!("outbox dispatcher service stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn database_url_is_required() {
        assert_eq!(
            Settings::from_lookup(lookup(&[])),
            Err(SettingsError::Missing(ENV_DATABASE_URL))
        );
        assert_eq!(
            Settings::from_lookup(lookup(&[(ENV_DATABASE_URL, "  ")])),
            Err(SettingsError::Missing(ENV_DATABASE_URL))
        );
    }

    #[test]
    fn defaults_apply_to_optional_settings() {
        let settings =
            Settings::from_lookup(lookup(&[(ENV_DATABASE_URL, "postgres://localhost/app")])).unwrap();
        assert_eq!(settings.redis_url, DEFAULT_REDIS_URL);
        assert_eq!(settings.stream_prefix, "brushwork");
        assert_eq!(settings.metrics_addr, None);
    }

    #[test]
    fn parses_metrics_addr() {
        let settings = Settings::from_lookup(lookup(&[
            (ENV_DATABASE_URL, "postgres://localhost/app"),
            (ENV_METRICS_ADDR, "0.0.0.0:9090"),
            (ENV_STREAM_PREFIX, "studio"),
        ]))
        .unwrap();
        assert_eq!(settings.metrics_addr, Some("0.0.0.0:9090".parse().unwrap()));
        assert_eq!(settings.stream_prefix, "studio");

        let err = Settings::from_lookup(lookup(&[
            (ENV_DATABASE_URL, "postgres://localhost/app"),
            (ENV_METRICS_ADDR, "not-an-addr"),
        ]))
        .unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { key: ENV_METRICS_ADDR, .. }));
    }
}
