//! Postgres-backed outbox store.
//!
//! Each [`OutboxKind`] has its own table with an identical schema. The clock is
//! always bound as a parameter, never read from `now()` on the server, so the
//! dispatcher and the database agree on what "due" means.
//!
//! ## Error Mapping
//!
//! | SQLx Error | OutboxStoreError |
//! |------------|------------------|
//! | Database (any code) | `Storage` |
//! | ColumnDecode / Decode | `Serialization` |
//! | PoolClosed, Io, anything else | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use brushwork_core::TenantId;

use super::{Due, FailedAttempt, OutboxStats, OutboxStore, OutboxStoreError, OutboxWriter};
use crate::message::{ClaimId, MessageId, OutboxKind, OutboxMessage};

const COLUMNS: &str = "id, name, version, tenant_id, username, occurred_utc, correlation_id, \
    causation_id, trace_id, parent_span_id, trace_flags, trace_state, payload, created_utc, \
    processed_utc, attempts, do_not_process_before_utc, claimed_by, claimed_until, is_poisoned, \
    last_error";

/// Due predicate over `$1 = now`, `$2 = max_attempts`.
const DUE: &str = "processed_utc IS NULL AND NOT is_poisoned \
    AND (do_not_process_before_utc IS NULL OR do_not_process_before_utc <= $1) \
    AND (claimed_until IS NULL OR claimed_until < $1) \
    AND attempts < $2";

/// Postgres-backed outbox store for one [`OutboxKind`].
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: Arc<PgPool>,
    kind: OutboxKind,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool, kind: OutboxKind) -> Self {
        Self {
            pool: Arc::new(pool),
            kind,
        }
    }

    pub fn kind(&self) -> OutboxKind {
        self.kind
    }

    fn table(&self) -> &'static str {
        self.kind.table_name()
    }

    /// Create the table and its indexes if they do not exist.
    #[instrument(skip(self), fields(outbox = %self.kind), err)]
    pub async fn init_schema(&self) -> Result<(), OutboxStoreError> {
        let table = self.table();
        let statements = [
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id UUID PRIMARY KEY,
                    name TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    tenant_id UUID NOT NULL,
                    username TEXT NOT NULL,
                    occurred_utc TIMESTAMPTZ NOT NULL,
                    correlation_id TEXT,
                    causation_id TEXT,
                    trace_id TEXT,
                    parent_span_id TEXT,
                    trace_flags SMALLINT,
                    trace_state TEXT,
                    payload TEXT NOT NULL,
                    created_utc TIMESTAMPTZ NOT NULL,
                    processed_utc TIMESTAMPTZ,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    do_not_process_before_utc TIMESTAMPTZ,
                    claimed_by TEXT,
                    claimed_until TIMESTAMPTZ,
                    is_poisoned BOOLEAN NOT NULL DEFAULT FALSE,
                    last_error TEXT
                )
                "#
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {table}_due_idx ON {table} (created_utc, id) \
                 WHERE processed_utc IS NULL AND NOT is_poisoned"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {table}_claimed_by_idx ON {table} (claimed_by) \
                 WHERE claimed_by IS NOT NULL"
            ),
        ];

        for sql in &statements {
            sqlx::query(sql)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("init_schema", e))?;
        }
        Ok(())
    }

    /// Writer that stages rows inside `tx`, so they commit with the caller's
    /// business changes.
    pub fn writer<'a, 'c>(&self, tx: &'a mut Transaction<'c, Postgres>) -> PgOutboxWriter<'a, 'c> {
        PgOutboxWriter::new(self.kind, tx)
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    #[instrument(skip(self, message), fields(outbox = %self.kind, message_id = %message.id), err)]
    async fn insert(&self, message: OutboxMessage) -> Result<(), OutboxStoreError> {
        let sql = insert_sql(self.table());
        bind_insert(sqlx::query(&sql), &message)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert", e))?;
        Ok(())
    }

    async fn has_due(&self, due: Due) -> Result<bool, OutboxStoreError> {
        let sql = format!("SELECT EXISTS (SELECT 1 FROM {} WHERE {DUE})", self.table());
        let row = sqlx::query(&sql)
            .bind(due.now)
            .bind(attempts_param(due.max_attempts))
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("has_due", e))?;
        row.try_get::<bool, _>(0)
            .map_err(|e| map_sqlx_error("has_due", e))
    }

    #[instrument(skip(self), fields(outbox = %self.kind), err)]
    async fn select_due_ids(
        &self,
        due: Due,
        limit: usize,
    ) -> Result<Vec<MessageId>, OutboxStoreError> {
        let sql = format!(
            "SELECT id FROM {} WHERE {DUE} ORDER BY created_utc ASC, id ASC LIMIT $3",
            self.table()
        );
        let rows = sqlx::query(&sql)
            .bind(due.now)
            .bind(attempts_param(due.max_attempts))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("select_due_ids", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<Uuid, _>("id")
                    .map(MessageId::from_uuid)
                    .map_err(|e| map_sqlx_error("select_due_ids", e))
            })
            .collect()
    }

    #[instrument(
        skip(self, ids, claim),
        fields(outbox = %self.kind, claim = %claim, candidates = ids.len()),
        err
    )]
    async fn claim(
        &self,
        ids: &[MessageId],
        due: Due,
        claim: &ClaimId,
        until: DateTime<Utc>,
    ) -> Result<u64, OutboxStoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE {} SET claimed_by = $3, claimed_until = $4 WHERE id = ANY($5) AND {DUE}",
            self.table()
        );
        let ids: Vec<Uuid> = ids.iter().map(MessageId::as_uuid).collect();
        let result = sqlx::query(&sql)
            .bind(due.now)
            .bind(attempts_param(due.max_attempts))
            .bind(claim.as_str())
            .bind(until)
            .bind(&ids)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, claim), fields(outbox = %self.kind, claim = %claim), err)]
    async fn fetch_claimed(
        &self,
        claim: &ClaimId,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, OutboxStoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE claimed_by = $1 AND claimed_until >= $2 \
             ORDER BY created_utc ASC, id ASC",
            self.table()
        );
        let rows = sqlx::query(&sql)
            .bind(claim.as_str())
            .bind(now)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_claimed", e))?;
        rows.iter().map(message_from_row).collect()
    }

    #[instrument(skip(self), fields(outbox = %self.kind, message_id = %id), err)]
    async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, OutboxStoreError> {
        let sql = format!("SELECT {COLUMNS} FROM {} WHERE id = $1", self.table());
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(message_from_row).transpose()
    }

    #[instrument(skip(self), fields(outbox = %self.kind, message_id = %id), err)]
    async fn mark_processed(
        &self,
        id: MessageId,
        now: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError> {
        let sql = format!(
            "UPDATE {} SET processed_utc = $2 \
             WHERE id = $1 AND processed_utc IS NULL AND NOT is_poisoned",
            self.table()
        );
        let result = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(now)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_processed", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(outbox = %self.kind, message_id = %id), err)]
    async fn mark_poisoned(&self, id: MessageId, reason: &str) -> Result<bool, OutboxStoreError> {
        let sql = format!(
            "UPDATE {} SET is_poisoned = TRUE, last_error = $2 \
             WHERE id = $1 AND processed_utc IS NULL AND NOT is_poisoned",
            self.table()
        );
        let result = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(reason)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_poisoned", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(
        skip(self, attempt),
        fields(outbox = %self.kind, message_id = %id, attempts = attempt.previous_attempts + 1),
        err
    )]
    async fn record_failure(
        &self,
        id: MessageId,
        attempt: &FailedAttempt,
    ) -> Result<bool, OutboxStoreError> {
        let sql = format!(
            "UPDATE {} SET attempts = $3, do_not_process_before_utc = $4, last_error = $5, \
             is_poisoned = $6 \
             WHERE id = $1 AND attempts = $2 AND processed_utc IS NULL AND NOT is_poisoned",
            self.table()
        );
        let result = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(attempts_param(attempt.previous_attempts))
            .bind(attempts_param(attempt.previous_attempts.saturating_add(1)))
            .bind(attempt.retry_at)
            .bind(&attempt.error)
            .bind(attempt.exhausted)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("record_failure", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(outbox = %self.kind), err)]
    async fn stats(&self, due: Due) -> Result<OutboxStats, OutboxStoreError> {
        let live = "processed_utc IS NULL AND NOT is_poisoned AND attempts < $2";
        let unclaimed = "(claimed_until IS NULL OR claimed_until < $1)";
        let sql = format!(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE processed_utc IS NOT NULL) AS processed,
                COUNT(*) FILTER (WHERE processed_utc IS NULL AND is_poisoned) AS poisoned,
                COUNT(*) FILTER (
                    WHERE processed_utc IS NULL AND NOT is_poisoned AND attempts >= $2
                ) AS stalled,
                COUNT(*) FILTER (WHERE {live} AND claimed_until >= $1) AS claimed,
                COUNT(*) FILTER (
                    WHERE {live} AND {unclaimed} AND do_not_process_before_utc > $1
                ) AS backing_off,
                COUNT(*) FILTER (
                    WHERE {live} AND {unclaimed}
                    AND (do_not_process_before_utc IS NULL OR do_not_process_before_utc <= $1)
                ) AS pending
            FROM {table}
            "#,
            table = self.table()
        );
        let row = sqlx::query(&sql)
            .bind(due.now)
            .bind(attempts_param(due.max_attempts))
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let count = |column: &str| -> Result<u64, OutboxStoreError> {
            let n: i64 = row.try_get(column).map_err(|e| map_sqlx_error("stats", e))?;
            Ok(n.max(0) as u64)
        };
        Ok(OutboxStats {
            pending: count("pending")?,
            backing_off: count("backing_off")?,
            claimed: count("claimed")?,
            processed: count("processed")?,
            poisoned: count("poisoned")?,
            stalled: count("stalled")?,
        })
    }

    #[instrument(skip(self), fields(outbox = %self.kind, message_id = %id), err)]
    async fn requeue(&self, id: MessageId) -> Result<bool, OutboxStoreError> {
        let sql = format!(
            "UPDATE {} SET is_poisoned = FALSE, attempts = 0, do_not_process_before_utc = NULL, \
             claimed_by = NULL, claimed_until = NULL, last_error = NULL \
             WHERE id = $1 AND processed_utc IS NULL AND (is_poisoned OR attempts > 0)",
            self.table()
        );
        let result = sqlx::query(&sql)
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("requeue", e))?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get(id).await? {
            Some(_) => Ok(false),
            None => Err(OutboxStoreError::NotFound(id)),
        }
    }
}

/// Stages outbox rows in a caller-owned Postgres transaction.
pub struct PgOutboxWriter<'a, 'c> {
    kind: OutboxKind,
    tx: &'a mut Transaction<'c, Postgres>,
}

impl<'a, 'c> PgOutboxWriter<'a, 'c> {
    pub fn new(kind: OutboxKind, tx: &'a mut Transaction<'c, Postgres>) -> Self {
        Self { kind, tx }
    }
}

#[async_trait]
impl OutboxWriter for PgOutboxWriter<'_, '_> {
    #[instrument(skip(self, message), fields(outbox = %self.kind, message_id = %message.id), err)]
    async fn write(&mut self, message: OutboxMessage) -> Result<(), OutboxStoreError> {
        let sql = insert_sql(self.kind.table_name());
        bind_insert(sqlx::query(&sql), &message)
            .execute(&mut **self.tx)
            .await
            .map_err(|e| map_sqlx_error("write", e))?;
        Ok(())
    }
}

fn insert_sql(table: &str) -> String {
    format!(
        "INSERT INTO {table} ({COLUMNS}) VALUES \
         ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)"
    )
}

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>;

fn bind_insert<'q>(query: PgQuery<'q>, m: &'q OutboxMessage) -> PgQuery<'q> {
    query
        .bind(m.id.as_uuid())
        .bind(&m.name)
        .bind(i32::from(m.version))
        .bind(m.tenant_id.as_uuid())
        .bind(&m.username)
        .bind(m.occurred_utc)
        .bind(&m.correlation_id)
        .bind(&m.causation_id)
        .bind(&m.trace_id)
        .bind(&m.parent_span_id)
        .bind(m.trace_flags.map(i16::from))
        .bind(&m.trace_state)
        .bind(&m.payload)
        .bind(m.created_utc)
        .bind(m.processed_utc)
        .bind(attempts_param(m.attempts))
        .bind(m.do_not_process_before_utc)
        .bind(m.claimed_by.as_ref().map(ClaimId::as_str))
        .bind(m.claimed_until)
        .bind(m.is_poisoned)
        .bind(&m.last_error)
}

fn attempts_param(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

fn message_from_row(row: &sqlx::postgres::PgRow) -> Result<OutboxMessage, OutboxStoreError> {
    let decode = |e| map_sqlx_error("decode", e);

    let version: i32 = row.try_get("version").map_err(decode)?;
    let version = u16::try_from(version)
        .map_err(|_| OutboxStoreError::Serialization(format!("version out of range: {version}")))?;
    let trace_flags: Option<i16> = row.try_get("trace_flags").map_err(decode)?;
    let trace_flags = trace_flags
        .map(|f| {
            u8::try_from(f)
                .map_err(|_| OutboxStoreError::Serialization(format!("trace_flags out of range: {f}")))
        })
        .transpose()?;
    let attempts: i32 = row.try_get("attempts").map_err(decode)?;
    let claimed_by: Option<String> = row.try_get("claimed_by").map_err(decode)?;

    Ok(OutboxMessage {
        id: MessageId::from_uuid(row.try_get("id").map_err(decode)?),
        name: row.try_get("name").map_err(decode)?,
        version,
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(decode)?),
        username: row.try_get("username").map_err(decode)?,
        occurred_utc: row.try_get("occurred_utc").map_err(decode)?,
        correlation_id: row.try_get("correlation_id").map_err(decode)?,
        causation_id: row.try_get("causation_id").map_err(decode)?,
        trace_id: row.try_get("trace_id").map_err(decode)?,
        parent_span_id: row.try_get("parent_span_id").map_err(decode)?,
        trace_flags,
        trace_state: row.try_get("trace_state").map_err(decode)?,
        payload: row.try_get("payload").map_err(decode)?,
        created_utc: row.try_get("created_utc").map_err(decode)?,
        processed_utc: row.try_get("processed_utc").map_err(decode)?,
        attempts: attempts.max(0) as u32,
        do_not_process_before_utc: row.try_get("do_not_process_before_utc").map_err(decode)?,
        claimed_by: claimed_by.map(ClaimId::from),
        claimed_until: row.try_get("claimed_until").map_err(decode)?,
        is_poisoned: row.try_get("is_poisoned").map_err(decode)?,
        last_error: row.try_get("last_error").map_err(decode)?,
    })
}

/// Map SQLx errors to outbox store errors.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OutboxStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => OutboxStoreError::Storage(format!("duplicate row: {msg}")),
                _ => OutboxStoreError::Storage(msg),
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            OutboxStoreError::Serialization(format!("decode error in {}: {}", operation, err))
        }
        sqlx::Error::PoolClosed => {
            OutboxStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => OutboxStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
