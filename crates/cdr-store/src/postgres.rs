use std::time::Duration;

use async_trait::async_trait;
use cdr_common::{
    CallRecord, CallStatus, CompletedCall, Disposition, IdentityUpdate, LifecycleSnapshot,
    RawEvent,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};

use crate::{CallStore, Result, StoreError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS calls (
        call_id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        start_time TIMESTAMPTZ,
        answer_time TIMESTAMPTZ,
        end_time TIMESTAMPTZ,
        duration_seconds INTEGER CHECK (duration_seconds >= 0),
        disposition TEXT,
        user_id TEXT,
        contact_id BIGINT,
        tenant_id TEXT,
        recording_url TEXT,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS call_events (
        id BIGSERIAL PRIMARY KEY,
        call_id TEXT,
        event_type TEXT NOT NULL,
        event_timestamp TIMESTAMPTZ NOT NULL,
        payload TEXT NOT NULL,
        received_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_call_events_call_id ON call_events(call_id)",
];

const UPSERT_IDENTITY: &str = r#"
    INSERT INTO calls (call_id, status, user_id, contact_id, tenant_id, updated_at)
    VALUES ($1, 'IDENTIFIED', $2, $3, $4, NOW())
    ON CONFLICT (call_id) DO UPDATE SET
        user_id = COALESCE(EXCLUDED.user_id, calls.user_id),
        contact_id = COALESCE(EXCLUDED.contact_id, calls.contact_id),
        tenant_id = COALESCE(EXCLUDED.tenant_id, calls.tenant_id),
        status = CASE WHEN calls.status = 'STARTED' THEN 'IDENTIFIED' ELSE calls.status END,
        updated_at = NOW()
"#;

/// Same merge, but a completed row is left as it is
const UPSERT_IDENTITY_UNLESS_COMPLETED: &str = r#"
    INSERT INTO calls (call_id, status, user_id, contact_id, tenant_id, updated_at)
    VALUES ($1, 'IDENTIFIED', $2, $3, $4, NOW())
    ON CONFLICT (call_id) DO UPDATE SET
        user_id = COALESCE(EXCLUDED.user_id, calls.user_id),
        contact_id = COALESCE(EXCLUDED.contact_id, calls.contact_id),
        tenant_id = COALESCE(EXCLUDED.tenant_id, calls.tenant_id),
        status = CASE WHEN calls.status = 'STARTED' THEN 'IDENTIFIED' ELSE calls.status END,
        updated_at = NOW()
    WHERE calls.status <> 'COMPLETED'
"#;

pub struct PostgresCallStore {
    pool: PgPool,
}

impl PostgresCallStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool. Connections are established lazily on first use.
    pub fn connect_lazy(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(url)
            .map_err(|e| StoreError::Schema(Box::new(e)))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Schema(Box::new(e)))?;
        }
        info!("Call tables ready");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn decode_record(row: &PgRow) -> Result<CallRecord> {
    let call_id: String = row
        .try_get("call_id")
        .map_err(|e| StoreError::query("get", None, e))?;
    let column = |name: &'static str, e: sqlx::Error| StoreError::Decode {
        call_id: call_id.clone(),
        column: name,
        reason: e.to_string(),
    };

    let status: String = row.try_get("status").map_err(|e| column("status", e))?;
    let status: CallStatus = status.parse().map_err(|e: cdr_common::DomainError| {
        StoreError::Decode {
            call_id: call_id.clone(),
            column: "status",
            reason: e.to_string(),
        }
    })?;

    Ok(CallRecord {
        status,
        start_time: row.try_get("start_time").map_err(|e| column("start_time", e))?,
        answer_time: row
            .try_get("answer_time")
            .map_err(|e| column("answer_time", e))?,
        end_time: row.try_get("end_time").map_err(|e| column("end_time", e))?,
        duration_seconds: row
            .try_get("duration_seconds")
            .map_err(|e| column("duration_seconds", e))?,
        disposition: decode_disposition(&call_id, row)?,
        user_id: row.try_get("user_id").map_err(|e| column("user_id", e))?,
        contact_id: row.try_get("contact_id").map_err(|e| column("contact_id", e))?,
        tenant_id: row.try_get("tenant_id").map_err(|e| column("tenant_id", e))?,
        recording_url: row
            .try_get("recording_url")
            .map_err(|e| column("recording_url", e))?,
        updated_at: row.try_get("updated_at").map_err(|e| column("updated_at", e))?,
        call_id,
    })
}

fn decode_disposition(call_id: &str, row: &PgRow) -> Result<Option<Disposition>> {
    let raw: Option<String> = row.try_get("disposition").map_err(|e| StoreError::Decode {
        call_id: call_id.to_string(),
        column: "disposition",
        reason: e.to_string(),
    })?;

    raw.map(|value| {
        value.parse().map_err(|e: cdr_common::DomainError| StoreError::Decode {
            call_id: call_id.to_string(),
            column: "disposition",
            reason: e.to_string(),
        })
    })
    .transpose()
}

#[async_trait]
impl CallStore for PostgresCallStore {
    async fn append_raw_event(&self, event: &RawEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO call_events (call_id, event_type, event_timestamp, payload) VALUES ($1, $2, $3, $4)",
        )
        .bind(&event.call_id)
        .bind(&event.event_type)
        .bind(event.event_timestamp)
        .bind(&event.payload)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::query("append_raw_event", event.call_id.as_deref(), e))?;
        Ok(())
    }

    async fn upsert_started(&self, call_id: &str, start_time: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO calls (call_id, status, start_time, updated_at)
            VALUES ($1, 'STARTED', $2, NOW())
            ON CONFLICT (call_id) DO UPDATE SET
                start_time = COALESCE(calls.start_time, EXCLUDED.start_time),
                duration_seconds = CASE
                    WHEN calls.status = 'COMPLETED'
                        AND calls.duration_seconds IS NULL
                        AND calls.answer_time IS NULL
                        AND calls.start_time IS NULL
                        AND calls.end_time IS NOT NULL
                    THEN GREATEST(0, FLOOR(EXTRACT(EPOCH FROM (calls.end_time - EXCLUDED.start_time))))::INTEGER
                    ELSE calls.duration_seconds
                END,
                updated_at = NOW()
            "#,
        )
        .bind(call_id)
        .bind(start_time)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::query("upsert_started", Some(call_id), e))?;
        Ok(())
    }

    async fn upsert_answered(&self, call_id: &str, answer_time: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO calls (call_id, status, answer_time, disposition, updated_at)
            VALUES ($1, 'STARTED', $2, 'ANSWERED', NOW())
            ON CONFLICT (call_id) DO UPDATE SET
                answer_time = COALESCE(calls.answer_time, EXCLUDED.answer_time),
                disposition = 'ANSWERED',
                updated_at = NOW()
            WHERE calls.status <> 'COMPLETED'
            "#,
        )
        .bind(call_id)
        .bind(answer_time)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::query("upsert_answered", Some(call_id), e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn lifecycle_snapshot(&self, call_id: &str) -> Result<Option<LifecycleSnapshot>> {
        let row = sqlx::query(
            "SELECT start_time, answer_time, disposition FROM calls WHERE call_id = $1",
        )
        .bind(call_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::query("lifecycle_snapshot", Some(call_id), e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let decode = |column: &'static str, e: sqlx::Error| StoreError::Decode {
            call_id: call_id.to_string(),
            column,
            reason: e.to_string(),
        };

        Ok(Some(LifecycleSnapshot {
            start_time: row.try_get("start_time").map_err(|e| decode("start_time", e))?,
            answer_time: row
                .try_get("answer_time")
                .map_err(|e| decode("answer_time", e))?,
            disposition: decode_disposition(call_id, &row)?,
        }))
    }

    async fn upsert_ended(&self, call_id: &str, completed: &CompletedCall) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO calls (call_id, status, end_time, duration_seconds, disposition, updated_at)
            VALUES ($1, 'COMPLETED', $2, $3, $4, NOW())
            ON CONFLICT (call_id) DO UPDATE SET
                status = 'COMPLETED',
                end_time = EXCLUDED.end_time,
                duration_seconds = CASE
                    WHEN calls.answer_time IS NOT NULL
                    THEN GREATEST(0, FLOOR(EXTRACT(EPOCH FROM (EXCLUDED.end_time - calls.answer_time))))::INTEGER
                    ELSE COALESCE(
                        EXCLUDED.duration_seconds,
                        CASE WHEN calls.start_time IS NOT NULL
                            THEN GREATEST(0, FLOOR(EXTRACT(EPOCH FROM (EXCLUDED.end_time - calls.start_time))))::INTEGER
                        END
                    )
                END,
                disposition = CASE
                    WHEN calls.disposition = 'ANSWERED' OR calls.answer_time IS NOT NULL
                    THEN 'ANSWERED'
                    ELSE EXCLUDED.disposition
                END,
                updated_at = NOW()
            WHERE calls.status <> 'COMPLETED'
            "#,
        )
        .bind(call_id)
        .bind(completed.end_time)
        .bind(completed.duration_seconds)
        .bind(completed.disposition.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::query("upsert_ended", Some(call_id), e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_identity(
        &self,
        call_id: &str,
        identity: &IdentityUpdate,
        allow_late: bool,
    ) -> Result<bool> {
        let statement = if allow_late {
            UPSERT_IDENTITY
        } else {
            UPSERT_IDENTITY_UNLESS_COMPLETED
        };

        let result = sqlx::query(statement)
            .bind(call_id)
            .bind(&identity.user_id)
            .bind(identity.contact_id)
            .bind(&identity.tenant_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::query("upsert_identity", Some(call_id), e))?;

        let applied = result.rows_affected() > 0;
        if !applied {
            debug!(call_id, "Identity update skipped for completed call");
        }
        Ok(applied)
    }

    async fn upsert_recording(&self, call_id: &str, recording_url: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO calls (call_id, status, recording_url, updated_at)
            VALUES ($1, 'STARTED', $2, NOW())
            ON CONFLICT (call_id) DO UPDATE SET
                recording_url = EXCLUDED.recording_url,
                updated_at = NOW()
            "#,
        )
        .bind(call_id)
        .bind(recording_url)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::query("upsert_recording", Some(call_id), e))?;
        Ok(())
    }

    async fn get(&self, call_id: &str) -> Result<Option<CallRecord>> {
        let row = sqlx::query(
            r#"
            SELECT call_id, status, start_time, answer_time, end_time, duration_seconds,
                   disposition, user_id, contact_id, tenant_id, recording_url, updated_at
            FROM calls WHERE call_id = $1
            "#,
        )
        .bind(call_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::query("get", Some(call_id), e))?;

        row.as_ref().map(decode_record).transpose()
    }
}
