//! # Relational Queue Transport
//!
//! A durable, competing-consumers queue built from two rows-are-messages
//! tables (ready, scheduled) plus a LISTEN/NOTIFY wake-up channel. Dequeue
//! holds an open transaction as a lease: `SELECT ... FOR UPDATE SKIP
//! LOCKED` guarantees no two lease holders, in this process or another,
//! ever observe the same row.

pub mod listener;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::is_valid_schema_name;
use crate::envelope::Envelope;
use crate::error::{CourierError, Result};
use crate::storage::postgres::EnvelopeRow;

const QUEUE_COLUMNS: &str = "id, body, message_type, content_type, destination, reply_uri, \
     correlation_id, conversation_id, parent_id, source, attempts, execution_time, \
     keep_until, sent_at";

/// One logical queue persisted as a ready/scheduled table pair under the
/// configured schema.
#[derive(Debug, Clone)]
pub struct PostgresQueue {
    pool: PgPool,
    schema: String,
    name: String,
}

impl PostgresQueue {
    pub fn new(pool: PgPool, schema: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let schema = schema.into();
        let name = name.into();
        // Queue names are interpolated into DDL and channel names.
        if !is_valid_schema_name(&name) {
            return Err(CourierError::configuration(format!(
                "queue name {name:?} is not a valid identifier"
            )));
        }
        Ok(Self { pool, schema, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The pg_notify channel fired by the insert trigger on the ready table.
    pub fn channel(&self) -> String {
        format!("{}_{}_queue", self.schema, self.name)
    }

    fn ready_table(&self) -> String {
        format!("{}.{}_queue", self.schema, self.name)
    }

    fn scheduled_table(&self) -> String {
        format!("{}.{}_queue_scheduled", self.schema, self.name)
    }

    /// Idempotent check-then-create of both tables and the notification
    /// trigger.
    pub async fn ensure_schema(&self) -> Result<()> {
        let ready = self.ready_table();
        let scheduled = self.scheduled_table();
        let channel = self.channel();
        let trigger_fn = format!("{}.{}_queue_notify", self.schema, self.name);
        let columns = r#"
                id              uuid PRIMARY KEY,
                body            bytea NOT NULL,
                message_type    varchar NOT NULL,
                content_type    varchar NOT NULL DEFAULT 'application/octet-stream',
                destination     varchar,
                reply_uri       varchar,
                correlation_id  varchar,
                conversation_id uuid,
                parent_id       uuid,
                source          varchar,
                attempts        integer NOT NULL DEFAULT 0,
                execution_time  timestamptz NOT NULL DEFAULT now(),
                keep_until      timestamptz,
                sent_at         timestamptz NOT NULL DEFAULT now()
        "#;

        let ddl = [
            format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema),
            format!("CREATE TABLE IF NOT EXISTS {ready} ({columns})"),
            format!("CREATE TABLE IF NOT EXISTS {scheduled} ({columns})"),
            format!(
                "CREATE INDEX IF NOT EXISTS {}_queue_due_idx ON {ready} (execution_time)",
                self.name
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {}_queue_scheduled_due_idx ON {scheduled} (execution_time)",
                self.name
            ),
            format!(
                "CREATE OR REPLACE FUNCTION {trigger_fn}() RETURNS trigger AS $$ \
                 BEGIN \
                     PERFORM pg_notify('{channel}', NEW.id::text); \
                     RETURN NEW; \
                 END; \
                 $$ LANGUAGE plpgsql"
            ),
            format!(
                "DROP TRIGGER IF EXISTS {}_queue_notify_trg ON {ready}",
                self.name
            ),
            format!(
                "CREATE TRIGGER {}_queue_notify_trg AFTER INSERT ON {ready} \
                 FOR EACH ROW EXECUTE FUNCTION {trigger_fn}()",
                self.name
            ),
        ];
        for statement in &ddl {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!(queue = %self.name, "queue schema ensured");
        Ok(())
    }

    pub async fn teardown(&self) -> Result<()> {
        for statement in [
            format!("DROP TABLE IF EXISTS {}", self.ready_table()),
            format!("DROP TABLE IF EXISTS {}", self.scheduled_table()),
            format!(
                "DROP FUNCTION IF EXISTS {}.{}_queue_notify()",
                self.schema, self.name
            ),
        ] {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Delete every row from both tables.
    pub async fn purge(&self) -> Result<u64> {
        let mut purged = sqlx::query(&format!("DELETE FROM {}", self.ready_table()))
            .execute(&self.pool)
            .await?
            .rows_affected();
        purged += sqlx::query(&format!("DELETE FROM {}", self.scheduled_table()))
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(purged)
    }

    pub async fn ready_count(&self) -> Result<u64> {
        let row = sqlx::query(&format!("SELECT count(*) AS n FROM {}", self.ready_table()))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    pub async fn scheduled_count(&self) -> Result<u64> {
        let row = sqlx::query(&format!(
            "SELECT count(*) AS n FROM {}",
            self.scheduled_table()
        ))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    /// Enqueue an envelope: into the ready table if due now, else into the
    /// scheduled table. Idempotent on id: re-sending the same envelope
    /// never creates a second entry.
    #[instrument(skip(self, envelope), fields(queue = %self.name, id = %envelope.id))]
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        let now = Utc::now();
        if envelope.is_due(now) {
            self.insert(&self.ready_table(), envelope, envelope.scheduled_time.unwrap_or(now))
                .await
        } else {
            // scheduled_time is in the future here by is_due
            let due = envelope.scheduled_time.unwrap_or(now);
            self.insert(&self.scheduled_table(), envelope, due).await
        }
    }

    async fn insert(
        &self,
        table: &str,
        envelope: &Envelope,
        execution_time: DateTime<Utc>,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {table} ({QUEUE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
             ON CONFLICT (id) DO UPDATE SET execution_time = EXCLUDED.execution_time"
        );
        sqlx::query(&sql)
            .bind(envelope.id)
            .bind(&envelope.body)
            .bind(&envelope.message_type)
            .bind(&envelope.content_type)
            .bind(&envelope.destination)
            .bind(&envelope.reply_uri)
            .bind(&envelope.correlation_id)
            .bind(envelope.conversation_id)
            .bind(envelope.parent_id)
            .bind(&envelope.source)
            .bind(envelope.attempts)
            .bind(execution_time)
            .bind(envelope.deliver_by)
            .bind(envelope.sent_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Move every scheduled row whose due-time has passed into the ready
    /// table. A single statement deletes and re-inserts, so no row is ever
    /// in both tables and a crash mid-move loses nothing; the id-keyed
    /// conflict clause makes re-runs safe.
    #[instrument(skip(self), fields(queue = %self.name))]
    pub async fn promote_scheduled(&self, now: DateTime<Utc>) -> Result<u64> {
        let sql = format!(
            "WITH moved AS ( \
                 DELETE FROM {scheduled} WHERE execution_time <= $1 RETURNING {QUEUE_COLUMNS} \
             ) \
             INSERT INTO {ready} ({QUEUE_COLUMNS}) \
             SELECT {QUEUE_COLUMNS} FROM moved \
             ON CONFLICT (id) DO NOTHING",
            scheduled = self.scheduled_table(),
            ready = self.ready_table(),
        );
        let promoted = sqlx::query(&sql)
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if promoted > 0 {
            debug!(promoted, "promoted scheduled queue rows");
        }
        Ok(promoted)
    }

    /// Attempt to lease one ready message. Opens a transaction, claims the
    /// oldest unlocked row with SKIP LOCKED while incrementing its attempt
    /// counter in the same statement, and keeps the transaction open inside
    /// the returned [`QueueLease`]. Rows past their `keep_until` deadline
    /// are discarded, not delivered.
    pub async fn try_lease(&self) -> Result<Option<QueueLease>> {
        let lease_sql = format!(
            "UPDATE {ready} SET attempts = attempts + 1 \
             WHERE id = ( \
                 SELECT id FROM {ready} \
                 ORDER BY execution_time \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING id, body, message_type, content_type, destination, reply_uri, \
                       correlation_id, conversation_id, parent_id, source, \
                       'incoming' AS status, 0 AS owner_id, attempts, \
                       execution_time, keep_until, sent_at",
            ready = self.ready_table(),
        );
        let delete_sql = format!("DELETE FROM {} WHERE id = $1", self.ready_table());

        loop {
            let mut tx = self.pool.begin().await?;
            let row = sqlx::query_as::<_, EnvelopeRow>(&lease_sql)
                .fetch_optional(&mut *tx)
                .await?;
            let Some(row) = row else {
                tx.rollback().await?;
                return Ok(None);
            };
            let envelope = Envelope::try_from(row)?;

            if envelope.is_expired(Utc::now()) {
                sqlx::query(&delete_sql)
                    .bind(envelope.id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                debug!(id = %envelope.id, "discarded expired queue message");
                continue;
            }

            return Ok(Some(QueueLease {
                tx,
                envelope,
                delete_sql,
            }));
        }
    }
}

/// A held database transaction representing exclusive, time-bounded claim
/// on one queued message. Dropping the lease without completing rolls the
/// transaction back, releasing the row (attempts increment included) for
/// the next SKIP LOCKED scan.
pub struct QueueLease {
    tx: Transaction<'static, Postgres>,
    envelope: Envelope,
    delete_sql: String,
}

impl QueueLease {
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// The message was handled: delete its row and commit.
    pub async fn complete(mut self) -> Result<()> {
        sqlx::query(&self.delete_sql)
            .bind(self.envelope.id)
            .execute(&mut *self.tx)
            .await?;
        self.tx.commit().await?;
        Ok(())
    }

    /// The message needs a retry: commit without deleting, leaving the row
    /// (with its incremented attempt count) visible to the next scan.
    pub async fn defer(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
