//! # Postgres Message Store
//!
//! Production implementation of the [`MessageStore`] façade over sqlx.
//! Every cross-node mutation is a single atomic statement (or one
//! store-owned transaction) keyed on ownership, so concurrent nodes
//! coordinate purely through row-level semantics; there is no separate
//! lock service. Zero rows affected on an owned-row mutation means
//! "someone else already has it" and is not an error.

pub mod schema;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::envelope::{DeadLetterReport, Envelope, EnvelopeStatus, PersistedCounts, ANY_NODE};
use crate::error::{map_insert_error, CourierError, Result};
use crate::nodes::NodeRecord;
use crate::storage::{DeadLetters, Inbox, MessageStore, NodeStore, Outbox};

use schema::{DEAD_LETTER_TABLE, INCOMING_TABLE, NODE_TABLE, OUTGOING_TABLE};

const ENVELOPE_COLUMNS: &str = "id, body, message_type, content_type, destination, reply_uri, \
     correlation_id, conversation_id, parent_id, source, status, owner_id, attempts, \
     execution_time, keep_until, sent_at";

/// Row shape shared by the incoming and outgoing tables. Outgoing selects
/// synthesize `status` and `execution_time` since those are implicit there.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EnvelopeRow {
    id: Uuid,
    body: Vec<u8>,
    message_type: String,
    content_type: String,
    destination: Option<String>,
    reply_uri: Option<String>,
    correlation_id: Option<String>,
    conversation_id: Option<Uuid>,
    parent_id: Option<Uuid>,
    source: Option<String>,
    status: String,
    owner_id: i32,
    attempts: i32,
    execution_time: Option<DateTime<Utc>>,
    keep_until: Option<DateTime<Utc>>,
    sent_at: DateTime<Utc>,
}

impl TryFrom<EnvelopeRow> for Envelope {
    type Error = CourierError;

    fn try_from(row: EnvelopeRow) -> Result<Envelope> {
        Ok(Envelope {
            id: row.id,
            body: row.body,
            message_type: row.message_type,
            content_type: row.content_type,
            destination: row.destination,
            reply_uri: row.reply_uri,
            correlation_id: row.correlation_id,
            conversation_id: row.conversation_id,
            parent_id: row.parent_id,
            source: row.source,
            status: EnvelopeStatus::parse(&row.status)?,
            owner_id: row.owner_id,
            attempts: row.attempts,
            scheduled_time: row.execution_time,
            deliver_by: row.keep_until,
            sent_at: row.sent_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DeadLetterRow {
    id: Uuid,
    body: Vec<u8>,
    message_type: String,
    content_type: String,
    destination: Option<String>,
    reply_uri: Option<String>,
    correlation_id: Option<String>,
    conversation_id: Option<Uuid>,
    parent_id: Option<Uuid>,
    source: Option<String>,
    attempts: i32,
    sent_at: DateTime<Utc>,
    exception_type: String,
    exception_message: String,
    exception_text: String,
    explanation: String,
    replayable: bool,
    expires: Option<DateTime<Utc>>,
}

impl From<DeadLetterRow> for DeadLetterReport {
    fn from(row: DeadLetterRow) -> Self {
        DeadLetterReport {
            envelope: Envelope {
                id: row.id,
                body: row.body,
                message_type: row.message_type,
                content_type: row.content_type,
                destination: row.destination,
                reply_uri: row.reply_uri,
                correlation_id: row.correlation_id,
                conversation_id: row.conversation_id,
                parent_id: row.parent_id,
                source: row.source,
                status: EnvelopeStatus::DeadLetter,
                owner_id: ANY_NODE,
                attempts: row.attempts,
                scheduled_time: None,
                deliver_by: None,
                sent_at: row.sent_at,
            },
            exception_type: row.exception_type,
            exception_message: row.exception_message,
            exception_text: row.exception_text,
            explanation: row.explanation,
            replayable: row.replayable,
            expires: row.expires,
        }
    }
}

/// Postgres-backed message store scoped to one schema.
#[derive(Debug, Clone)]
pub struct PostgresMessageStore {
    pool: PgPool,
    schema: String,
}

impl PostgresMessageStore {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    /// Connect per the database config, provisioning or verifying the
    /// schema depending on `auto_provision`.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let url = config.resolved_url()?;
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .connect(&url)
            .await?;
        let store = Self::new(pool, config.schema.clone());
        if config.auto_provision {
            store.ensure_schema().await?;
        } else {
            store.check_schema().await?;
        }
        info!(store = %store.uri(), "connected postgres message store");
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    fn table(&self, name: &str) -> String {
        format!("{}.{}", self.schema, name)
    }

    /// Persist an incoming envelope inside a caller-owned transaction, so
    /// envelope state commits atomically with application side effects.
    pub async fn store_incoming_tx(
        &self,
        conn: &mut PgConnection,
        envelope: &Envelope,
    ) -> Result<()> {
        // A Scheduled row with no execution time would never promote, so it
        // is normalized to Incoming here.
        let status = match envelope.status {
            EnvelopeStatus::Scheduled if envelope.scheduled_time.is_some() => {
                EnvelopeStatus::Scheduled
            }
            _ => EnvelopeStatus::Incoming,
        };
        let sql = format!(
            "INSERT INTO {} ({ENVELOPE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
            self.table(INCOMING_TABLE)
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
            .bind(status.as_str())
            .bind(envelope.owner_id)
            .bind(envelope.attempts)
            .bind(envelope.scheduled_time)
            .bind(envelope.deliver_by)
            .bind(envelope.sent_at)
            .execute(conn)
            .await
            .map_err(|e| map_insert_error(envelope.id, e))?;
        Ok(())
    }

    /// Persist an outgoing envelope inside a caller-owned transaction.
    /// Idempotent on id: re-persisting replaces in place rather than
    /// duplicating.
    pub async fn store_outgoing_tx(
        &self,
        conn: &mut PgConnection,
        envelope: &Envelope,
        owner_id: i32,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (id, body, message_type, content_type, destination, reply_uri, \
             correlation_id, conversation_id, parent_id, source, owner_id, attempts, \
             deliver_by, sent_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
             ON CONFLICT (id) DO UPDATE SET owner_id = EXCLUDED.owner_id",
            self.table(OUTGOING_TABLE)
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
            .bind(owner_id)
            .bind(envelope.attempts)
            .bind(envelope.deliver_by)
            .bind(envelope.sent_at)
            .execute(conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Inbox for PostgresMessageStore {
    #[instrument(skip(self, envelope), fields(id = %envelope.id))]
    async fn store_incoming(&self, envelope: &Envelope) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        self.store_incoming_tx(&mut conn, envelope).await
    }

    async fn store_incoming_batch(&self, envelopes: &[Envelope]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for envelope in envelopes {
            self.store_incoming_tx(&mut tx, envelope).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn mark_handled(&self, id: Uuid) -> Result<()> {
        self.mark_handled_batch(&[id]).await
    }

    async fn mark_handled_batch(&self, ids: &[Uuid]) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET status = 'handled', owner_id = {ANY_NODE}, received_at = now() \
             WHERE id = ANY($1)",
            self.table(INCOMING_TABLE)
        );
        sqlx::query(&sql).bind(ids).execute(&self.pool).await?;
        Ok(())
    }

    async fn increment_attempts(&self, id: Uuid) -> Result<i32> {
        let sql = format!(
            "UPDATE {} SET attempts = attempts + 1 WHERE id = $1 RETURNING attempts",
            self.table(INCOMING_TABLE)
        );
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => Ok(row.get::<i32, _>("attempts")),
            None => Err(CourierError::invalid_state(format!(
                "no incoming envelope {id} to increment"
            ))),
        }
    }

    async fn schedule_execution(&self, schedules: &[(Uuid, DateTime<Utc>)]) -> Result<u64> {
        let sql = format!(
            "UPDATE {} SET status = 'scheduled', execution_time = $2, owner_id = {ANY_NODE} \
             WHERE id = $1",
            self.table(INCOMING_TABLE)
        );
        let mut tx = self.pool.begin().await?;
        let mut affected = 0;
        for (id, time) in schedules {
            affected += sqlx::query(&sql)
                .bind(id)
                .bind(time)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(affected)
    }

    async fn claim_owned_incoming(&self, owner_id: i32) -> Result<Vec<Envelope>> {
        let sql = format!(
            "UPDATE {} SET owner_id = $1 \
             WHERE status = 'incoming' AND owner_id IN ($1, {ANY_NODE}) \
             RETURNING {ENVELOPE_COLUMNS}",
            self.table(INCOMING_TABLE)
        );
        let rows = sqlx::query_as::<_, EnvelopeRow>(&sql)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Envelope::try_from).collect()
    }

    #[instrument(skip(self))]
    async fn promote_scheduled(&self, now: DateTime<Utc>, batch_size: i64) -> Result<u64> {
        // SKIP LOCKED keeps concurrent promoters from stalling each other;
        // either way the row only promotes once.
        let sql = format!(
            "UPDATE {table} SET status = 'incoming', owner_id = {ANY_NODE} \
             WHERE id IN ( \
                 SELECT id FROM {table} \
                 WHERE status = 'scheduled' AND execution_time <= $1 \
                 ORDER BY execution_time \
                 LIMIT $2 \
                 FOR UPDATE SKIP LOCKED \
             )",
            table = self.table(INCOMING_TABLE)
        );
        let affected = sqlx::query(&sql)
            .bind(now)
            .bind(batch_size)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected > 0 {
            debug!(promoted = affected, "promoted scheduled envelopes");
        }
        Ok(affected)
    }
}

#[async_trait]
impl Outbox for PostgresMessageStore {
    #[instrument(skip(self, envelope), fields(id = %envelope.id))]
    async fn store_outgoing(&self, envelope: &Envelope, owner_id: i32) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        self.store_outgoing_tx(&mut conn, envelope, owner_id).await
    }

    async fn store_outgoing_batch(&self, envelopes: &[Envelope], owner_id: i32) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for envelope in envelopes {
            self.store_outgoing_tx(&mut tx, envelope, owner_id).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_outgoing(&self, ids: &[Uuid]) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE id = ANY($1)",
            self.table(OUTGOING_TABLE)
        );
        Ok(sqlx::query(&sql)
            .bind(ids)
            .execute(&self.pool)
            .await?
            .rows_affected())
    }

    async fn claim_owned_outgoing(&self, owner_id: i32) -> Result<Vec<Envelope>> {
        let sql = format!(
            "UPDATE {} SET owner_id = $1 \
             WHERE owner_id IN ($1, {ANY_NODE}) \
             RETURNING id, body, message_type, content_type, destination, reply_uri, \
             correlation_id, conversation_id, parent_id, source, 'outgoing' AS status, \
             owner_id, attempts, NULL::timestamptz AS execution_time, \
             deliver_by AS keep_until, sent_at",
            self.table(OUTGOING_TABLE)
        );
        let rows = sqlx::query_as::<_, EnvelopeRow>(&sql)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Envelope::try_from).collect()
    }

    async fn discard_and_reassign_outgoing(
        &self,
        discard: &[Uuid],
        reassign: &[Uuid],
        new_owner_id: i32,
    ) -> Result<()> {
        let delete_sql = format!(
            "DELETE FROM {} WHERE id = ANY($1)",
            self.table(OUTGOING_TABLE)
        );
        let reassign_sql = format!(
            "UPDATE {} SET owner_id = $1 WHERE id = ANY($2)",
            self.table(OUTGOING_TABLE)
        );
        let mut tx = self.pool.begin().await?;
        sqlx::query(&delete_sql)
            .bind(discard)
            .execute(&mut *tx)
            .await?;
        sqlx::query(&reassign_sql)
            .bind(new_owner_id)
            .bind(reassign)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl DeadLetters for PostgresMessageStore {
    async fn move_to_dead_letter(&self, report: &DeadLetterReport) -> Result<()> {
        self.move_to_dead_letter_batch(std::slice::from_ref(report))
            .await
    }

    async fn move_to_dead_letter_batch(&self, reports: &[DeadLetterReport]) -> Result<()> {
        let delete_sql = format!(
            "DELETE FROM {} WHERE id = $1",
            self.table(INCOMING_TABLE)
        );
        let insert_sql = format!(
            "INSERT INTO {} (id, body, message_type, content_type, destination, reply_uri, \
             correlation_id, conversation_id, parent_id, source, attempts, sent_at, \
             exception_type, exception_message, exception_text, explanation, replayable, expires) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18) \
             ON CONFLICT (id) DO UPDATE SET \
                 attempts = EXCLUDED.attempts, \
                 exception_type = EXCLUDED.exception_type, \
                 exception_message = EXCLUDED.exception_message, \
                 exception_text = EXCLUDED.exception_text, \
                 explanation = EXCLUDED.explanation",
            self.table(DEAD_LETTER_TABLE)
        );
        let mut tx = self.pool.begin().await?;
        for report in reports {
            let envelope = &report.envelope;
            sqlx::query(&delete_sql)
                .bind(envelope.id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(&insert_sql)
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
                .bind(envelope.sent_at)
                .bind(&report.exception_type)
                .bind(&report.exception_message)
                .bind(&report.exception_text)
                .bind(&report.explanation)
                .bind(report.replayable)
                .bind(report.expires)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn mark_replayable_by_exception_type(&self, exception_type: &str) -> Result<u64> {
        let sql = format!(
            "UPDATE {} SET replayable = true WHERE exception_type = $1",
            self.table(DEAD_LETTER_TABLE)
        );
        Ok(sqlx::query(&sql)
            .bind(exception_type)
            .execute(&self.pool)
            .await?
            .rows_affected())
    }

    async fn mark_replayable(&self, ids: &[Uuid]) -> Result<u64> {
        let sql = format!(
            "UPDATE {} SET replayable = true WHERE id = ANY($1)",
            self.table(DEAD_LETTER_TABLE)
        );
        Ok(sqlx::query(&sql)
            .bind(ids)
            .execute(&self.pool)
            .await?
            .rows_affected())
    }

    async fn load_dead_letter(&self, id: Uuid) -> Result<Option<DeadLetterReport>> {
        let sql = format!(
            "SELECT id, body, message_type, content_type, destination, reply_uri, \
             correlation_id, conversation_id, parent_id, source, attempts, sent_at, \
             exception_type, exception_message, exception_text, explanation, replayable, expires \
             FROM {} WHERE id = $1",
            self.table(DEAD_LETTER_TABLE)
        );
        let row = sqlx::query_as::<_, DeadLetterRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(DeadLetterReport::from))
    }

    #[instrument(skip(self))]
    async fn replay_dead_letters(&self) -> Result<u64> {
        // Single-statement move: the CTE deletes and the insert re-creates,
        // so a crash mid-replay leaves the message in exactly one place.
        let sql = format!(
            "WITH moved AS ( \
                 DELETE FROM {dlq} WHERE replayable = true RETURNING * \
             ) \
             INSERT INTO {incoming} ({ENVELOPE_COLUMNS}) \
             SELECT id, body, message_type, content_type, destination, reply_uri, \
                    correlation_id, conversation_id, parent_id, source, 'incoming', \
                    {ANY_NODE}, attempts, NULL, NULL, sent_at \
             FROM moved \
             ON CONFLICT (id) DO NOTHING",
            dlq = self.table(DEAD_LETTER_TABLE),
            incoming = self.table(INCOMING_TABLE),
        );
        let replayed = sqlx::query(&sql).execute(&self.pool).await?.rows_affected();
        if replayed > 0 {
            info!(replayed, "replayed dead-lettered envelopes");
        }
        Ok(replayed)
    }
}

#[async_trait]
impl NodeStore for PostgresMessageStore {
    async fn register_node(&self, record: &NodeRecord) -> Result<i32> {
        let sql = format!(
            "INSERT INTO {} (node_id, node_number, control_uri, last_heartbeat) \
             VALUES ($1, nextval('{}.node_number_seq')::integer, $2, now()) \
             RETURNING node_number",
            self.table(NODE_TABLE),
            self.schema
        );
        let row = sqlx::query(&sql)
            .bind(record.node_id)
            .bind(&record.control_uri)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i32, _>("node_number"))
    }

    async fn heartbeat(&self, node_id: Uuid) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET last_heartbeat = now() WHERE node_id = $1",
            self.table(NODE_TABLE)
        );
        sqlx::query(&sql).bind(node_id).execute(&self.pool).await?;
        Ok(())
    }

    async fn remove_node(&self, node_id: Uuid) -> Result<()> {
        // Release the departing node's claims in the same transaction as the
        // registry delete, so peers never observe a dead owner with a
        // live-looking record.
        let release_incoming = format!(
            "UPDATE {} SET owner_id = {ANY_NODE} \
             WHERE owner_id = (SELECT node_number FROM {} WHERE node_id = $1)",
            self.table(INCOMING_TABLE),
            self.table(NODE_TABLE)
        );
        let release_outgoing = format!(
            "UPDATE {} SET owner_id = {ANY_NODE} \
             WHERE owner_id = (SELECT node_number FROM {} WHERE node_id = $1)",
            self.table(OUTGOING_TABLE),
            self.table(NODE_TABLE)
        );
        let delete_sql = format!(
            "DELETE FROM {} WHERE node_id = $1",
            self.table(NODE_TABLE)
        );
        let mut tx = self.pool.begin().await?;
        sqlx::query(&release_incoming)
            .bind(node_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(&release_outgoing)
            .bind(node_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(&delete_sql).bind(node_id).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn load_all_nodes(&self) -> Result<Vec<NodeRecord>> {
        let sql = format!(
            "SELECT node_id, node_number, control_uri, last_heartbeat \
             FROM {} ORDER BY node_number",
            self.table(NODE_TABLE)
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| NodeRecord {
                node_id: row.get("node_id"),
                node_number: row.get("node_number"),
                control_uri: row.get("control_uri"),
                last_heartbeat: row.get("last_heartbeat"),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn reassign_from_dead_nodes(
        &self,
        live_nodes: &[i32],
        new_owner_id: i32,
    ) -> Result<u64> {
        // One atomic UPDATE per table keyed on "owner is dead"; never a
        // read-then-write. Live peers' rows and unclaimed rows are excluded
        // by the predicate itself.
        let incoming_sql = format!(
            "UPDATE {} SET owner_id = $1 \
             WHERE owner_id <> {ANY_NODE} AND NOT (owner_id = ANY($2))",
            self.table(INCOMING_TABLE)
        );
        let outgoing_sql = format!(
            "UPDATE {} SET owner_id = $1 \
             WHERE owner_id <> {ANY_NODE} AND NOT (owner_id = ANY($2))",
            self.table(OUTGOING_TABLE)
        );
        let mut tx = self.pool.begin().await?;
        let mut affected = sqlx::query(&incoming_sql)
            .bind(new_owner_id)
            .bind(live_nodes)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        affected += sqlx::query(&outgoing_sql)
            .bind(new_owner_id)
            .bind(live_nodes)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        if affected > 0 {
            info!(reassigned = affected, new_owner_id, "reassigned orphaned envelopes");
        }
        Ok(affected)
    }
}

#[async_trait]
impl MessageStore for PostgresMessageStore {
    async fn fetch_counts(&self) -> Result<PersistedCounts> {
        // One statement, one MVCC snapshot: the per-state counts always sum
        // to the row total at a single point in time.
        let sql = format!(
            "SELECT \
                 count(*) FILTER (WHERE status = 'incoming')    AS incoming, \
                 count(*) FILTER (WHERE status = 'scheduled')   AS scheduled, \
                 count(*) FILTER (WHERE status = 'outgoing')    AS outgoing, \
                 count(*) FILTER (WHERE status = 'handled')     AS handled, \
                 count(*) FILTER (WHERE status = 'dead_letter') AS dead_letter \
             FROM ( \
                 SELECT status FROM {incoming} \
                 UNION ALL SELECT 'outgoing' FROM {outgoing} \
                 UNION ALL SELECT 'dead_letter' FROM {dlq} \
             ) snapshot",
            incoming = self.table(INCOMING_TABLE),
            outgoing = self.table(OUTGOING_TABLE),
            dlq = self.table(DEAD_LETTER_TABLE),
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(PersistedCounts {
            incoming: row.get::<i64, _>("incoming") as u64,
            scheduled: row.get::<i64, _>("scheduled") as u64,
            outgoing: row.get::<i64, _>("outgoing") as u64,
            handled: row.get::<i64, _>("handled") as u64,
            dead_letter: row.get::<i64, _>("dead_letter") as u64,
        })
    }

    #[instrument(skip(self))]
    async fn delete_expired(
        &self,
        now: DateTime<Utc>,
        handled_retention: chrono::Duration,
        node_record_retention: chrono::Duration,
    ) -> Result<u64> {
        let handled_cutoff = now - handled_retention;
        let heartbeat_cutoff = now - node_record_retention;
        let handled_sql = format!(
            "DELETE FROM {} WHERE status = 'handled' \
             AND (received_at < $1 OR (keep_until IS NOT NULL AND keep_until < $2))",
            self.table(INCOMING_TABLE)
        );
        let dlq_sql = format!(
            "DELETE FROM {} WHERE expires IS NOT NULL AND expires < $1",
            self.table(DEAD_LETTER_TABLE)
        );
        // Node records past retention are leftovers from hard crashes;
        // reassignment has long since taken their work.
        let node_sql = format!(
            "DELETE FROM {} WHERE last_heartbeat < $1",
            self.table(NODE_TABLE)
        );
        let mut tx = self.pool.begin().await?;
        let mut deleted = sqlx::query(&handled_sql)
            .bind(handled_cutoff)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        deleted += sqlx::query(&dlq_sql)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        deleted += sqlx::query(&node_sql)
            .bind(heartbeat_cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted)
    }

    async fn clear_all(&self) -> Result<()> {
        for table in [INCOMING_TABLE, OUTGOING_TABLE, DEAD_LETTER_TABLE, NODE_TABLE] {
            let sql = format!("DELETE FROM {}", self.table(table));
            sqlx::query(&sql).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<()> {
        schema::ensure_schema(&self.pool, &self.schema).await
    }

    async fn teardown_schema(&self) -> Result<()> {
        schema::teardown_schema(&self.pool, &self.schema).await
    }

    async fn check_schema(&self) -> Result<()> {
        schema::check_schema(&self.pool, &self.schema).await
    }

    fn uri(&self) -> String {
        format!("postgres://{}", self.schema)
    }
}
