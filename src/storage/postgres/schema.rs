//! # Schema Management
//!
//! Idempotent create-if-missing DDL for the courier tables, plus teardown
//! and drift detection. All tables live under a configurable schema so
//! multiple logical applications can share one database.

use sqlx::{PgPool, Row};

use crate::error::{CourierError, Result};

pub const INCOMING_TABLE: &str = "incoming_envelopes";
pub const OUTGOING_TABLE: &str = "outgoing_envelopes";
pub const DEAD_LETTER_TABLE: &str = "dead_letters";
pub const NODE_TABLE: &str = "nodes";

/// (table, expected columns) pairs used by drift detection. Column order is
/// not part of the contract; presence and completeness are.
const EXPECTED_COLUMNS: &[(&str, &[&str])] = &[
    (
        INCOMING_TABLE,
        &[
            "id",
            "body",
            "message_type",
            "content_type",
            "destination",
            "reply_uri",
            "correlation_id",
            "conversation_id",
            "parent_id",
            "source",
            "status",
            "owner_id",
            "attempts",
            "execution_time",
            "keep_until",
            "sent_at",
            "received_at",
        ],
    ),
    (
        OUTGOING_TABLE,
        &[
            "id",
            "body",
            "message_type",
            "content_type",
            "destination",
            "reply_uri",
            "correlation_id",
            "conversation_id",
            "parent_id",
            "source",
            "owner_id",
            "attempts",
            "deliver_by",
            "sent_at",
        ],
    ),
    (
        DEAD_LETTER_TABLE,
        &[
            "id",
            "body",
            "message_type",
            "content_type",
            "destination",
            "reply_uri",
            "correlation_id",
            "conversation_id",
            "parent_id",
            "source",
            "attempts",
            "sent_at",
            "exception_type",
            "exception_message",
            "exception_text",
            "explanation",
            "replayable",
            "expires",
        ],
    ),
    (
        NODE_TABLE,
        &["node_id", "node_number", "control_uri", "last_heartbeat"],
    ),
];

/// Create the schema, sequence, tables, and indexes if missing. Safe to run
/// repeatedly and concurrently from multiple nodes.
pub async fn ensure_schema(pool: &PgPool, schema: &str) -> Result<()> {
    let ddl = [
        format!("CREATE SCHEMA IF NOT EXISTS {schema}"),
        format!("CREATE SEQUENCE IF NOT EXISTS {schema}.node_number_seq"),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {schema}.{INCOMING_TABLE} (
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
                status          varchar NOT NULL,
                owner_id        integer NOT NULL DEFAULT 0,
                attempts        integer NOT NULL DEFAULT 0,
                execution_time  timestamptz,
                keep_until      timestamptz,
                sent_at         timestamptz NOT NULL DEFAULT now(),
                received_at     timestamptz NOT NULL DEFAULT now()
            )
            "#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {INCOMING_TABLE}_status_owner_idx \
             ON {schema}.{INCOMING_TABLE} (status, owner_id)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {INCOMING_TABLE}_execution_time_idx \
             ON {schema}.{INCOMING_TABLE} (execution_time) WHERE status = 'scheduled'"
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {schema}.{OUTGOING_TABLE} (
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
                owner_id        integer NOT NULL DEFAULT 0,
                attempts        integer NOT NULL DEFAULT 0,
                deliver_by      timestamptz,
                sent_at         timestamptz NOT NULL DEFAULT now()
            )
            "#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {OUTGOING_TABLE}_owner_idx \
             ON {schema}.{OUTGOING_TABLE} (owner_id)"
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {schema}.{DEAD_LETTER_TABLE} (
                id                uuid PRIMARY KEY,
                body              bytea NOT NULL,
                message_type      varchar NOT NULL,
                content_type      varchar NOT NULL DEFAULT 'application/octet-stream',
                destination       varchar,
                reply_uri         varchar,
                correlation_id    varchar,
                conversation_id   uuid,
                parent_id         uuid,
                source            varchar,
                attempts          integer NOT NULL DEFAULT 0,
                sent_at           timestamptz NOT NULL DEFAULT now(),
                exception_type    varchar NOT NULL,
                exception_message text NOT NULL DEFAULT '',
                exception_text    text NOT NULL DEFAULT '',
                explanation       text NOT NULL DEFAULT '',
                replayable        boolean NOT NULL DEFAULT false,
                expires           timestamptz
            )
            "#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {DEAD_LETTER_TABLE}_exception_type_idx \
             ON {schema}.{DEAD_LETTER_TABLE} (exception_type)"
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {schema}.{NODE_TABLE} (
                node_id        uuid PRIMARY KEY,
                node_number    integer NOT NULL,
                control_uri    varchar NOT NULL,
                last_heartbeat timestamptz NOT NULL DEFAULT now()
            )
            "#
        ),
    ];

    for statement in &ddl {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// Drop every courier table and the sequence. The schema itself is left in
/// place since other applications may share it.
pub async fn teardown_schema(pool: &PgPool, schema: &str) -> Result<()> {
    for table in [INCOMING_TABLE, OUTGOING_TABLE, DEAD_LETTER_TABLE, NODE_TABLE] {
        sqlx::query(&format!("DROP TABLE IF EXISTS {schema}.{table}"))
            .execute(pool)
            .await?;
    }
    sqlx::query(&format!("DROP SEQUENCE IF EXISTS {schema}.node_number_seq"))
        .execute(pool)
        .await?;
    Ok(())
}

/// Compare the live schema against this build's expectations. Missing
/// tables or columns fail with `SchemaDrift`; extra columns are tolerated
/// (forward-compatible reads).
pub async fn check_schema(pool: &PgPool, schema: &str) -> Result<()> {
    for (table, expected) in EXPECTED_COLUMNS {
        let rows = sqlx::query(
            "SELECT column_name FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2",
        )
        .bind(schema)
        .bind(table)
        .fetch_all(pool)
        .await?;

        if rows.is_empty() {
            return Err(CourierError::SchemaDrift {
                detail: format!("table {schema}.{table} is missing"),
            });
        }

        let present: Vec<String> = rows
            .iter()
            .map(|row| row.get::<String, _>("column_name"))
            .collect();
        let missing: Vec<&str> = expected
            .iter()
            .filter(|column| !present.iter().any(|p| p == *column))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(CourierError::SchemaDrift {
                detail: format!(
                    "table {schema}.{table} is missing columns: {}",
                    missing.join(", ")
                ),
            });
        }
    }
    Ok(())
}
