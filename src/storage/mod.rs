//! # Message Store Contracts
//!
//! The persistence façade for durable messaging. Four sub-contracts
//! ([`Inbox`], [`Outbox`], [`DeadLetters`], [`NodeStore`]) plus admin
//! operations on the [`MessageStore`] supertrait. One implementation per
//! backend; [`postgres::PostgresMessageStore`] is the production store and
//! [`memory::InMemoryMessageStore`] backs tests and embedded use.
//!
//! All mutating operations are atomic: either a single statement or a
//! store-owned transaction. The Postgres store additionally exposes
//! `*_tx` inherent methods so application code can enlist envelope writes
//! in its own transaction alongside business data.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::envelope::{DeadLetterReport, Envelope, PersistedCounts};
use crate::error::Result;
use crate::nodes::NodeRecord;

/// Incoming-side persistence: a message is durably recorded before or
/// alongside being handled.
#[async_trait]
pub trait Inbox: Send + Sync {
    /// Persist an incoming envelope. A duplicate id fails with
    /// [`CourierError::DuplicateEnvelope`](crate::error::CourierError) and
    /// leaves exactly one row; this is the idempotency guarantee the inbox
    /// pattern depends on.
    async fn store_incoming(&self, envelope: &Envelope) -> Result<()>;

    async fn store_incoming_batch(&self, envelopes: &[Envelope]) -> Result<()>;

    async fn mark_handled(&self, id: Uuid) -> Result<()>;

    async fn mark_handled_batch(&self, ids: &[Uuid]) -> Result<()>;

    /// Increment the delivery attempt counter, returning the new count.
    async fn increment_attempts(&self, id: Uuid) -> Result<i32>;

    /// Move envelopes to Scheduled with the given execution times.
    async fn schedule_execution(&self, schedules: &[(Uuid, DateTime<Utc>)]) -> Result<u64>;

    /// Claim and load incoming envelopes owned by `owner_id` or unclaimed,
    /// setting their owner in the same statement. Used by startup recovery.
    async fn claim_owned_incoming(&self, owner_id: i32) -> Result<Vec<Envelope>>;

    /// Move Scheduled envelopes whose time has come into Incoming, one
    /// transaction per batch. Returns the number promoted.
    async fn promote_scheduled(&self, now: DateTime<Utc>, batch_size: i64) -> Result<u64>;
}

/// Outgoing-side persistence: a message is durably recorded in the same
/// transaction as the business data that produced it, then flushed to the
/// transport after commit.
#[async_trait]
pub trait Outbox: Send + Sync {
    async fn store_outgoing(&self, envelope: &Envelope, owner_id: i32) -> Result<()>;

    async fn store_outgoing_batch(&self, envelopes: &[Envelope], owner_id: i32) -> Result<()>;

    /// Delete outgoing rows after a successful send. Returns rows deleted.
    async fn delete_outgoing(&self, ids: &[Uuid]) -> Result<u64>;

    /// Claim and load outgoing envelopes owned by `owner_id` or unclaimed.
    async fn claim_owned_outgoing(&self, owner_id: i32) -> Result<Vec<Envelope>>;

    /// In one transaction: hard-delete `discard` (expired) and hand
    /// `reassign` to `new_owner_id`.
    async fn discard_and_reassign_outgoing(
        &self,
        discard: &[Uuid],
        reassign: &[Uuid],
        new_owner_id: i32,
    ) -> Result<()>;
}

/// Storage for envelopes that exhausted retry policy or were routed aside.
#[async_trait]
pub trait DeadLetters: Send + Sync {
    /// Atomically remove the envelope from Incoming and record the
    /// dead-letter snapshot.
    async fn move_to_dead_letter(&self, report: &DeadLetterReport) -> Result<()>;

    async fn move_to_dead_letter_batch(&self, reports: &[DeadLetterReport]) -> Result<()>;

    /// Flag every dead letter with the given exception type for replay.
    /// Returns rows flagged.
    async fn mark_replayable_by_exception_type(&self, exception_type: &str) -> Result<u64>;

    /// Flag specific dead letters for replay. Returns rows flagged.
    async fn mark_replayable(&self, ids: &[Uuid]) -> Result<u64>;

    async fn load_dead_letter(&self, id: Uuid) -> Result<Option<DeadLetterReport>>;

    /// Move every replayable dead letter back into Incoming, atomically, so
    /// replay cannot duplicate-deliver. Returns rows replayed.
    async fn replay_dead_letters(&self) -> Result<u64>;
}

/// Node registry operations backing cross-node ownership decisions.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Register a node record, assigning and returning its compact
    /// `node_number`.
    async fn register_node(&self, record: &NodeRecord) -> Result<i32>;

    async fn heartbeat(&self, node_id: Uuid) -> Result<()>;

    async fn remove_node(&self, node_id: Uuid) -> Result<()>;

    async fn load_all_nodes(&self) -> Result<Vec<NodeRecord>>;

    /// Reassign envelopes owned by nodes outside `live_nodes` to
    /// `new_owner_id`, as a single atomic UPDATE keyed on "owner is dead",
    /// never a read-then-write. Rows owned by live peers and unclaimed rows
    /// are untouched. Returns rows reassigned across incoming and outgoing.
    async fn reassign_from_dead_nodes(&self, live_nodes: &[i32], new_owner_id: i32)
        -> Result<u64>;
}

/// The full persistence façade.
#[async_trait]
pub trait MessageStore: Inbox + Outbox + DeadLetters + NodeStore {
    /// Point-in-time counts per lifecycle state, read in a single snapshot
    /// so the parts always sum to the whole.
    async fn fetch_counts(&self) -> Result<PersistedCounts>;

    /// Hard-delete expired records: Handled envelopes past the retention
    /// window, dead letters past `expires`, and node records whose last
    /// heartbeat is older than `node_record_retention`. Returns rows
    /// deleted.
    async fn delete_expired(
        &self,
        now: DateTime<Utc>,
        handled_retention: chrono::Duration,
        node_record_retention: chrono::Duration,
    ) -> Result<u64>;

    /// Purge all rows from every courier table.
    async fn clear_all(&self) -> Result<()>;

    /// Idempotent create-if-missing of the schema and all tables.
    async fn ensure_schema(&self) -> Result<()>;

    /// Drop all courier tables and the schema.
    async fn teardown_schema(&self) -> Result<()>;

    /// Verify the persisted schema matches what this build expects; drift
    /// fails with [`CourierError::SchemaDrift`](crate::error::CourierError).
    async fn check_schema(&self) -> Result<()>;

    /// Human-readable identifier for diagnostics (connection target plus
    /// schema), never including credentials.
    fn uri(&self) -> String;
}
