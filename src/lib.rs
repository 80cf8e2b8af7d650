//! # Courier Core
//!
//! A durable messaging substrate giving application message handlers
//! effectively-once delivery semantics on top of ordinary relational
//! storage, plus the coordination layer that lets many running nodes share
//! ownership of pending work without double-processing it.
//!
//! ## Architecture
//!
//! - [`envelope`]: the message unit and its lifecycle states
//! - [`storage`]: the inbox/outbox/dead-letter/node persistence façade,
//!   with Postgres and in-memory implementations
//! - [`queue`]: a competing-consumers queue built from two tables plus a
//!   LISTEN/NOTIFY wake-up channel, with SKIP LOCKED lease dequeue
//! - [`durability`]: the per-node background coordinator: crash recovery,
//!   scheduled promotion, dead-node reassignment, replay, expiration
//! - [`nodes`]: live-node registry and heartbeat staleness detection
//! - [`tenancy`]: tenant-to-store routing (single, static, dynamic)
//!
//! Application code enlists a transaction in the message store while doing
//! its own work; envelopes commit atomically with business data, and the
//! durability agent independently sweeps storage for anything that never
//! got flushed.

pub mod config;
pub mod durability;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod nodes;
pub mod queue;
pub mod storage;
pub mod tenancy;

pub use config::CourierConfig;
pub use durability::{DurabilityAgent, RecoveredMessageSink};
pub use envelope::{DeadLetterReport, Envelope, EnvelopeStatus, PersistedCounts, ANY_NODE};
pub use error::{CourierError, ErrorKind, Result};
pub use nodes::{NodeRecord, NodeRegistry};
pub use queue::listener::{MessageDisposition, MessageReceiver, QueueListener};
pub use queue::{PostgresQueue, QueueLease};
pub use storage::memory::InMemoryMessageStore;
pub use storage::postgres::PostgresMessageStore;
pub use storage::{DeadLetters, Inbox, MessageStore, NodeStore, Outbox};
pub use tenancy::{TenantSource, TenantStoreRouter};
