//! # Durability Duties
//!
//! The individual responsibilities the durability agent schedules:
//! scheduled-message promotion, ownership reassignment off dead nodes,
//! dead-letter replay, record expiration, and queue-table promotion.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::DurabilityConfig;
use crate::durability::loops::DurabilityDuty;
use crate::error::Result;
use crate::nodes::live_node_numbers;
use crate::queue::PostgresQueue;
use crate::storage::MessageStore;

/// Move Scheduled envelopes whose time has come into Incoming.
pub struct ScheduledPromotion {
    pub(crate) store: Arc<dyn MessageStore>,
    pub(crate) batch_size: i64,
}

#[async_trait]
impl DurabilityDuty for ScheduledPromotion {
    fn name(&self) -> &'static str {
        "scheduled_promotion"
    }

    async fn tick(&self) -> Result<u64> {
        self.store
            .promote_scheduled(Utc::now(), self.batch_size)
            .await
    }
}

/// Detect nodes with expired heartbeats and take over their envelopes.
/// The store-side UPDATE is keyed on "owner is not live", so work owned by
/// a live peer is never stolen.
pub struct OwnershipReassignment {
    pub(crate) store: Arc<dyn MessageStore>,
    pub(crate) config: DurabilityConfig,
    pub(crate) self_number: i32,
}

#[async_trait]
impl DurabilityDuty for OwnershipReassignment {
    fn name(&self) -> &'static str {
        "ownership_reassignment"
    }

    async fn tick(&self) -> Result<u64> {
        let nodes = self.store.load_all_nodes().await?;
        let live = live_node_numbers(
            &nodes,
            self.config.node_staleness(),
            Utc::now(),
            self.self_number,
        );
        self.store
            .reassign_from_dead_nodes(&live, self.self_number)
            .await
    }
}

/// Move dead letters flagged replayable back into Incoming.
pub struct DeadLetterReplay {
    pub(crate) store: Arc<dyn MessageStore>,
}

#[async_trait]
impl DurabilityDuty for DeadLetterReplay {
    fn name(&self) -> &'static str {
        "dead_letter_replay"
    }

    async fn tick(&self) -> Result<u64> {
        self.store.replay_dead_letters().await
    }
}

/// Garbage-collect handled envelopes past retention, expired dead letters,
/// and long-stale node records.
pub struct RecordExpiration {
    pub(crate) store: Arc<dyn MessageStore>,
    pub(crate) config: DurabilityConfig,
}

#[async_trait]
impl DurabilityDuty for RecordExpiration {
    fn name(&self) -> &'static str {
        "record_expiration"
    }

    async fn tick(&self) -> Result<u64> {
        self.store
            .delete_expired(
                Utc::now(),
                self.config.handled_retention(),
                self.config.node_record_retention(),
            )
            .await
    }
}

/// Scheduled-to-ready promotion for one relational queue transport.
pub struct QueuePromotion {
    pub(crate) queue: Arc<PostgresQueue>,
}

#[async_trait]
impl DurabilityDuty for QueuePromotion {
    fn name(&self) -> &'static str {
        "queue_promotion"
    }

    async fn tick(&self) -> Result<u64> {
        self.queue.promote_scheduled(Utc::now()).await
    }
}
