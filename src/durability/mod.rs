//! # Durability Agent
//!
//! The per-node background coordinator. On start it recovers work that was
//! persisted but never dispatched before a prior crash, then runs each of
//! its duties (scheduled promotion, ownership reassignment, dead-letter
//! replay, expiration, and queue promotion) as an independent cancellable
//! polling loop. Stopping the agent cancels every loop as a unit and
//! removes this node's registry record so peers can reassign immediately.

pub mod duties;
pub mod loops;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::DurabilityConfig;
use crate::envelope::Envelope;
use crate::error::Result;
use crate::queue::PostgresQueue;
use crate::storage::MessageStore;

pub use duties::{
    DeadLetterReplay, OwnershipReassignment, QueuePromotion, RecordExpiration, ScheduledPromotion,
};
pub use loops::{backoff_delay, spawn_duty_loop, DurabilityDuty, LoopControl};

/// Where recovered envelopes go: the handler-invocation pipeline for
/// incoming work, the sending agent for outgoing work. Both are external
/// collaborators of the durability layer.
#[async_trait]
pub trait RecoveredMessageSink: Send + Sync {
    async fn deliver_incoming(&self, envelope: Envelope) -> Result<()>;

    async fn send_outgoing(&self, envelope: Envelope) -> Result<()>;
}

/// Per-node background coordinator over one message store.
pub struct DurabilityAgent {
    store: Arc<dyn MessageStore>,
    sink: Arc<dyn RecoveredMessageSink>,
    config: DurabilityConfig,
    node_number: i32,
    queues: Vec<Arc<PostgresQueue>>,
    control: LoopControl,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl DurabilityAgent {
    pub fn new(
        store: Arc<dyn MessageStore>,
        sink: Arc<dyn RecoveredMessageSink>,
        config: DurabilityConfig,
        node_number: i32,
    ) -> Self {
        Self {
            store,
            sink,
            config,
            node_number,
            queues: Vec::new(),
            control: LoopControl::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Register a queue transport whose scheduled table this agent should
    /// promote alongside its other duties.
    pub fn add_queue(&mut self, queue: Arc<PostgresQueue>) {
        self.queues.push(queue);
    }

    pub fn control(&self) -> LoopControl {
        self.control.clone()
    }

    /// Recover persisted work, then spawn all duty loops.
    pub async fn start(&self) -> Result<()> {
        self.recover_persisted_work().await?;

        let mut handles = self.handles.lock();
        handles.push(spawn_duty_loop(
            Arc::new(ScheduledPromotion {
                store: Arc::clone(&self.store),
                batch_size: self.config.promotion_batch_size,
            }),
            self.config.promotion_interval(),
            self.config.first_poll_delay(),
            self.control.clone(),
        ));
        handles.push(spawn_duty_loop(
            Arc::new(OwnershipReassignment {
                store: Arc::clone(&self.store),
                config: self.config.clone(),
                self_number: self.node_number,
            }),
            self.config.reassignment_interval(),
            self.config.first_poll_delay(),
            self.control.clone(),
        ));
        handles.push(spawn_duty_loop(
            Arc::new(DeadLetterReplay {
                store: Arc::clone(&self.store),
            }),
            self.config.replay_interval(),
            self.config.first_poll_delay(),
            self.control.clone(),
        ));
        handles.push(spawn_duty_loop(
            Arc::new(RecordExpiration {
                store: Arc::clone(&self.store),
                config: self.config.clone(),
            }),
            self.config.expiration_interval(),
            self.config.first_poll_delay(),
            self.control.clone(),
        ));
        for queue in &self.queues {
            handles.push(spawn_duty_loop(
                Arc::new(QueuePromotion {
                    queue: Arc::clone(queue),
                }),
                self.config.promotion_interval(),
                self.config.first_poll_delay(),
                self.control.clone(),
            ));
        }

        info!(
            node_number = self.node_number,
            loops = handles.len(),
            "durability agent started"
        );
        Ok(())
    }

    /// Startup recovery: claim envelopes owned by this node or unclaimed
    /// and hand them straight to the pipeline/sender. Expired outgoing
    /// envelopes are discarded rather than sent.
    async fn recover_persisted_work(&self) -> Result<()> {
        let incoming = self.store.claim_owned_incoming(self.node_number).await?;
        let incoming_count = incoming.len();
        for envelope in incoming {
            if let Err(e) = self.sink.deliver_incoming(envelope).await {
                warn!(error = %e, "recovered incoming envelope rejected by pipeline");
            }
        }

        let outgoing = self.store.claim_owned_outgoing(self.node_number).await?;
        let now = Utc::now();
        let (expired, sendable): (Vec<_>, Vec<_>) =
            outgoing.into_iter().partition(|e| e.is_expired(now));
        let sendable_count = sendable.len();
        if !expired.is_empty() {
            let discard: Vec<_> = expired.iter().map(|e| e.id).collect();
            self.store
                .discard_and_reassign_outgoing(&discard, &[], self.node_number)
                .await?;
        }
        for envelope in sendable {
            let id = envelope.id;
            if let Err(e) = self.sink.send_outgoing(envelope).await {
                warn!(id = %id, error = %e, "recovered outgoing envelope could not be sent");
            } else {
                self.store.delete_outgoing(&[id]).await?;
            }
        }

        if incoming_count > 0 || sendable_count > 0 {
            info!(
                incoming = incoming_count,
                outgoing = sendable_count,
                "recovered persisted work from previous run"
            );
        }
        Ok(())
    }

    /// Cancel all loops and wait for them to wind down.
    pub async fn stop(&self) {
        self.control.stop();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
        info!(node_number = self.node_number, "durability agent stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{DeadLetterReport, EnvelopeStatus};
    use crate::storage::memory::InMemoryMessageStore;
    use crate::storage::{DeadLetters, Inbox, Outbox};
    use parking_lot::Mutex as PlMutex;

    #[derive(Default)]
    struct CollectingSink {
        incoming: PlMutex<Vec<Envelope>>,
        outgoing: PlMutex<Vec<Envelope>>,
    }

    #[async_trait]
    impl RecoveredMessageSink for CollectingSink {
        async fn deliver_incoming(&self, envelope: Envelope) -> Result<()> {
            self.incoming.lock().push(envelope);
            Ok(())
        }

        async fn send_outgoing(&self, envelope: Envelope) -> Result<()> {
            self.outgoing.lock().push(envelope);
            Ok(())
        }
    }

    fn fast_config() -> DurabilityConfig {
        DurabilityConfig {
            promotion_interval_ms: 10,
            reassignment_interval_ms: 10,
            replay_interval_ms: 10,
            expiration_interval_ms: 10,
            first_poll_delay_ms: 0,
            ..DurabilityConfig::default()
        }
    }

    #[tokio::test]
    async fn startup_recovery_hands_persisted_work_to_sink() {
        let store = Arc::new(InMemoryMessageStore::new());
        let sink = Arc::new(CollectingSink::default());

        store
            .store_incoming(&Envelope::new("orders.placed", vec![]))
            .await
            .unwrap();
        store
            .store_outgoing(&Envelope::new("orders.confirm", vec![]), 0)
            .await
            .unwrap();
        let expired = Envelope::new("orders.stale", vec![])
            .with_deliver_by(Utc::now() - chrono::Duration::minutes(5));
        store.store_outgoing(&expired, 0).await.unwrap();

        let agent = DurabilityAgent::new(store.clone(), sink.clone(), fast_config(), 1);
        agent.recover_persisted_work().await.unwrap();

        assert_eq!(sink.incoming.lock().len(), 1);
        assert_eq!(sink.outgoing.lock().len(), 1);
        // sent and expired outgoing rows are both gone
        let counts = store.fetch_counts().await.unwrap();
        assert_eq!(counts.outgoing, 0);
    }

    #[tokio::test]
    async fn agent_loops_promote_and_replay() {
        let store = Arc::new(InMemoryMessageStore::new());
        let sink = Arc::new(CollectingSink::default());

        let due = Envelope::new("due", vec![])
            .scheduled_for(Utc::now() - chrono::Duration::seconds(1));
        store.store_incoming(&due).await.unwrap();

        let dead = Envelope::new("dead", vec![]);
        store.store_incoming(&dead).await.unwrap();
        store
            .move_to_dead_letter(&DeadLetterReport::new(dead.clone(), "Boom"))
            .await
            .unwrap();
        store
            .mark_replayable_by_exception_type("Boom")
            .await
            .unwrap();

        let agent = DurabilityAgent::new(store.clone(), sink, fast_config(), 1);
        agent.start().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        agent.stop().await;

        let counts = store.fetch_counts().await.unwrap();
        assert_eq!(counts.scheduled, 0);
        assert_eq!(counts.dead_letter, 0);
        // the scheduled envelope was promoted, the dead letter replayed, and
        // recovery had already claimed the original incoming one
        assert!(counts.incoming >= 1);
    }

    #[tokio::test]
    async fn dead_letter_scenario_matches_operational_runbook() {
        // 10 incoming, 3 dead-lettered, one exception type marked
        // replayable, then a replay sweep.
        let store = Arc::new(InMemoryMessageStore::new());
        let mut envelopes = Vec::new();
        for i in 0..10 {
            let envelope = Envelope::new(format!("msg.{i}"), vec![]);
            store.store_incoming(&envelope).await.unwrap();
            envelopes.push(envelope);
        }
        for (envelope, exception) in envelopes.iter().take(3).zip(["A", "B", "C"]) {
            store
                .move_to_dead_letter(&DeadLetterReport::new(envelope.clone(), exception))
                .await
                .unwrap();
        }

        let counts = store.fetch_counts().await.unwrap();
        assert_eq!(counts.incoming, 7);
        assert_eq!(counts.dead_letter, 3);

        assert_eq!(store.mark_replayable_by_exception_type("B").await.unwrap(), 1);
        assert_eq!(store.replay_dead_letters().await.unwrap(), 1);

        let counts = store.fetch_counts().await.unwrap();
        assert_eq!(counts.incoming, 8);
        assert_eq!(counts.dead_letter, 2);

        let replayed = &envelopes[1];
        assert!(store.load_dead_letter(replayed.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recovered_incoming_is_claimed_by_this_node() {
        let store = Arc::new(InMemoryMessageStore::new());
        let sink = Arc::new(CollectingSink::default());
        store
            .store_incoming(&Envelope::new("unclaimed", vec![]))
            .await
            .unwrap();

        let agent = DurabilityAgent::new(store.clone(), sink.clone(), fast_config(), 42);
        agent.recover_persisted_work().await.unwrap();

        let recovered = sink.incoming.lock();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].owner_id, 42);
        assert_eq!(recovered[0].status, EnvelopeStatus::Incoming);
    }
}
