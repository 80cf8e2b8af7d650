//! End-to-end durability agent behavior over the in-memory store, so these
//! run everywhere without a database.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use courier_core::config::DurabilityConfig;
use courier_core::storage::{Inbox, MessageStore, NodeStore};
use courier_core::{
    DurabilityAgent, Envelope, InMemoryMessageStore, NodeRecord, NodeRegistry, RecoveredMessageSink,
    Result,
};
use parking_lot::Mutex;

#[derive(Default)]
struct CollectingSink {
    incoming: Mutex<Vec<Envelope>>,
    outgoing: Mutex<Vec<Envelope>>,
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
async fn reassignment_loop_adopts_dead_nodes_work() {
    let store: Arc<InMemoryMessageStore> = Arc::new(InMemoryMessageStore::new());
    let sink = Arc::new(CollectingSink::default());

    // this node is registered with a fresh heartbeat
    let self_number = store
        .register_node(&NodeRecord::new("tcp://self:5555"))
        .await
        .unwrap();

    // an envelope claimed by owner 9, which has no registry record at all
    let orphan = Envelope::new("orphaned", vec![]);
    store.store_incoming(&orphan).await.unwrap();
    store.claim_owned_incoming(9).await.unwrap();

    let agent = DurabilityAgent::new(
        store.clone() as Arc<dyn MessageStore>,
        sink,
        fast_config(),
        self_number,
    );
    agent.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    agent.stop().await;

    // the orphan is now ours and claimable again under our number
    let claimed = store.claim_owned_incoming(self_number).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, orphan.id);
    assert_eq!(claimed[0].owner_id, self_number);
}

#[tokio::test]
async fn expiration_loop_prunes_handled_envelopes() {
    let store: Arc<InMemoryMessageStore> = Arc::new(InMemoryMessageStore::new());
    let sink = Arc::new(CollectingSink::default());

    let keep = Envelope::new("pending", vec![]);
    let done = Envelope::new("finished", vec![]);
    store.store_incoming_batch(&[keep.clone(), done.clone()]).await.unwrap();
    store.mark_handled(done.id).await.unwrap();

    let config = DurabilityConfig {
        handled_retention_seconds: 0,
        ..fast_config()
    };
    let agent = DurabilityAgent::new(
        store.clone() as Arc<dyn MessageStore>,
        sink.clone(),
        config,
        1,
    );
    agent.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    agent.stop().await;

    let counts = store.fetch_counts().await.unwrap();
    assert_eq!(counts.handled, 0);
    // the pending envelope survives; recovery handed it to the sink
    assert_eq!(counts.incoming, 1);
    assert_eq!(sink.incoming.lock().len(), 1);
    assert_eq!(sink.incoming.lock()[0].id, keep.id);
}

#[tokio::test]
async fn node_registry_lifecycle() {
    let store: Arc<InMemoryMessageStore> = Arc::new(InMemoryMessageStore::new());
    let mut registry = NodeRegistry::new(
        store.clone() as Arc<dyn MessageStore>,
        "tcp://here:5555",
        Duration::from_millis(10),
    );

    registry.start().await.unwrap();
    let number = registry.record().node_number;
    assert!(number >= 1);

    let registered_at = store.load_all_nodes().await.unwrap()[0].last_heartbeat;
    tokio::time::sleep(Duration::from_millis(80)).await;
    let refreshed = store.load_all_nodes().await.unwrap()[0].last_heartbeat;
    assert!(refreshed > registered_at, "heartbeat never refreshed");

    registry.stop().await.unwrap();
    assert!(store.load_all_nodes().await.unwrap().is_empty());
}

#[tokio::test]
async fn stop_halts_all_duty_loops() {
    let store: Arc<InMemoryMessageStore> = Arc::new(InMemoryMessageStore::new());
    let sink = Arc::new(CollectingSink::default());

    let agent = DurabilityAgent::new(
        store.clone() as Arc<dyn MessageStore>,
        sink,
        fast_config(),
        1,
    );
    agent.start().await.unwrap();
    agent.stop().await;

    // a newly scheduled envelope is never promoted once the agent is down
    let later = Envelope::new("later", vec![]).scheduled_for(Utc::now() - chrono::Duration::seconds(1));
    store.store_incoming(&later).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(store.fetch_counts().await.unwrap().scheduled, 1);
}
