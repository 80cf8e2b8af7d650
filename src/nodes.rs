//! # Node Registry
//!
//! Tracks live node identities for cross-node coordination. Each running
//! process registers exactly one record, refreshes its heartbeat while
//! alive, and removes the record on graceful shutdown so peers can reassign
//! its work immediately instead of waiting out the staleness window.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::storage::MessageStore;

/// One live service instance, as persisted in the node table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Stable per-process identity.
    pub node_id: Uuid,
    /// Compact integer used as the envelope owner tag.
    pub node_number: i32,
    /// Address peers use for inter-node control messages.
    pub control_uri: String,
    pub last_heartbeat: DateTime<Utc>,
}

impl NodeRecord {
    pub fn new(control_uri: impl Into<String>) -> Self {
        Self {
            node_id: Uuid::new_v4(),
            node_number: 0,
            control_uri: control_uri.into(),
            last_heartbeat: Utc::now(),
        }
    }

    pub fn is_stale(&self, staleness: Duration, now: DateTime<Utc>) -> bool {
        now - self.last_heartbeat > staleness
    }
}

/// Node numbers with a fresh heartbeat, judged at `now` against the
/// staleness window. `self_number` is always considered live; a node never
/// declares itself dead based on its own unpublished heartbeat.
pub fn live_node_numbers(
    all: &[NodeRecord],
    staleness: Duration,
    now: DateTime<Utc>,
    self_number: i32,
) -> Vec<i32> {
    let mut live: Vec<i32> = all
        .iter()
        .filter(|node| node.node_number == self_number || !node.is_stale(staleness, now))
        .map(|node| node.node_number)
        .collect();
    if !live.contains(&self_number) {
        live.push(self_number);
    }
    live
}

/// Registers this process in the node table and keeps its heartbeat fresh.
pub struct NodeRegistry {
    store: Arc<dyn MessageStore>,
    record: NodeRecord,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    heartbeat_interval: std::time::Duration,
}

impl NodeRegistry {
    pub fn new(
        store: Arc<dyn MessageStore>,
        control_uri: impl Into<String>,
        heartbeat_interval: std::time::Duration,
    ) -> Self {
        Self {
            store,
            record: NodeRecord::new(control_uri),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            heartbeat_interval,
        }
    }

    /// The record for this process, with `node_number` populated once
    /// [`start`](Self::start) has registered it.
    pub fn record(&self) -> &NodeRecord {
        &self.record
    }

    /// Register this node and spawn the heartbeat loop.
    pub async fn start(&mut self) -> Result<()> {
        let assigned = self.store.register_node(&self.record).await?;
        self.record.node_number = assigned;
        self.running.store(true, Ordering::Release);

        info!(
            node_id = %self.record.node_id,
            node_number = assigned,
            control_uri = %self.record.control_uri,
            "node registered"
        );

        let store = Arc::clone(&self.store);
        let node_id = self.record.node_id;
        let running = Arc::clone(&self.running);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.heartbeat_interval;

        tokio::spawn(async move {
            while running.load(Ordering::Acquire) {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if !running.load(Ordering::Acquire) {
                    break;
                }
                if let Err(e) = store.heartbeat(node_id).await {
                    warn!(node_id = %node_id, error = %e, "heartbeat publication failed");
                }
            }
            debug!(node_id = %node_id, "heartbeat loop stopped");
        });

        Ok(())
    }

    /// Stop the heartbeat loop and delete this node's registry record so
    /// reassignment can run immediately.
    pub async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        self.shutdown.notify_waiters();
        self.store.remove_node(self.record.node_id).await?;
        info!(node_id = %self.record.node_id, "node deregistered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(number: i32, heartbeat_age_secs: i64) -> NodeRecord {
        NodeRecord {
            node_id: Uuid::new_v4(),
            node_number: number,
            control_uri: format!("tcp://node-{number}:5555"),
            last_heartbeat: Utc::now() - Duration::seconds(heartbeat_age_secs),
        }
    }

    #[test]
    fn stale_detection_boundary() {
        let staleness = Duration::seconds(30);
        let now = Utc::now();
        assert!(!node(1, 10).is_stale(staleness, now));
        assert!(node(1, 31).is_stale(staleness, now));
    }

    #[test]
    fn live_numbers_exclude_stale_peers() {
        let staleness = Duration::seconds(30);
        let now = Utc::now();
        let all = vec![node(1, 120), node(2, 5), node(3, 120)];

        let live = live_node_numbers(&all, staleness, now, 3);
        assert_eq!(live, vec![2, 3]);
    }

    #[test]
    fn live_numbers_always_include_self() {
        let staleness = Duration::seconds(30);
        let now = Utc::now();
        let all = vec![node(1, 120), node(2, 5)];

        let live = live_node_numbers(&all, staleness, now, 7);
        assert!(live.contains(&2));
        assert!(live.contains(&7));
        assert!(!live.contains(&1));
    }
}
