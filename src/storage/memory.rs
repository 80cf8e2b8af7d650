//! # In-Memory Message Store
//!
//! A complete [`MessageStore`] implementation over process-local maps.
//! Backs the durability agent and router tests, and serves embedded
//! scenarios where a database is not available. Semantics mirror the
//! Postgres store, including duplicate detection and atomic moves.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::envelope::{DeadLetterReport, Envelope, EnvelopeStatus, PersistedCounts, ANY_NODE};
use crate::error::{CourierError, Result};
use crate::nodes::NodeRecord;
use crate::storage::{DeadLetters, Inbox, MessageStore, NodeStore, Outbox};

#[derive(Default)]
struct Inner {
    incoming: HashMap<Uuid, Envelope>,
    outgoing: HashMap<Uuid, Envelope>,
    dead_letters: HashMap<Uuid, DeadLetterReport>,
    nodes: HashMap<Uuid, NodeRecord>,
    handled_at: HashMap<Uuid, DateTime<Utc>>,
    next_node_number: i32,
}

#[derive(Default)]
pub struct InMemoryMessageStore {
    inner: Mutex<Inner>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Same normalization the Postgres store applies on insert: a Scheduled
/// envelope with no execution time would never promote, so it lands as
/// Incoming.
fn normalize_incoming(envelope: &Envelope) -> Envelope {
    let mut stored = envelope.clone();
    match stored.status {
        EnvelopeStatus::Scheduled if stored.scheduled_time.is_some() => {}
        _ => stored.status = EnvelopeStatus::Incoming,
    }
    stored
}

#[async_trait]
impl Inbox for InMemoryMessageStore {
    async fn store_incoming(&self, envelope: &Envelope) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.incoming.contains_key(&envelope.id) {
            return Err(CourierError::DuplicateEnvelope { id: envelope.id });
        }
        inner.incoming.insert(envelope.id, normalize_incoming(envelope));
        Ok(())
    }

    async fn store_incoming_batch(&self, envelopes: &[Envelope]) -> Result<()> {
        // All-or-nothing, like the transactional batch in the Postgres store.
        let mut inner = self.inner.lock();
        if let Some(duplicate) = envelopes
            .iter()
            .find(|e| inner.incoming.contains_key(&e.id))
        {
            return Err(CourierError::DuplicateEnvelope { id: duplicate.id });
        }
        for envelope in envelopes {
            inner.incoming.insert(envelope.id, normalize_incoming(envelope));
        }
        Ok(())
    }

    async fn mark_handled(&self, id: Uuid) -> Result<()> {
        self.mark_handled_batch(&[id]).await
    }

    async fn mark_handled_batch(&self, ids: &[Uuid]) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        for id in ids {
            if let Some(envelope) = inner.incoming.get_mut(id) {
                envelope.status = EnvelopeStatus::Handled;
                envelope.owner_id = ANY_NODE;
                inner.handled_at.insert(*id, now);
            }
        }
        Ok(())
    }

    async fn increment_attempts(&self, id: Uuid) -> Result<i32> {
        let mut inner = self.inner.lock();
        match inner.incoming.get_mut(&id) {
            Some(envelope) => {
                envelope.attempts += 1;
                Ok(envelope.attempts)
            }
            None => Err(CourierError::invalid_state(format!(
                "no incoming envelope {id} to increment"
            ))),
        }
    }

    async fn schedule_execution(&self, schedules: &[(Uuid, DateTime<Utc>)]) -> Result<u64> {
        let mut inner = self.inner.lock();
        let mut affected = 0;
        for (id, time) in schedules {
            if let Some(envelope) = inner.incoming.get_mut(id) {
                envelope.status = EnvelopeStatus::Scheduled;
                envelope.scheduled_time = Some(*time);
                envelope.owner_id = ANY_NODE;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn claim_owned_incoming(&self, owner_id: i32) -> Result<Vec<Envelope>> {
        let mut inner = self.inner.lock();
        let mut claimed = Vec::new();
        for envelope in inner.incoming.values_mut() {
            if envelope.status == EnvelopeStatus::Incoming
                && (envelope.owner_id == owner_id || envelope.owner_id == ANY_NODE)
            {
                envelope.owner_id = owner_id;
                claimed.push(envelope.clone());
            }
        }
        Ok(claimed)
    }

    async fn promote_scheduled(&self, now: DateTime<Utc>, batch_size: i64) -> Result<u64> {
        let mut inner = self.inner.lock();
        let mut due: Vec<Uuid> = inner
            .incoming
            .values()
            .filter(|e| {
                e.status == EnvelopeStatus::Scheduled
                    && e.scheduled_time.map(|t| t <= now).unwrap_or(false)
            })
            .map(|e| e.id)
            .collect();
        due.truncate(batch_size.max(0) as usize);
        for id in &due {
            if let Some(envelope) = inner.incoming.get_mut(id) {
                envelope.status = EnvelopeStatus::Incoming;
                envelope.owner_id = ANY_NODE;
            }
        }
        Ok(due.len() as u64)
    }
}

#[async_trait]
impl Outbox for InMemoryMessageStore {
    async fn store_outgoing(&self, envelope: &Envelope, owner_id: i32) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut stored = envelope.clone();
        stored.status = EnvelopeStatus::Outgoing;
        stored.owner_id = owner_id;
        inner.outgoing.insert(stored.id, stored);
        Ok(())
    }

    async fn store_outgoing_batch(&self, envelopes: &[Envelope], owner_id: i32) -> Result<()> {
        for envelope in envelopes {
            self.store_outgoing(envelope, owner_id).await?;
        }
        Ok(())
    }

    async fn delete_outgoing(&self, ids: &[Uuid]) -> Result<u64> {
        let mut inner = self.inner.lock();
        let mut deleted = 0;
        for id in ids {
            if inner.outgoing.remove(id).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn claim_owned_outgoing(&self, owner_id: i32) -> Result<Vec<Envelope>> {
        let mut inner = self.inner.lock();
        let mut claimed = Vec::new();
        for envelope in inner.outgoing.values_mut() {
            if envelope.owner_id == owner_id || envelope.owner_id == ANY_NODE {
                envelope.owner_id = owner_id;
                claimed.push(envelope.clone());
            }
        }
        Ok(claimed)
    }

    async fn discard_and_reassign_outgoing(
        &self,
        discard: &[Uuid],
        reassign: &[Uuid],
        new_owner_id: i32,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        for id in discard {
            inner.outgoing.remove(id);
        }
        for id in reassign {
            if let Some(envelope) = inner.outgoing.get_mut(id) {
                envelope.owner_id = new_owner_id;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DeadLetters for InMemoryMessageStore {
    async fn move_to_dead_letter(&self, report: &DeadLetterReport) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.incoming.remove(&report.envelope.id);
        inner.dead_letters.insert(report.envelope.id, report.clone());
        Ok(())
    }

    async fn move_to_dead_letter_batch(&self, reports: &[DeadLetterReport]) -> Result<()> {
        for report in reports {
            self.move_to_dead_letter(report).await?;
        }
        Ok(())
    }

    async fn mark_replayable_by_exception_type(&self, exception_type: &str) -> Result<u64> {
        let mut inner = self.inner.lock();
        let mut flagged = 0;
        for report in inner.dead_letters.values_mut() {
            if report.exception_type == exception_type && !report.replayable {
                report.replayable = true;
                flagged += 1;
            }
        }
        Ok(flagged)
    }

    async fn mark_replayable(&self, ids: &[Uuid]) -> Result<u64> {
        let mut inner = self.inner.lock();
        let mut flagged = 0;
        for id in ids {
            if let Some(report) = inner.dead_letters.get_mut(id) {
                if !report.replayable {
                    report.replayable = true;
                    flagged += 1;
                }
            }
        }
        Ok(flagged)
    }

    async fn load_dead_letter(&self, id: Uuid) -> Result<Option<DeadLetterReport>> {
        Ok(self.inner.lock().dead_letters.get(&id).cloned())
    }

    async fn replay_dead_letters(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        let replayable: Vec<Uuid> = inner
            .dead_letters
            .values()
            .filter(|report| report.replayable)
            .map(|report| report.envelope.id)
            .collect();
        let mut replayed = 0;
        for id in replayable {
            if let Some(report) = inner.dead_letters.remove(&id) {
                let mut envelope = report.envelope;
                envelope.status = EnvelopeStatus::Incoming;
                envelope.owner_id = ANY_NODE;
                // Matches ON CONFLICT DO NOTHING on the replay insert.
                inner.incoming.entry(envelope.id).or_insert(envelope);
                replayed += 1;
            }
        }
        Ok(replayed)
    }
}

#[async_trait]
impl NodeStore for InMemoryMessageStore {
    async fn register_node(&self, record: &NodeRecord) -> Result<i32> {
        let mut inner = self.inner.lock();
        inner.next_node_number += 1;
        let number = inner.next_node_number;
        let mut stored = record.clone();
        stored.node_number = number;
        stored.last_heartbeat = Utc::now();
        inner.nodes.insert(stored.node_id, stored);
        Ok(number)
    }

    async fn heartbeat(&self, node_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(node) = inner.nodes.get_mut(&node_id) {
            node.last_heartbeat = Utc::now();
        }
        Ok(())
    }

    async fn remove_node(&self, node_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(node) = inner.nodes.remove(&node_id) {
            let number = node.node_number;
            for envelope in inner.incoming.values_mut() {
                if envelope.owner_id == number {
                    envelope.owner_id = ANY_NODE;
                }
            }
            for envelope in inner.outgoing.values_mut() {
                if envelope.owner_id == number {
                    envelope.owner_id = ANY_NODE;
                }
            }
        }
        Ok(())
    }

    async fn load_all_nodes(&self) -> Result<Vec<NodeRecord>> {
        let mut nodes: Vec<NodeRecord> = self.inner.lock().nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.node_number);
        Ok(nodes)
    }

    async fn reassign_from_dead_nodes(
        &self,
        live_nodes: &[i32],
        new_owner_id: i32,
    ) -> Result<u64> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut reassigned = 0;
        for envelope in inner
            .incoming
            .values_mut()
            .chain(inner.outgoing.values_mut())
        {
            if envelope.owner_id != ANY_NODE && !live_nodes.contains(&envelope.owner_id) {
                envelope.owner_id = new_owner_id;
                reassigned += 1;
            }
        }
        Ok(reassigned)
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn fetch_counts(&self) -> Result<PersistedCounts> {
        let inner = self.inner.lock();
        let mut counts = PersistedCounts::default();
        for envelope in inner.incoming.values() {
            match envelope.status {
                EnvelopeStatus::Incoming => counts.incoming += 1,
                EnvelopeStatus::Scheduled => counts.scheduled += 1,
                EnvelopeStatus::Handled => counts.handled += 1,
                EnvelopeStatus::Outgoing | EnvelopeStatus::DeadLetter => {}
            }
        }
        counts.outgoing = inner.outgoing.len() as u64;
        counts.dead_letter = inner.dead_letters.len() as u64;
        Ok(counts)
    }

    async fn delete_expired(
        &self,
        now: DateTime<Utc>,
        handled_retention: chrono::Duration,
        node_record_retention: chrono::Duration,
    ) -> Result<u64> {
        let mut inner = self.inner.lock();
        let handled_cutoff = now - handled_retention;
        let heartbeat_cutoff = now - node_record_retention;
        let mut deleted = 0;

        let expired_handled: Vec<Uuid> = inner
            .incoming
            .values()
            .filter(|e| e.status == EnvelopeStatus::Handled)
            .filter(|e| {
                inner
                    .handled_at
                    .get(&e.id)
                    .map(|at| *at < handled_cutoff)
                    .unwrap_or(true)
            })
            .map(|e| e.id)
            .collect();
        for id in expired_handled {
            inner.incoming.remove(&id);
            inner.handled_at.remove(&id);
            deleted += 1;
        }

        let expired_dead: Vec<Uuid> = inner
            .dead_letters
            .values()
            .filter(|r| matches!(r.expires, Some(expires) if expires < now))
            .map(|r| r.envelope.id)
            .collect();
        for id in expired_dead {
            inner.dead_letters.remove(&id);
            deleted += 1;
        }

        let stale_nodes: Vec<Uuid> = inner
            .nodes
            .values()
            .filter(|n| n.last_heartbeat < heartbeat_cutoff)
            .map(|n| n.node_id)
            .collect();
        for id in stale_nodes {
            inner.nodes.remove(&id);
            deleted += 1;
        }

        Ok(deleted)
    }

    async fn clear_all(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.incoming.clear();
        inner.outgoing.clear();
        inner.dead_letters.clear();
        inner.nodes.clear();
        inner.handled_at.clear();
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn teardown_schema(&self) -> Result<()> {
        self.clear_all().await
    }

    async fn check_schema(&self) -> Result<()> {
        Ok(())
    }

    fn uri(&self) -> String {
        "memory://".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_incoming_is_rejected_without_second_row() {
        let store = InMemoryMessageStore::new();
        let envelope = Envelope::new("orders.placed", b"one".to_vec());
        store.store_incoming(&envelope).await.unwrap();

        let err = store.store_incoming(&envelope).await.unwrap_err();
        assert!(err.is_duplicate());
        assert_eq!(store.fetch_counts().await.unwrap().incoming, 1);
    }

    #[tokio::test]
    async fn counts_sum_to_total() {
        let store = InMemoryMessageStore::new();
        for _ in 0..4 {
            store
                .store_incoming(&Envelope::new("a", vec![]))
                .await
                .unwrap();
        }
        store
            .store_outgoing(&Envelope::new("b", vec![]), 3)
            .await
            .unwrap();
        let scheduled =
            Envelope::new("c", vec![]).scheduled_for(Utc::now() + chrono::Duration::hours(1));
        store.store_incoming(&scheduled).await.unwrap();

        let counts = store.fetch_counts().await.unwrap();
        assert_eq!(counts.incoming, 4);
        assert_eq!(counts.scheduled, 1);
        assert_eq!(counts.outgoing, 1);
        assert_eq!(counts.total(), 6);
    }

    #[tokio::test]
    async fn reassignment_skips_live_owners_and_unclaimed() {
        let store = InMemoryMessageStore::new();
        let owned_by_live = Envelope::new("a", vec![]);
        let owned_by_dead = Envelope::new("b", vec![]);
        let unclaimed = Envelope::new("c", vec![]);
        store.store_incoming_batch(&[owned_by_live.clone(), owned_by_dead.clone(), unclaimed.clone()]).await.unwrap();
        // claim two of them under different owners
        {
            let mut inner = store.inner.lock();
            inner.incoming.get_mut(&owned_by_live.id).unwrap().owner_id = 2;
            inner.incoming.get_mut(&owned_by_dead.id).unwrap().owner_id = 9;
        }

        let moved = store.reassign_from_dead_nodes(&[1, 2], 1).await.unwrap();
        assert_eq!(moved, 1);

        let inner = store.inner.lock();
        assert_eq!(inner.incoming[&owned_by_live.id].owner_id, 2);
        assert_eq!(inner.incoming[&owned_by_dead.id].owner_id, 1);
        assert_eq!(inner.incoming[&unclaimed.id].owner_id, ANY_NODE);
    }

    #[tokio::test]
    async fn dead_letter_round_trip() {
        let store = InMemoryMessageStore::new();
        let envelope = Envelope::new("orders.placed", vec![]);
        store.store_incoming(&envelope).await.unwrap();

        let report = DeadLetterReport::new(envelope.clone(), "TimeoutError")
            .with_exception_message("deadline exceeded");
        store.move_to_dead_letter(&report).await.unwrap();
        assert_eq!(store.fetch_counts().await.unwrap().dead_letter, 1);
        assert_eq!(store.fetch_counts().await.unwrap().incoming, 0);

        assert_eq!(
            store
                .mark_replayable_by_exception_type("TimeoutError")
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.replay_dead_letters().await.unwrap(), 1);

        let counts = store.fetch_counts().await.unwrap();
        assert_eq!(counts.incoming, 1);
        assert_eq!(counts.dead_letter, 0);
        assert!(store.load_dead_letter(envelope.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn promote_scheduled_moves_only_due_rows() {
        let store = InMemoryMessageStore::new();
        let now = Utc::now();
        let due = Envelope::new("due", vec![]).scheduled_for(now - chrono::Duration::seconds(1));
        let later = Envelope::new("later", vec![]).scheduled_for(now + chrono::Duration::hours(2));
        store.store_incoming_batch(&[due.clone(), later.clone()]).await.unwrap();

        assert_eq!(store.promote_scheduled(now, 100).await.unwrap(), 1);
        let counts = store.fetch_counts().await.unwrap();
        assert_eq!(counts.incoming, 1);
        assert_eq!(counts.scheduled, 1);
    }

    #[tokio::test]
    async fn scheduled_without_time_is_stored_as_incoming() {
        let store = InMemoryMessageStore::new();
        let mut envelope = Envelope::new("limbo", vec![]);
        envelope.status = EnvelopeStatus::Scheduled;
        store.store_incoming(&envelope).await.unwrap();

        let counts = store.fetch_counts().await.unwrap();
        assert_eq!(counts.incoming, 1);
        assert_eq!(counts.scheduled, 0);
        // and nothing is left behind that promotion could never reach
        assert_eq!(store.promote_scheduled(Utc::now(), 100).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn node_registration_assigns_increasing_numbers() {
        let store = InMemoryMessageStore::new();
        let a = store
            .register_node(&NodeRecord::new("tcp://a"))
            .await
            .unwrap();
        let b = store
            .register_node(&NodeRecord::new("tcp://b"))
            .await
            .unwrap();
        assert!(b > a);
        assert_eq!(store.load_all_nodes().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn node_records_prune_only_past_retention() {
        let store = InMemoryMessageStore::new();
        let fresh = NodeRecord::new("tcp://fresh");
        let defunct = NodeRecord::new("tcp://defunct");
        store.register_node(&fresh).await.unwrap();
        store.register_node(&defunct).await.unwrap();
        {
            let mut inner = store.inner.lock();
            inner.nodes.get_mut(&defunct.node_id).unwrap().last_heartbeat =
                Utc::now() - chrono::Duration::minutes(10);
        }

        let retention = chrono::Duration::minutes(5);
        let deleted = store
            .delete_expired(Utc::now(), chrono::Duration::minutes(5), retention)
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let remaining = store.load_all_nodes().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].node_id, fresh.node_id);
    }

    #[tokio::test]
    async fn remove_node_releases_ownership() {
        let store = InMemoryMessageStore::new();
        let record = NodeRecord::new("tcp://a");
        let number = store.register_node(&record).await.unwrap();

        let envelope = Envelope::new("a", vec![]);
        store.store_incoming(&envelope).await.unwrap();
        store.claim_owned_incoming(number).await.unwrap();

        store.remove_node(record.node_id).await.unwrap();
        let inner = store.inner.lock();
        assert_eq!(inner.incoming[&envelope.id].owner_id, ANY_NODE);
        assert!(inner.nodes.is_empty());
    }
}
