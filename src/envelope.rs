//! # Envelope Data Model
//!
//! The envelope is the persisted unit of a message: an opaque payload plus
//! delivery metadata and lifecycle status. Its `id` is the idempotency
//! boundary: a second insert of the same id into the incoming set fails as
//! a duplicate rather than silently duplicate-processing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CourierError, Result};

/// Sentinel owner id meaning "unclaimed / any node may take this".
pub const ANY_NODE: i32 = 0;

/// Lifecycle status of a persisted envelope. Exactly one status at a time.
///
/// Legal transitions:
/// `Incoming → Handled | DeadLetter`, `Scheduled → Incoming`,
/// `Outgoing → (deleted on send)`, `DeadLetter → Incoming` (explicit replay
/// only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    Incoming,
    Scheduled,
    Outgoing,
    Handled,
    DeadLetter,
}

impl EnvelopeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeStatus::Incoming => "incoming",
            EnvelopeStatus::Scheduled => "scheduled",
            EnvelopeStatus::Outgoing => "outgoing",
            EnvelopeStatus::Handled => "handled",
            EnvelopeStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "incoming" => Ok(EnvelopeStatus::Incoming),
            "scheduled" => Ok(EnvelopeStatus::Scheduled),
            "outgoing" => Ok(EnvelopeStatus::Outgoing),
            "handled" => Ok(EnvelopeStatus::Handled),
            "dead_letter" => Ok(EnvelopeStatus::DeadLetter),
            other => Err(CourierError::invalid_state(format!(
                "unknown envelope status: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for EnvelopeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The message unit: identity, payload, routing metadata, lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique, stable id; the idempotency key for the life of the message.
    pub id: Uuid,
    /// Opaque payload bytes; serialization is the pipeline's concern.
    pub body: Vec<u8>,
    /// String discriminator used by the pipeline to deserialize the body.
    pub message_type: String,
    pub content_type: String,
    /// Where the message is (or was) headed.
    pub destination: Option<String>,
    pub reply_uri: Option<String>,
    pub correlation_id: Option<String>,
    pub conversation_id: Option<Uuid>,
    pub parent_id: Option<Uuid>,
    /// Originating node/service.
    pub source: Option<String>,
    pub status: EnvelopeStatus,
    /// Owning node number, or [`ANY_NODE`] when unclaimed.
    pub owner_id: i32,
    /// Delivery attempts so far; incremented on each dequeue.
    pub attempts: i32,
    /// When set and in the future, the envelope is not eligible for dequeue.
    pub scheduled_time: Option<DateTime<Utc>>,
    /// Expiration: past this instant the message is discarded, not delivered.
    pub deliver_by: Option<DateTime<Utc>>,
    pub sent_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(message_type: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            body,
            message_type: message_type.into(),
            content_type: "application/octet-stream".to_string(),
            destination: None,
            reply_uri: None,
            correlation_id: None,
            conversation_id: None,
            parent_id: None,
            source: None,
            status: EnvelopeStatus::Incoming,
            owner_id: ANY_NODE,
            attempts: 0,
            scheduled_time: None,
            deliver_by: None,
            sent_at: Utc::now(),
        }
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Schedule the envelope for later execution; status moves to Scheduled.
    pub fn scheduled_for(mut self, time: DateTime<Utc>) -> Self {
        self.scheduled_time = Some(time);
        self.status = EnvelopeStatus::Scheduled;
        self
    }

    pub fn with_deliver_by(mut self, deadline: DateTime<Utc>) -> Self {
        self.deliver_by = Some(deadline);
        self
    }

    /// Whether `deliver_by` has passed. Expired envelopes are discarded at
    /// dequeue and recovery time instead of delivered.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.deliver_by, Some(deadline) if deadline <= now)
    }

    /// Whether the envelope is due for delivery at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.scheduled_time {
            Some(time) => time <= now,
            None => true,
        }
    }
}

/// Snapshot of an envelope that exhausted retries or was routed aside,
/// with full exception detail for operator inspection and targeted replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterReport {
    pub envelope: Envelope,
    pub exception_type: String,
    pub exception_message: String,
    pub exception_text: String,
    pub explanation: String,
    pub replayable: bool,
    pub expires: Option<DateTime<Utc>>,
}

impl DeadLetterReport {
    pub fn new(envelope: Envelope, exception_type: impl Into<String>) -> Self {
        let exception_type = exception_type.into();
        Self {
            envelope,
            exception_message: String::new(),
            exception_text: String::new(),
            explanation: format!("exception of type {exception_type}"),
            exception_type,
            replayable: false,
            expires: None,
        }
    }

    pub fn with_exception_message(mut self, message: impl Into<String>) -> Self {
        self.exception_message = message.into();
        self
    }

    pub fn with_exception_text(mut self, text: impl Into<String>) -> Self {
        self.exception_text = text.into();
        self
    }

    pub fn with_expires(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }
}

/// Point-in-time row counts per lifecycle state, taken from one snapshot so
/// the sum matches the actual total at that instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedCounts {
    pub incoming: u64,
    pub scheduled: u64,
    pub outgoing: u64,
    pub handled: u64,
    pub dead_letter: u64,
}

impl PersistedCounts {
    pub fn total(&self) -> u64 {
        self.incoming + self.scheduled + self.outgoing + self.handled + self.dead_letter
    }
}
