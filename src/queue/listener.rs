//! # Queue Listener
//!
//! Competing-consumer read loop for one [`PostgresQueue`]. Lease
//! concurrency is bounded by a counting semaphore sized to the configured
//! max-concurrent-messages; when the queue is empty the loop blocks on the
//! queue's NOTIFY channel with a poll-interval timeout as a fallback.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ListenerConfig;
use crate::durability::loops::{backoff_delay, LoopControl};
use crate::envelope::Envelope;
use crate::error::Result;
use crate::queue::{PostgresQueue, QueueLease};

/// What the handler pipeline decided about a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDisposition {
    /// Handling succeeded; delete the message.
    Complete,
    /// Handling failed or must be retried later; leave the message queued
    /// with its incremented attempt count.
    Defer,
}

/// The handler-invocation pipeline's entry point. The listener calls
/// `received` once per leased message and applies the returned disposition
/// to the lease.
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    async fn received(&self, queue: &str, envelope: Envelope) -> MessageDisposition;
}

/// Read loop over one queue, delivering to one receiver.
pub struct QueueListener {
    queue: Arc<PostgresQueue>,
    receiver: Arc<dyn MessageReceiver>,
    config: ListenerConfig,
    permits: Arc<Semaphore>,
    control: LoopControl,
}

impl QueueListener {
    pub fn new(
        queue: Arc<PostgresQueue>,
        receiver: Arc<dyn MessageReceiver>,
        config: ListenerConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_messages));
        Self {
            queue,
            receiver,
            config,
            permits,
            control: LoopControl::new(),
        }
    }

    pub fn control(&self) -> LoopControl {
        self.control.clone()
    }

    /// Stop the read loop. In-flight leases finish their commit or roll
    /// back; none half-apply.
    pub fn stop(&self) {
        self.control.stop();
    }

    /// Spawn the read loop.
    pub fn start(&self) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let receiver = Arc::clone(&self.receiver);
        let permits = Arc::clone(&self.permits);
        let control = self.control.clone();
        let poll_interval = self.config.poll_interval();

        tokio::spawn(async move {
            let channel = queue.channel();
            let mut wakeup = match PgListener::connect_with(queue.pool()).await {
                Ok(mut listener) => match listener.listen(&channel).await {
                    Ok(()) => Some(listener),
                    Err(e) => {
                        warn!(queue = queue.name(), error = %e, "LISTEN failed, falling back to polling");
                        None
                    }
                },
                Err(e) => {
                    warn!(queue = queue.name(), error = %e, "notification connection failed, falling back to polling");
                    None
                }
            };

            info!(queue = queue.name(), "queue listener started");
            let mut failures: u32 = 0;
            while control.is_running() {
                // The permit bounds open leases; holding it here means the
                // next lease attempt blocks instead of queueing unboundedly.
                let permit = tokio::select! {
                    permit = Arc::clone(&permits).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                    _ = control.cancelled() => break,
                };

                match queue.try_lease().await {
                    Ok(Some(lease)) => {
                        failures = 0;
                        let receiver = Arc::clone(&receiver);
                        let queue_name = queue.name().to_string();
                        tokio::spawn(async move {
                            deliver(lease, &queue_name, receiver).await;
                            drop(permit);
                        });
                    }
                    Ok(None) => {
                        drop(permit);
                        failures = 0;
                        // Idle: wait for a NOTIFY or the poll interval,
                        // whichever comes first.
                        match wakeup.as_mut() {
                            Some(listener) => {
                                tokio::select! {
                                    _ = control.cancelled() => break,
                                    _ = tokio::time::sleep(poll_interval) => {}
                                    notification = listener.recv() => {
                                        if let Err(e) = notification {
                                            warn!(queue = queue.name(), error = %e, "notification stream error");
                                        }
                                    }
                                }
                            }
                            None => {
                                if !control.sleep(poll_interval).await {
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        drop(permit);
                        failures = failures.saturating_add(1);
                        warn!(queue = queue.name(), failures, error = %e, "lease attempt failed");
                        if !control.sleep(poll_interval + backoff_delay(failures)).await {
                            break;
                        }
                    }
                }
            }
            info!(queue = queue.name(), "queue listener stopped");
        })
    }
}

async fn deliver(lease: QueueLease, queue_name: &str, receiver: Arc<dyn MessageReceiver>) {
    let envelope = lease.envelope().clone();
    let id = envelope.id;
    match receiver.received(queue_name, envelope).await {
        MessageDisposition::Complete => {
            if let Err(e) = lease.complete().await {
                error!(queue = queue_name, id = %id, error = %e, "failed to complete lease");
            } else {
                debug!(queue = queue_name, id = %id, "message completed");
            }
        }
        MessageDisposition::Defer => {
            if let Err(e) = lease.defer().await {
                error!(queue = queue_name, id = %id, error = %e, "failed to defer lease");
            } else {
                debug!(queue = queue_name, id = %id, "message deferred for retry");
            }
        }
    }
}
