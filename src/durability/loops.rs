//! # Duty Loop Runner
//!
//! Each durability responsibility runs as an independent, cancellable
//! polling loop with its own interval and failure-count backoff, so a
//! persistent failure in one subsystem never busy-loops the process and
//! never takes the other loops down with it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::Result;

/// Linear backoff: 100ms per consecutive failure, capped at 1s.
pub fn backoff_delay(failures: u32) -> Duration {
    Duration::from_millis((u64::from(failures) * 100).min(1_000))
}

/// One independently schedulable durability responsibility.
#[async_trait]
pub trait DurabilityDuty: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run one iteration, returning how many records were affected.
    async fn tick(&self) -> Result<u64>;
}

/// Shared cancellation scope for a set of loops, created at node start and
/// cancelled as a unit at node stop.
#[derive(Clone)]
pub struct LoopControl {
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl LoopControl {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.shutdown.notify_waiters();
    }

    /// Resolves once the scope is cancelled. Callers race this against
    /// other futures in a `select!`; pairing it with a timed branch covers
    /// the notify-before-wait race.
    pub async fn cancelled(&self) {
        if !self.is_running() {
            return;
        }
        self.shutdown.notified().await;
    }

    /// Sleep that returns early (with `false`) on cancellation.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if !self.is_running() {
            return false;
        }
        tokio::select! {
            _ = self.shutdown.notified() => false,
            _ = tokio::time::sleep(duration) => self.is_running(),
        }
    }
}

impl Default for LoopControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the polling loop for one duty. Iteration failures are logged and
/// the loop continues; nothing escapes the task.
pub fn spawn_duty_loop(
    duty: Arc<dyn DurabilityDuty>,
    interval: Duration,
    initial_delay: Duration,
    control: LoopControl,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if !control.sleep(initial_delay).await {
            return;
        }
        let mut failures: u32 = 0;
        loop {
            if !control.is_running() {
                break;
            }
            match duty.tick().await {
                Ok(affected) => {
                    failures = 0;
                    if affected > 0 {
                        debug!(duty = duty.name(), affected, "duty iteration complete");
                    } else {
                        trace!(duty = duty.name(), "duty iteration idle");
                    }
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    warn!(
                        duty = duty.name(),
                        failures,
                        error = %e,
                        "duty iteration failed, continuing"
                    );
                }
            }
            if !control.sleep(interval + backoff_delay(failures)).await {
                break;
            }
        }
        debug!(duty = duty.name(), "duty loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn backoff_is_linear_and_capped() {
        assert_eq!(backoff_delay(0), Duration::ZERO);
        assert_eq!(backoff_delay(1), Duration::from_millis(100));
        assert_eq!(backoff_delay(7), Duration::from_millis(700));
        assert_eq!(backoff_delay(10), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(500), Duration::from_millis(1_000));
    }

    struct CountingDuty {
        ticks: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl DurabilityDuty for CountingDuty {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn tick(&self) -> Result<u64> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(crate::error::CourierError::Transient {
                    message: "induced".into(),
                })
            } else {
                Ok(1)
            }
        }
    }

    #[tokio::test]
    async fn loop_runs_and_cancels_promptly() {
        let duty = Arc::new(CountingDuty {
            ticks: AtomicU32::new(0),
            fail: false,
        });
        let control = LoopControl::new();
        let handle = spawn_duty_loop(
            duty.clone(),
            Duration::from_millis(5),
            Duration::ZERO,
            control.clone(),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        control.stop();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop did not stop after cancellation")
            .unwrap();
        assert!(duty.ticks.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn failing_duty_keeps_looping() {
        let duty = Arc::new(CountingDuty {
            ticks: AtomicU32::new(0),
            fail: true,
        });
        let control = LoopControl::new();
        let handle = spawn_duty_loop(
            duty.clone(),
            Duration::from_millis(1),
            Duration::ZERO,
            control.clone(),
        );

        // Enough wall time for several failing iterations plus backoff.
        tokio::time::sleep(Duration::from_millis(350)).await;
        control.stop();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(duty.ticks.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn cancelled_sleep_returns_false() {
        let control = LoopControl::new();
        control.stop();
        assert!(!control.sleep(Duration::from_secs(10)).await);
    }
}
