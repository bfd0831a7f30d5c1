//! Heartbeat Supervisor
//!
//! Probes a live connection on a fixed interval and reports when too many
//! consecutive probes go unanswered. It only reports; closing the connection
//! and reconnecting are the engine's job.

use std::time::Duration;

use async_trait::async_trait;
use imwire_core::{HeartbeatConfig, ImwireResult};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// What the supervisor probes and whom it reports to
#[async_trait]
pub trait HeartbeatTarget: Send + Sync + 'static {
    /// Send one probe and wait for its reply
    async fn probe(&self, deadline: Duration) -> ImwireResult<()>;

    /// Called once when `missed` consecutive probes failed
    fn report_failure(&self, missed: u32);
}

#[derive(Debug, Clone)]
pub struct HeartbeatSupervisor {
    config: HeartbeatConfig,
}

impl HeartbeatSupervisor {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self { config }
    }

    pub fn spawn<T: HeartbeatTarget>(self, target: T) -> JoinHandle<()> {
        tokio::spawn(self.run(target))
    }

    /// Probe until the miss limit is reached
    pub async fn run<T: HeartbeatTarget>(self, target: T) {
        let period = self.config.interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut missed = 0u32;

        loop {
            ticker.tick().await;

            let outcome = timeout(self.config.timeout, target.probe(self.config.timeout)).await;
            match outcome {
                Ok(Ok(())) => {
                    if missed > 0 {
                        debug!(missed, "heartbeat recovered");
                    }
                    missed = 0;
                }
                Ok(Err(error)) => {
                    missed += 1;
                    warn!(%error, missed, "heartbeat probe failed");
                }
                Err(_) => {
                    missed += 1;
                    warn!(missed, deadline = ?self.config.timeout, "heartbeat probe timed out");
                }
            }

            if missed >= self.config.max_missed {
                target.report_failure(missed);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imwire_core::ImwireError;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Scripted {
        replies: Arc<Mutex<VecDeque<bool>>>,
        probes: Arc<AtomicU32>,
        reported: Arc<Mutex<Option<u32>>>,
    }

    impl Scripted {
        fn new(replies: &[bool]) -> Self {
            let scripted = Self::default();
            scripted.replies.lock().extend(replies.iter().copied());
            scripted
        }
    }

    #[async_trait]
    impl HeartbeatTarget for Scripted {
        async fn probe(&self, deadline: Duration) -> ImwireResult<()> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            let reply = self.replies.lock().pop_front().unwrap_or(false);
            if reply {
                Ok(())
            } else {
                // silent server: outlive the deadline
                tokio::time::sleep(deadline * 2).await;
                Err(ImwireError::Cancelled)
            }
        }

        fn report_failure(&self, missed: u32) {
            *self.reported.lock() = Some(missed);
        }
    }

    fn config() -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
            max_missed: 2,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_after_consecutive_misses() {
        let target = Scripted::new(&[true, false, false]);
        let started = Instant::now();
        HeartbeatSupervisor::new(config()).run(target.clone()).await;

        assert_eq!(*target.reported.lock(), Some(2));
        assert_eq!(target.probes.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_resets_miss_count() {
        let target = Scripted::new(&[false, true, false, true, false, false]);
        HeartbeatSupervisor::new(config()).run(target.clone()).await;

        assert_eq!(*target.reported.lock(), Some(2));
        assert_eq!(target.probes.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_target_is_never_reported() {
        let target = Scripted::new(&[true; 8]);
        let handle = HeartbeatSupervisor::new(config()).spawn(target.clone());

        tokio::time::sleep(Duration::from_secs(75)).await;
        assert_eq!(*target.reported.lock(), None);
        assert_eq!(target.probes.load(Ordering::SeqCst), 7);
        handle.abort();
    }
}
