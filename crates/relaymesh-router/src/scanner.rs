//! Reusable periodic scan task.
//!
//! A scanner wakes every `interval`, takes a collection snapshot from its
//! target (which may atomically swap the collection out, as the reaper
//! does), and invokes the target once per entry. The interval can be
//! retuned at runtime; zero disables scanning without tearing the task
//! down, matching how the remote-config surface turns the reaper off.
//!
//! Grounded on the teacher's spawned health-check loop
//! (`HealthChecker::spawn` / `run`), generalized over its target.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::debug;

/// What a scanner drives: a snapshot source and a per-entry callback.
#[async_trait]
pub trait ScanTarget: Send + Sync + 'static {
    type Key: Send;
    type Value: Send;

    /// Snapshot the collection for this pass. May swap the underlying
    /// collection out atomically.
    async fn collect(&self) -> Vec<(Self::Key, Self::Value)>;

    async fn each(&self, key: Self::Key, value: Self::Value, now: Instant);
}

/// Handle to a running periodic scan. Dropping it aborts the task.
pub struct IntervalScanner {
    name: &'static str,
    interval_ms: Arc<AtomicU64>,
    handle: JoinHandle<()>,
}

/// Poll cadence while disabled, so a remote-config re-enable is picked up.
const DISABLED_POLL: Duration = Duration::from_millis(500);

impl IntervalScanner {
    pub fn spawn<T: ScanTarget>(name: &'static str, interval: Duration, target: Arc<T>) -> Self {
        let interval_ms = Arc::new(AtomicU64::new(interval.as_millis() as u64));
        let shared_interval = interval_ms.clone();
        let handle = tokio::spawn(async move {
            loop {
                let period_ms = shared_interval.load(Ordering::Relaxed);
                if period_ms == 0 {
                    tokio::time::sleep(DISABLED_POLL).await;
                    continue;
                }
                tokio::time::sleep(Duration::from_millis(period_ms)).await;
                // the interval may have been zeroed while we slept
                if shared_interval.load(Ordering::Relaxed) == 0 {
                    continue;
                }
                let entries = target.collect().await;
                debug!(scanner = name, keys = entries.len(), "scan run begin");
                let now = Instant::now();
                for (key, value) in entries {
                    target.each(key, value, now).await;
                }
            }
        });
        Self { name, interval_ms, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Retune the period; zero disables.
    pub fn set_interval(&self, interval: Duration) {
        self.interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Relaxed))
    }
}

impl Drop for IntervalScanner {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
