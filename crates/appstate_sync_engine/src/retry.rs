//! Delayed, cancellable retries, at most one per collection.

use crate::config::RetryConfig;
use appstate_protocol::PatchType;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

struct ScheduledRetry {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Schedules retry actions with exponential backoff and jitter.
///
/// Must be used from within a tokio runtime.
pub struct RetryScheduler {
    config: RetryConfig,
    scheduled: Arc<Mutex<HashMap<PatchType, ScheduledRetry>>>,
    next_generation: AtomicU64,
    shut_down: AtomicBool,
}

impl RetryScheduler {
    /// Creates a scheduler.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            scheduled: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Runs `action` after the backoff delay for `attempt`.
    ///
    /// Returns `false` without scheduling once `attempt >= max_retries` or
    /// after [`shutdown`](Self::shutdown); the caller should then give up on
    /// the collection. A retry already scheduled for the collection is
    /// cancelled.
    pub fn schedule_retry<F, Fut>(&self, patch_type: PatchType, attempt: u32, action: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.shut_down.load(Ordering::SeqCst) || attempt >= self.config.max_retries {
            return false;
        }

        let delay = self.config.jittered_delay(attempt);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let scheduled = Arc::clone(&self.scheduled);

        let mut map = self.scheduled.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut map = scheduled.lock();
                match map.get(&patch_type) {
                    Some(entry) if entry.generation == generation => {
                        map.remove(&patch_type);
                    }
                    _ => return,
                }
            }
            action().await;
        });
        if let Some(previous) = map.insert(patch_type, ScheduledRetry { generation, handle }) {
            previous.handle.abort();
        }

        tracing::debug!(
            %patch_type,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );
        true
    }

    /// Cancels the collection's pending retry. Returns true if one existed.
    ///
    /// A retry whose action has already started is not interrupted.
    pub fn cancel_retry(&self, patch_type: PatchType) -> bool {
        match self.scheduled.lock().remove(&patch_type) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Returns true if a retry is waiting for the collection.
    pub fn has_pending(&self, patch_type: PatchType) -> bool {
        self.scheduled.lock().contains_key(&patch_type)
    }

    /// Number of waiting retries.
    pub fn pending_count(&self) -> usize {
        self.scheduled.lock().len()
    }

    /// Cancels every waiting retry and refuses new ones.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        for (_, entry) in self.scheduled.lock().drain() {
            entry.handle.abort();
        }
    }

    /// Returns true after [`shutdown`](Self::shutdown).
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        for (_, entry) in self.scheduled.lock().drain() {
            entry.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn config() -> RetryConfig {
        RetryConfig::new(3)
            .with_base_delay(Duration::from_secs(1))
            .with_jitter_max(Duration::ZERO)
    }

    fn counter_action(
        counter: &Arc<AtomicUsize>,
    ) -> impl FnOnce() -> std::future::Ready<()> + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_after_backoff_delay() {
        let scheduler = RetryScheduler::new(config());
        let runs = Arc::new(AtomicUsize::new(0));

        // attempt 1: 1s * 2^1
        assert!(scheduler.schedule_retry(PatchType::Regular, 1, counter_action(&runs)));
        assert!(scheduler.has_pending(PatchType::Regular));

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!scheduler.has_pending(PatchType::Regular));
    }

    #[tokio::test(start_paused = true)]
    async fn refuses_once_attempts_are_spent() {
        let scheduler = RetryScheduler::new(config());
        let runs = Arc::new(AtomicUsize::new(0));

        assert!(!scheduler.schedule_retry(PatchType::Regular, 3, counter_action(&runs)));
        assert!(!scheduler.has_pending(PatchType::Regular));
        assert!(!RetryScheduler::new(RetryConfig::no_retry()).schedule_retry(
            PatchType::Regular,
            0,
            counter_action(&runs)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn new_retry_replaces_previous() {
        let scheduler = RetryScheduler::new(config());
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        assert!(scheduler.schedule_retry(PatchType::Regular, 0, counter_action(&first)));
        assert!(scheduler.schedule_retry(PatchType::Regular, 0, counter_action(&second)));
        assert_eq!(scheduler.pending_count(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn collections_are_independent() {
        let scheduler = RetryScheduler::new(config());
        let runs = Arc::new(AtomicUsize::new(0));

        scheduler.schedule_retry(PatchType::Regular, 0, counter_action(&runs));
        scheduler.schedule_retry(PatchType::RegularLow, 0, counter_action(&runs));
        assert!(scheduler.cancel_retry(PatchType::Regular));
        assert!(!scheduler.cancel_retry(PatchType::Regular));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_everything() {
        let scheduler = RetryScheduler::new(config());
        let runs = Arc::new(AtomicUsize::new(0));

        for pt in PatchType::ALL {
            assert!(scheduler.schedule_retry(pt, 0, counter_action(&runs)));
        }
        scheduler.shutdown();
        assert!(scheduler.is_shut_down());
        assert_eq!(scheduler.pending_count(), 0);
        assert!(!scheduler.schedule_retry(PatchType::Regular, 0, counter_action(&runs)));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
