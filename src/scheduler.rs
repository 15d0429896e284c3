//! One-shot delayed actions (`/delayoff`). Tasks still sleeping at shutdown
//! are dropped without running.

use log::debug;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Clone)]
pub struct Scheduler {
    tracker: TaskTracker,
    token: CancellationToken,
}

impl Scheduler {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            tracker: TaskTracker::new(),
            token,
        }
    }

    /// Run `task` once after `delay`. Nothing in `task` executes before then,
    /// so a device session it opens is opened at fire time.
    pub fn schedule<F>(&self, delay: Duration, label: String, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => debug!("Dropping scheduled {}", label),
                _ = tokio::time::sleep(delay) => {
                    debug!("Running scheduled {}", label);
                    task.await;
                }
            }
        });
    }

    /// Number of scheduled tasks not yet finished.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Wait for in-flight tasks after the shutdown token fired.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let scheduler = Scheduler::new(CancellationToken::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        scheduler.schedule(Duration::from_secs(5), "test".into(), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_tasks_never_run() {
        let token = CancellationToken::new();
        let scheduler = Scheduler::new(token.clone());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        scheduler.schedule(Duration::from_secs(10), "test".into(), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        token.cancel();
        scheduler.shutdown().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
