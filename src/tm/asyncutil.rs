use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::task::JoinHandle;

static TASKS: OnceLock<TaskTracker> = OnceLock::new();

/// Process-wide tracker for background workers (monitor, web server, log
/// writer, shell).
pub fn tasks() -> &'static TaskTracker {
    TASKS.get_or_init(TaskTracker::default)
}

/// Counts live and total-started workers. The numbers feed the periodic
/// worker-stats log event, so a worker that never returns shows up as a
/// steadily growing alive count.
#[derive(Debug, Clone, Default)]
pub struct TaskTracker {
    counts: Arc<Counts>,
}

#[derive(Debug, Default)]
struct Counts {
    alive: AtomicUsize,
    started: AtomicUsize,
}

/// Registers a worker on creation and deregisters it on drop, so the alive
/// count stays right whether the worker returns, panics, or is cancelled.
struct Registration {
    counts: Arc<Counts>,
}

impl Registration {
    fn new(counts: &Arc<Counts>) -> Self {
        counts.started.fetch_add(1, Ordering::SeqCst);
        counts.alive.fetch_add(1, Ordering::SeqCst);
        Self {
            counts: Arc::clone(counts),
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.counts.alive.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TaskTracker {
    /// (workers alive now, workers started since boot)
    pub fn stats(&self) -> (usize, usize) {
        (
            self.counts.alive.load(Ordering::SeqCst),
            self.counts.started.load(Ordering::SeqCst),
        )
    }

    pub fn spawn<F, T>(&self, fut: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let reg = Registration::new(&self.counts);
        tokio::spawn(async move {
            let _reg = reg;
            fut.await
        })
    }

    pub fn spawn_blocking<F, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let reg = Registration::new(&self.counts);
        tokio::task::spawn_blocking(move || {
            let _reg = reg;
            f()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn wait_until_idle(tracker: &TaskTracker) {
        for _ in 0..100 {
            if tracker.stats().0 == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn stats_follow_worker_lifetimes() {
        let tracker = TaskTracker::default();
        let h = tracker.spawn(async { 7 });
        assert_eq!(tracker.stats().1, 1);
        assert_eq!(h.await.unwrap(), 7);
        wait_until_idle(&tracker).await;
        assert_eq!(tracker.stats(), (0, 1));
    }

    #[tokio::test]
    async fn blocking_workers_are_counted_too() {
        let tracker = TaskTracker::default();
        let h = tracker.spawn_blocking(|| 3);
        assert_eq!(h.await.unwrap(), 3);
        wait_until_idle(&tracker).await;
        assert_eq!(tracker.stats(), (0, 1));
    }
}
