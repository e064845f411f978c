use crate::models::CleanupStats;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct CleanupRetry {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for CleanupRetry {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff: Duration::from_millis(200),
        }
    }
}

impl CleanupRetry {
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_backoff.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

#[derive(Default)]
struct CleanupState {
    queued: AtomicU64,
    removed: AtomicU64,
    failed: AtomicU64,
    pending: AtomicU64,
    settled: Notify,
}

/// Background deletion of orphaned upload files. Scheduling never blocks
/// and never fails the caller.
#[derive(Clone)]
pub struct CleanupQueue {
    sender: mpsc::UnboundedSender<PathBuf>,
    state: Arc<CleanupState>,
}

impl CleanupQueue {
    /// Spawns the worker task; requires a tokio runtime.
    pub fn start(retry: CleanupRetry) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let state = Arc::new(CleanupState::default());
        tokio::spawn(run_worker(receiver, state.clone(), retry));
        Self { sender, state }
    }

    pub fn schedule(&self, path: PathBuf) {
        self.state.queued.fetch_add(1, Ordering::SeqCst);
        self.state.pending.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(path = %path.display(), "file scheduled for cleanup");

        if let Err(mpsc::error::SendError(path)) = self.sender.send(path) {
            tracing::warn!(path = %path.display(), "cleanup worker unavailable, removing directly");
            let state = self.state.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn_blocking(move || remove_now(&state, &path));
                }
                // Runtime already gone during shutdown.
                Err(_) => remove_now(&state, &path),
            }
        }
    }

    pub fn stats(&self) -> CleanupStats {
        CleanupStats {
            queued: self.state.queued.load(Ordering::SeqCst),
            removed: self.state.removed.load(Ordering::SeqCst),
            failed: self.state.failed.load(Ordering::SeqCst),
            pending: self.state.pending.load(Ordering::SeqCst),
        }
    }

    /// Resolves once every scheduled deletion has finished.
    pub async fn settled(&self) {
        loop {
            let notified = self.state.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

fn remove_now(state: &CleanupState, path: &Path) {
    let outcome = match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    };
    record_outcome(state, path, outcome);
}

async fn run_worker(mut receiver: mpsc::UnboundedReceiver<PathBuf>, state: Arc<CleanupState>, retry: CleanupRetry) {
    while let Some(path) = receiver.recv().await {
        let outcome = remove_with_retry(&path, retry).await;
        record_outcome(&state, &path, outcome);
    }
}

async fn remove_with_retry(path: &Path, retry: CleanupRetry) -> std::io::Result<()> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match tokio::fs::remove_file(path).await {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) if attempt >= retry.max_attempts => return Err(err),
            Err(err) => {
                let delay = retry.delay_for(attempt);
                tracing::debug!(path = %path.display(), attempt, error = %err, "file removal failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn record_outcome(state: &CleanupState, path: &Path, outcome: std::io::Result<()>) {
    match outcome {
        Ok(()) => {
            state.removed.fetch_add(1, Ordering::SeqCst);
            tracing::info!(path = %path.display(), "orphaned file removed");
        }
        Err(error) => {
            state.failed.fetch_add(1, Ordering::SeqCst);
            tracing::error!(path = %path.display(), error = %error, "failed to remove orphaned file");
        }
    }
    state.pending.fetch_sub(1, Ordering::SeqCst);
    state.settled.notify_waiters();
}

#[cfg(test)]
mod tests {
    use super::{CleanupQueue, CleanupRetry, CleanupState};
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio::time::Duration;

    fn queue_without_worker() -> CleanupQueue {
        let (sender, receiver) = mpsc::unbounded_channel();
        drop(receiver);
        CleanupQueue {
            sender,
            state: Arc::new(CleanupState::default()),
        }
    }

    fn fast_retry() -> CleanupRetry {
        CleanupRetry {
            max_attempts: 2,
            base_backoff: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn removes_files_and_counts_missing_as_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let existing = dir.path().join("event-1.png");
        std::fs::write(&existing, b"png").expect("write file");

        let queue = CleanupQueue::start(fast_retry());
        queue.schedule(existing.clone());
        queue.schedule(dir.path().join("already-gone.png"));
        queue.settled().await;

        assert!(!existing.exists());
        let stats = queue.stats();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.removed, 2);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn persistent_failures_are_counted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let directory = dir.path().join("not-a-file");
        std::fs::create_dir(&directory).expect("create dir");

        let queue = CleanupQueue::start(fast_retry());
        queue.schedule(directory.clone());
        queue.settled().await;

        assert!(directory.exists());
        assert_eq!(queue.stats().failed, 1);
        assert_eq!(queue.stats().pending, 0);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let retry = CleanupRetry::default();
        assert_eq!(retry.delay_for(1), Duration::from_millis(200));
        assert_eq!(retry.delay_for(3), Duration::from_millis(800));
    }

    #[tokio::test]
    async fn stopped_worker_falls_back_to_blocking_pool() {
        let dir = tempfile::tempdir().expect("tempdir");
        let orphan = dir.path().join("doc-1.pdf");
        std::fs::write(&orphan, b"pdf").expect("write file");

        let queue = queue_without_worker();
        queue.schedule(orphan.clone());
        queue.settled().await;

        assert!(!orphan.exists());
        assert_eq!(queue.stats().removed, 1);
        assert_eq!(queue.stats().pending, 0);
    }

    #[test]
    fn removes_directly_when_no_runtime_is_left() {
        let dir = tempfile::tempdir().expect("tempdir");
        let orphan = dir.path().join("event-9.png");
        std::fs::write(&orphan, b"png").expect("write file");

        let queue = queue_without_worker();
        queue.schedule(orphan.clone());

        assert!(!orphan.exists());
        assert_eq!(queue.stats().removed, 1);
    }
}
