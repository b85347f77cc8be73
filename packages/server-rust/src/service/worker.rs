//! Background worker for periodic and on-demand tasks.
//!
//! A `BackgroundWorker<R>` owns a spawned tokio task that feeds commands
//! from a bounded channel into a [`BackgroundRunnable`] and calls its tick
//! hook on a fixed interval.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Work executed by a [`BackgroundWorker`].
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    async fn run(&mut self, task: Self::Task);

    /// Called on every tick. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once after the loop exits. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Handle to a running background task.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker loop. The first tick fires one `interval` after
    /// start; ticks missed while a task runs are skipped, not bunched.
    pub fn start(mut runnable: R, interval: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(CHANNEL_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    task = rx.recv() => match task {
                        Some(t) => runnable.run(t).await,
                        None => break,
                    },
                    _ = ticker.tick() => runnable.on_tick().await,
                    _ = &mut shutdown_rx => break,
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Queues a task.
    ///
    /// # Errors
    ///
    /// Returns an error once the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("worker channel closed")),
            None => Err(anyhow::anyhow!("worker not running")),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signals the loop to exit and waits for `shutdown` to complete.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "background worker ended abnormally");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Default, Clone)]
    struct Counters {
        runs: Arc<AtomicU32>,
        ticks: Arc<AtomicU32>,
        shutdowns: Arc<AtomicU32>,
    }

    struct Probe(Counters);

    #[async_trait]
    impl BackgroundRunnable for Probe {
        type Task = u32;

        async fn run(&mut self, task: u32) {
            self.0.runs.fetch_add(task, Ordering::SeqCst);
        }

        async fn on_tick(&mut self) {
            self.0.ticks.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.0.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn tasks_run_and_shutdown_is_called_once() {
        let counters = Counters::default();
        let mut worker = BackgroundWorker::start(Probe(counters.clone()), Duration::from_secs(60));
        worker.submit(1).await.unwrap();
        worker.submit(2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counters.runs.load(Ordering::SeqCst), 3);
        assert!(worker.is_running());

        worker.stop().await;
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
        assert!(!worker.is_running());
        assert!(worker.submit(4).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_follow_the_interval() {
        let counters = Counters::default();
        let mut worker = BackgroundWorker::start(Probe(counters.clone()), Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 3);

        worker.stop().await;
    }
}
