//! Supervision of a connection's subordinate tasks.
//!
//! Every long-running task spawned while handling an SSH connection (forward
//! dispatchers, the heartbeater, the registrar that starts it) is recorded
//! in the connection's [`ProcessSet`].  When the connection ends, for any
//! reason, [`ProcessSet::shutdown`] cancels and then awaits every recorded
//! task; nothing is allowed to outlive its connection.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

struct Subordinate {
    name: &'static str,
    cancel: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

#[derive(Default)]
struct Inner {
    closed: bool,
    procs: Vec<Subordinate>,
}

/// Shared handle to one connection's subordinate tasks.
#[derive(Clone, Default)]
pub struct ProcessSet {
    inner: Arc<Mutex<Inner>>,
}

impl ProcessSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a supervised task.  The task receives a cancellation token in
    /// place of a signal channel: on shutdown it must finish in-flight work,
    /// release its resources, and return.
    ///
    /// Spawning after shutdown has begun is permitted (the registrar starts
    /// the heartbeater while teardown may already be underway); such a task
    /// starts with its token already cancelled and is still awaited.
    pub async fn spawn<F, Fut>(&self, name: &'static str, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let cancel = CancellationToken::new();

        let mut inner = self.inner.lock().await;
        if inner.closed {
            cancel.cancel();
        }
        let handle = tokio::spawn(f(cancel.clone()));
        inner.procs.push(Subordinate {
            name,
            cancel,
            handle,
        });
    }

    /// Cancel every subordinate, then await each one, logging its outcome.
    /// Loops until the set stays empty so tasks spawned during teardown are
    /// also joined.
    pub async fn shutdown(&self) {
        self.inner.lock().await.closed = true;

        loop {
            let batch: Vec<Subordinate> = {
                let mut inner = self.inner.lock().await;
                inner.procs.drain(..).collect()
            };

            if batch.is_empty() {
                return;
            }

            for proc in &batch {
                debug!(process = proc.name, "interrupting");
                proc.cancel.cancel();
            }

            for proc in batch {
                match proc.handle.await {
                    Ok(Ok(())) => debug!(process = proc.name, "process exited successfully"),
                    Ok(Err(e)) => {
                        error!(process = proc.name, error = %e, "process exited with failure")
                    }
                    Err(e) => error!(process = proc.name, error = %e, "process panicked"),
                }
            }
        }
    }

    /// Number of currently recorded subordinates.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.procs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.procs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn shutdown_joins_every_subordinate() {
        let set = ProcessSet::new();
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let finished = Arc::clone(&finished);
            set.spawn("worker", move |cancel| async move {
                cancel.cancelled().await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        }

        assert_eq!(set.len().await, 3);
        set.shutdown().await;
        assert_eq!(finished.load(Ordering::SeqCst), 3);
        assert!(set.is_empty().await);
    }

    #[tokio::test]
    async fn tasks_spawned_during_shutdown_are_joined() {
        let set = ProcessSet::new();
        let late_finished = Arc::new(AtomicUsize::new(0));

        {
            let set2 = set.clone();
            let late_finished = Arc::clone(&late_finished);
            set.spawn("parent", move |cancel| async move {
                cancel.cancelled().await;
                let late_finished = Arc::clone(&late_finished);
                set2.spawn("late-child", move |cancel| async move {
                    cancel.cancelled().await;
                    late_finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await;
                Ok(())
            })
            .await;
        }

        set.shutdown().await;
        assert_eq!(late_finished.load(Ordering::SeqCst), 1);
        assert!(set.is_empty().await);
    }

    #[tokio::test]
    async fn failing_subordinates_do_not_abort_shutdown() {
        let set = ProcessSet::new();

        set.spawn("broken", |_cancel| async { anyhow::bail!("boom") })
            .await;
        set.spawn("fine", |cancel| async move {
            cancel.cancelled().await;
            Ok(())
        })
        .await;

        set.shutdown().await;
        assert!(set.is_empty().await);
    }
}
