//! Background task that drains the queue whenever the remote is reachable.
//!
//! The worker owns the only call site of [`SyncEngine::sync_pending`] in a
//! running application, so drains never overlap. It drains:
//! - once at start, if the remote is reachable,
//! - on every offline to online transition,
//! - on each interval tick while online,
//! - on [`SyncWorkerHandle::sync_now`] while online.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::engine::{SyncEngine, SyncReport};

enum Command {
    SyncNow(oneshot::Sender<Option<SyncReport>>),
    Stop,
}

pub struct SyncWorker;

impl SyncWorker {
    /// Spawns the worker on the current tokio runtime.
    ///
    /// `reachable` carries the connectivity signal (true = remote reachable).
    /// With `interval` set, the worker also drains periodically while online.
    pub fn spawn(
        engine: Arc<SyncEngine>,
        reachable: watch::Receiver<bool>,
        interval: Option<Duration>,
    ) -> SyncWorkerHandle {
        let (commands, rx) = mpsc::channel(8);
        let task = tokio::spawn(run(engine, reachable, interval, rx));
        SyncWorkerHandle { commands, task }
    }
}

/// Control handle for a running [`SyncWorker`].
pub struct SyncWorkerHandle {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl SyncWorkerHandle {
    /// Asks the worker to drain now and waits for the result.
    ///
    /// Returns `None` if the remote is currently unreachable or the worker
    /// has stopped.
    pub async fn sync_now(&self) -> Option<SyncReport> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(Command::SyncNow(reply)).await.ok()?;
        rx.await.ok().flatten()
    }

    /// Stops the worker, letting an in-flight drain finish first.
    pub async fn stop(self) {
        let _ = self.commands.send(Command::Stop).await;
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Sync worker task failed");
        }
    }
}

async fn run(
    engine: Arc<SyncEngine>,
    mut reachable: watch::Receiver<bool>,
    interval: Option<Duration>,
    mut commands: mpsc::Receiver<Command>,
) {
    let mut online = *reachable.borrow_and_update();
    let mut ticker = interval.map(|period| {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let mut signal_closed = false;

    tracing::debug!(online, "Sync worker started");
    if online {
        drain(&engine).await;
    }

    loop {
        tokio::select! {
            // Connectivity changes take priority over queued commands
            biased;

            changed = reachable.changed(), if !signal_closed => {
                if changed.is_err() {
                    // Sender gone: keep the last known state
                    signal_closed = true;
                    continue;
                }
                let now_online = *reachable.borrow_and_update();
                if now_online && !online {
                    tracing::info!("Remote reachable, syncing");
                    online = true;
                    drain(&engine).await;
                } else if !now_online && online {
                    tracing::info!("Remote unreachable, pausing sync");
                    online = false;
                }
            }
            _ = tick(&mut ticker) => {
                if online {
                    drain(&engine).await;
                }
            }
            command = commands.recv() => match command {
                Some(Command::SyncNow(reply)) => {
                    let report = if online { drain(&engine).await } else { None };
                    let _ = reply.send(report);
                }
                Some(Command::Stop) | None => break,
            },
        }
    }

    tracing::debug!("Sync worker stopped");
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn drain(engine: &SyncEngine) -> Option<SyncReport> {
    match engine.sync_pending().await {
        Ok(report) => Some(report),
        Err(e) => {
            tracing::debug!(error = %e, "Skipping drain");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::remote::MemoryRemote;
    use crate::store::LocalStore;
    use serde_json::json;

    async fn setup() -> (Arc<SyncEngine>, Arc<MemoryRemote>) {
        let store = LocalStore::try_open_in_memory().await.unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let engine = SyncEngine::new(store, remote.clone(), Catalog::permissive());
        (Arc::new(engine), remote)
    }

    async fn wait_for_rows(remote: &MemoryRemote, collection: &str, count: usize) -> bool {
        for _ in 0..100 {
            if remote.rows(collection).len() == count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_drains_at_start_when_online() {
        let (engine, remote) = setup().await;
        engine.enqueue("lote.upsert", json!({"id": "L1"})).await.unwrap();
        let (_tx, rx) = watch::channel(true);

        let handle = SyncWorker::spawn(engine.clone(), rx, None);

        // Commands are handled after the initial drain
        let report = handle.sync_now().await.unwrap();
        assert_eq!(report.total, 0);
        assert_eq!(remote.rows("lote").len(), 1);
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_waits_for_reachability() {
        let (engine, remote) = setup().await;
        engine.enqueue("lote.upsert", json!({"id": "L1"})).await.unwrap();
        let (tx, rx) = watch::channel(false);

        let handle = SyncWorker::spawn(engine.clone(), rx, None);
        assert!(handle.sync_now().await.is_none());
        assert!(remote.rows("lote").is_empty());

        tx.send(true).unwrap();
        assert!(handle.sync_now().await.is_some());
        assert_eq!(remote.rows("lote").len(), 1);

        tx.send(false).unwrap();
        engine.enqueue("lote.upsert", json!({"id": "L2"})).await.unwrap();
        assert!(handle.sync_now().await.is_none());
        assert_eq!(engine.queue().stats().await.pending, 1);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_interval_drains_while_online() {
        let (engine, remote) = setup().await;
        let (_tx, rx) = watch::channel(true);

        let handle = SyncWorker::spawn(engine.clone(), rx, Some(Duration::from_millis(20)));
        engine.enqueue("lote.upsert", json!({"id": "L1"})).await.unwrap();

        assert!(wait_for_rows(&remote, "lote", 1).await);
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_closed_signal_keeps_last_state() {
        let (engine, remote) = setup().await;
        let (tx, rx) = watch::channel(true);

        let handle = SyncWorker::spawn(engine.clone(), rx, None);
        drop(tx);

        engine.enqueue("lote.upsert", json!({"id": "L1"})).await.unwrap();
        let report = handle.sync_now().await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(remote.rows("lote").len(), 1);
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_ends_task() {
        let (engine, _remote) = setup().await;
        let (_tx, rx) = watch::channel(false);

        let handle = SyncWorker::spawn(engine.clone(), rx, Some(Duration::from_millis(5)));
        handle.stop().await;

        assert!(!engine.is_syncing());
        assert_eq!(Arc::strong_count(&engine), 1);
    }
}
