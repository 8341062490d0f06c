//! Sync scheduling - manual, on-change and periodic modes.
//!
//! The scheduler is a background task deciding *when* a pass runs:
//! on reconnect, on a timer, after local changes, when a retry falls due,
//! or on request. The pass itself is the coordinator's business.

use serde::{Deserialize, Serialize};
use std::future::pending;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use outbox_common::{Error, Result};

use crate::coordinator::SyncReport;
use crate::engine::SyncEngine;

/// Sync mode configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Sync on request and on reconnect only.
    #[default]
    Manual,
    /// Sync shortly after every local change.
    OnChange,
    /// Sync at regular intervals.
    Periodic { interval: Duration },
    /// Both on-change and periodic.
    Hybrid { interval: Duration },
}

impl SyncMode {
    fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Periodic { interval } | SyncMode::Hybrid { interval } => Some(*interval),
            SyncMode::Manual | SyncMode::OnChange => None,
        }
    }

    fn on_change(&self) -> bool {
        matches!(self, SyncMode::OnChange | SyncMode::Hybrid { .. })
    }
}

type SyncRequest = oneshot::Sender<Result<SyncReport>>;

/// Handle to a running scheduler. Dropping it stops the scheduler.
pub struct SchedulerHandle {
    request_tx: mpsc::Sender<SyncRequest>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Run a pass through the scheduler and wait for its report.
    ///
    /// # Errors
    /// - `Cancelled` if the scheduler is not running
    /// - Whatever the pass returns
    pub async fn request_sync(&self) -> Result<SyncReport> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send(response_tx)
            .await
            .map_err(|_| Error::Cancelled)?;
        response_rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Stop the scheduler, cancelling a running pass, and wait for it.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

/// Start the scheduler task for `engine`.
pub(crate) fn spawn(engine: SyncEngine) -> SchedulerHandle {
    let (request_tx, request_rx) = mpsc::channel(16);
    let shutdown = engine.inner.shutdown.child_token();
    let task = tokio::spawn(run(engine, request_rx, shutdown.clone()));
    SchedulerHandle {
        request_tx,
        shutdown,
        task,
    }
}

async fn run(
    engine: SyncEngine,
    mut request_rx: mpsc::Receiver<SyncRequest>,
    shutdown: CancellationToken,
) {
    let mode = engine.config().sync_mode.clone();
    let mut connectivity = engine.inner.connectivity.clone();
    let mut online = *connectivity.borrow_and_update();
    let mut watching = true;
    let mut periodic = mode.interval().map(|period| {
        let mut ticks = interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticks
    });

    info!("Sync scheduler started ({:?}, online: {})", mode, online);
    if online && mode != SyncMode::Manual {
        // Drain whatever a previous session left behind.
        sync(&engine, &shutdown, "startup").await;
    }

    loop {
        let retry_in = if online && mode != SyncMode::Manual {
            engine.next_retry_delay().await
        } else {
            None
        };

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Sync scheduler shutting down");
                break;
            }

            request = request_rx.recv() => {
                let Some(response_tx) = request else {
                    debug!("Scheduler handle dropped");
                    break;
                };
                let result = engine.sync_with(shutdown.child_token()).await;
                let _ = response_tx.send(result);
            }

            changed = connectivity.changed(), if watching => {
                if changed.is_err() {
                    watching = false;
                    continue;
                }
                let now_online = *connectivity.borrow_and_update();
                if now_online && !online {
                    info!("Back online");
                    online = true;
                    sync(&engine, &shutdown, "reconnect").await;
                } else if !now_online && online {
                    info!("Went offline");
                    online = false;
                    engine.cancel_pass();
                }
            }

            _ = tick(&mut periodic) => {
                if online {
                    sync(&engine, &shutdown, "periodic").await;
                }
            }

            _ = engine.inner.changed.notified(), if mode.on_change() => {
                if online {
                    sync(&engine, &shutdown, "change").await;
                }
            }

            _ = sleep_for(retry_in) => {
                sync(&engine, &shutdown, "retry").await;
            }
        }
    }
}

async fn sync(engine: &SyncEngine, shutdown: &CancellationToken, trigger: &str) {
    match engine.sync_with(shutdown.child_token()).await {
        Ok(report) => debug!("{} sync: {:?}", trigger, report),
        Err(Error::Offline) | Err(Error::Cancelled) => debug!("{} sync skipped", trigger),
        Err(e) => error!("{} sync failed: {}", trigger, e),
    }
}

async fn tick(periodic: &mut Option<Interval>) {
    match periodic {
        Some(ticks) => {
            ticks.tick().await;
        }
        None => pending().await,
    }
}

async fn sleep_for(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_intervals() {
        let minute = Duration::from_secs(60);
        assert_eq!(SyncMode::Manual.interval(), None);
        assert_eq!(SyncMode::Periodic { interval: minute }.interval(), Some(minute));
        assert!(SyncMode::Hybrid { interval: minute }.on_change());
        assert!(SyncMode::OnChange.on_change());
        assert!(!SyncMode::Periodic { interval: minute }.on_change());
    }

    #[test]
    fn test_mode_from_config_json() {
        let mode: SyncMode =
            serde_json::from_str(r#"{"Periodic": {"interval": {"secs": 30, "nanos": 0}}}"#)
                .unwrap();
        assert_eq!(
            mode,
            SyncMode::Periodic {
                interval: Duration::from_secs(30)
            }
        );
    }
}
