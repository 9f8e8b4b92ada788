//! Background task that decides when the engine syncs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use super::{SyncEngine, SyncOutcome};
use crate::remote::RemoteApi;
use crate::util::unix_millis_now;

const TRIGGER_CAPACITY: usize = 8;

/// Wait before re-running for a backoff deadline that is already due
const OVERDUE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// On-demand request to the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// "Sync now"
    Now,
    /// Re-queue failed operations, then sync
    RetryFailed,
}

/// Handle to a running scheduler task.
pub struct SchedulerHandle {
    triggers: mpsc::Sender<SyncTrigger>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Queue a trigger; `false` once the scheduler has stopped.
    pub async fn trigger(&self, trigger: SyncTrigger) -> bool {
        self.triggers.send(trigger).await.is_ok()
    }

    /// Stop the scheduler and wait for the current cycle to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(error) = self.task.await {
            tracing::warn!("Sync scheduler ended abnormally: {error}");
        }
    }
}

/// Run the engine on reconnect, every `interval` while online (zero
/// disables the timer), when the earliest retry backoff expires, and on
/// demand.
pub fn spawn_sync_scheduler<A>(engine: Arc<SyncEngine<A>>, interval: Duration) -> SchedulerHandle
where
    A: RemoteApi + 'static,
{
    let (triggers, mut trigger_rx) = mpsc::channel(TRIGGER_CAPACITY);
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let mut network = engine.network();

    let task = tokio::spawn(async move {
        let mut ticker = (!interval.is_zero()).then(|| {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let mut was_online = network.borrow_and_update().is_online();

        if was_online {
            run(&engine, "startup").await;
        }

        loop {
            let retry_at = if engine.is_online() {
                retry_deadline(&engine).await
            } else {
                None
            };

            let reason = tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
                trigger = trigger_rx.recv() => match trigger {
                    Some(SyncTrigger::Now) => "manual trigger",
                    Some(SyncTrigger::RetryFailed) => {
                        if let Err(error) = engine.retry_failed_operations().await {
                            tracing::error!("Failed to re-queue failed operations: {error}");
                        }
                        "retry"
                    }
                    None => break,
                },
                changed = network.changed() => {
                    if changed.is_err() {
                        tracing::debug!("Network monitor dropped; stopping scheduler");
                        break;
                    }
                    let online = network.borrow_and_update().is_online();
                    if let Err(error) = engine.refresh_status().await {
                        tracing::warn!("Failed to refresh sync status: {error}");
                    }
                    let reconnected = online && !was_online;
                    was_online = online;
                    if !reconnected {
                        continue;
                    }
                    "reconnect"
                }
                () = tick(ticker.as_mut()) => {
                    if !engine.is_online() {
                        continue;
                    }
                    "interval"
                }
                () = wait_until(retry_at) => "backoff retry",
            };

            run(&engine, reason).await;
        }
        tracing::debug!("Sync scheduler stopped");
    });

    SchedulerHandle {
        triggers,
        shutdown,
        task,
    }
}

async fn tick(ticker: Option<&mut Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// When the earliest backed-off operation becomes due
async fn retry_deadline<A: RemoteApi>(engine: &SyncEngine<A>) -> Option<Instant> {
    let due_at = match engine.queue().next_attempt_at().await {
        Ok(due_at) => due_at?,
        Err(error) => {
            tracing::warn!("Failed to read retry deadlines: {error}");
            return None;
        }
    };

    let wait = match u64::try_from(due_at.saturating_sub(unix_millis_now())) {
        Ok(millis) if millis > 0 => Duration::from_millis(millis),
        _ => OVERDUE_RETRY_DELAY,
    };
    Some(Instant::now() + wait)
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

async fn run<A: RemoteApi>(engine: &SyncEngine<A>, reason: &str) {
    tracing::debug!("Sync triggered by {reason}");
    match engine.sync_pending_operations().await {
        Ok(SyncOutcome::Completed(_) | SyncOutcome::AlreadyRunning) => {}
        Ok(SyncOutcome::Offline) => {
            tracing::debug!("Skipping sync while offline");
        }
        Err(error) => {
            tracing::error!("Sync cycle failed: {error}");
        }
    }
}
