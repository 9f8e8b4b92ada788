use std::path::Path;
use std::sync::Arc;

use careunity_core::network::run_probe_loop;
use careunity_core::status::{SyncEvent, SyncReport};
use careunity_core::sync::{spawn_sync_scheduler, SyncOutcome};
use tokio::sync::{broadcast, watch};

use crate::commands::common::{load_config, open_session};
use crate::error::CliError;

pub async fn run_sync(db_path: &Path, config_path: &Path) -> Result<(), CliError> {
    let config = load_config(config_path)?;
    let session = open_session(db_path, config).await?;

    if !session.check_reachability().await {
        let pending = session.engine.status().snapshot().pending_operations_count;
        println!(
            "API unreachable at {}; {pending} operations stay queued",
            session.probe.url()
        );
        return Ok(());
    }

    match session.engine.sync_pending_operations().await? {
        SyncOutcome::Completed(report) => println!("{}", format_report(&report)),
        SyncOutcome::AlreadyRunning => println!("Sync already running"),
        SyncOutcome::Offline => println!("Offline; nothing sent"),
    }

    let snapshot = session.engine.status().snapshot();
    if snapshot.conflict_count > 0 {
        println!(
            "{} conflicts await a decision (see `careunity conflicts list`)",
            snapshot.conflict_count
        );
    }
    Ok(())
}

/// Probe, sync on reconnect and on the configured interval until Ctrl-C.
pub async fn run_watch(db_path: &Path, config_path: &Path) -> Result<(), CliError> {
    let config = load_config(config_path)?;
    let probe_interval = config.probe_interval();
    let sync_interval = config.sync_interval();
    let session = open_session(db_path, config).await?;
    session.check_reachability().await;

    let (shutdown, shutdown_rx) = watch::channel(false);
    let probe_task = tokio::spawn(run_probe_loop(
        session.monitor.clone(),
        session.probe.clone(),
        probe_interval,
        shutdown_rx,
    ));
    let mut events = session.engine.status().events();
    let scheduler = spawn_sync_scheduler(Arc::clone(&session.engine), sync_interval);
    println!("Watching for changes (Ctrl-C to stop)");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => println!("{}", format_event(&event)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Missed {skipped} sync events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    let _ = shutdown.send(true);
    scheduler.shutdown().await;
    if let Err(error) = probe_task.await {
        tracing::warn!("Probe loop ended abnormally: {error}");
    }
    Ok(())
}

pub fn format_report(report: &SyncReport) -> String {
    let mut line = format!(
        "Synced {}, conflicts {}, deferred {}, retrying {}, failed {}",
        report.synced, report.conflicts, report.deferred, report.retried, report.failed
    );
    if report.aborted {
        line.push_str(" (connection lost; the rest stays queued)");
    }
    line
}

pub fn format_event(event: &SyncEvent) -> String {
    match event {
        SyncEvent::SyncStarted => "sync started".to_string(),
        SyncEvent::SyncCompleted(report) => format!("sync completed: {}", format_report(report)),
        SyncEvent::SyncFailed(message) => format!("sync failed: {message}"),
        SyncEvent::ConflictDetected {
            conflict_id,
            entity,
            strategy,
        } => format!("conflict {conflict_id} on {entity} ({strategy})"),
        SyncEvent::ConflictResolved {
            conflict_id,
            entity,
            resolution,
        } => format!("conflict {conflict_id} on {entity} resolved: {resolution}"),
        SyncEvent::OperationFailed {
            operation_id,
            entity,
            error,
        } => format!("operation {operation_id} on {entity} failed: {error}"),
    }
}
