use std::path::Path;

use fieldsync_core::{SyncConfig, SyncState, SyncWorker};

use crate::commands::common::{build_orchestrator, format_report_lines, open_queue};
use crate::error::CliError;

pub async fn run_sync(db_path: &Path, config: &SyncConfig) -> Result<(), CliError> {
    let queue = open_queue(db_path).await?;
    let orchestrator = build_orchestrator(queue.clone(), config)?;

    let recovered = queue.recover_stale().await?;
    if recovered > 0 {
        println!("Recovered {recovered} interrupted mutation(s)");
    }

    let report = orchestrator.sync_pass().await?;
    for line in format_report_lines(&report) {
        println!("{line}");
    }
    Ok(())
}

/// Run the background worker until Ctrl-C, printing state changes.
pub async fn run_sync_watch(db_path: &Path, config: &SyncConfig) -> Result<(), CliError> {
    let queue = open_queue(db_path).await?;
    let orchestrator = build_orchestrator(queue, config)?;
    let worker = SyncWorker::spawn(orchestrator, config, true);
    let mut state = worker.subscribe_state();
    worker.sync_now();

    match config.sync_interval() {
        Some(interval) => println!("Syncing every {}s; press Ctrl-C to stop", interval.as_secs()),
        None => println!("Periodic sync is disabled; press Ctrl-C to stop"),
    }

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                if current != SyncState::Syncing {
                    println!("{current}");
                }
            }
        }
    }

    worker.shutdown().await;
    println!("Stopped");
    Ok(())
}
