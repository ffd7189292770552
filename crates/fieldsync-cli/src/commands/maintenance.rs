use std::path::Path;

use chrono::Utc;
use fieldsync_core::SyncConfig;

use crate::commands::common::{ensure_mutation_exists, open_queue};
use crate::error::CliError;

pub async fn run_recover(db_path: &Path) -> Result<(), CliError> {
    let queue = open_queue(db_path).await?;
    let recovered = queue.recover_stale().await?;
    println!("Recovered {recovered} mutation(s)");
    Ok(())
}

pub async fn run_purge(
    older_than_hours: Option<u64>,
    config: &SyncConfig,
    db_path: &Path,
) -> Result<(), CliError> {
    let retention_hours = older_than_hours.unwrap_or(config.completed_retention_hours);
    let cutoff = purge_cutoff(Utc::now().timestamp_millis(), retention_hours);

    let queue = open_queue(db_path).await?;
    let purged = queue.purge_completed(cutoff).await?;
    println!("Purged {purged} completed mutation(s)");
    Ok(())
}

pub async fn run_retry(id: i64, db_path: &Path) -> Result<(), CliError> {
    let queue = open_queue(db_path).await?;
    let mutation_id = ensure_mutation_exists(&queue, id).await?;
    let fresh = queue.retry_failed(mutation_id).await?;
    println!("{}", fresh.id);
    Ok(())
}

pub async fn run_discard(id: i64, db_path: &Path) -> Result<(), CliError> {
    let queue = open_queue(db_path).await?;
    let mutation_id = ensure_mutation_exists(&queue, id).await?;
    for removed in queue.discard(mutation_id).await? {
        println!("{}", removed.id);
    }
    Ok(())
}

/// Unix ms before which completed rows are purged.
pub fn purge_cutoff(now_ms: i64, retention_hours: u64) -> i64 {
    let retention_ms = i64::try_from(retention_hours.saturating_mul(3_600_000)).unwrap_or(i64::MAX);
    now_ms.saturating_sub(retention_ms)
}
