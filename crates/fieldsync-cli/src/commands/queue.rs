use std::path::Path;

use chrono::Utc;
use fieldsync_core::models::SyncStatus;

use crate::commands::common::{
    filter_queue, format_queue_lines, open_queue, queue_entry_to_item, QueueItem,
};
use crate::error::CliError;

pub async fn run_queue(
    statuses: &[SyncStatus],
    include_completed: bool,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let queue = open_queue(db_path).await?;
    let entries = filter_queue(queue.upload_queue().await?, statuses, include_completed);

    if as_json {
        let json_items = entries
            .iter()
            .map(queue_entry_to_item)
            .collect::<Vec<QueueItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    for line in format_queue_lines(&entries, Utc::now().timestamp_millis()) {
        println!("{line}");
    }
    Ok(())
}
