use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use fieldsync_core::config::parse_sync_config;
use fieldsync_core::models::{MutationId, SurveyId, SyncStatus, UploadQueueEntry};
use fieldsync_core::sync::{HttpRemoteStore, RetryPolicy};
use fieldsync_core::{
    DatabaseService, MutationQueue, RemoteStore, SurveyAvailabilityManager, SyncConfig,
    SyncOrchestrator, SyncReport,
};
use serde::Serialize;

use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct QueueItem {
    pub id: i64,
    pub mutation_type: String,
    pub kind: String,
    pub status: String,
    pub survey_id: String,
    pub survey_title: Option<String>,
    pub job_name: Option<String>,
    pub loi_id: String,
    pub loi_name: Option<String>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<i64>,
    pub updated_at: i64,
    pub relative_time: String,
}

#[derive(Debug, Serialize)]
pub struct SurveyItem {
    pub id: String,
    pub title: String,
    pub active: bool,
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("FIELDSYNC_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fieldsync")
        .join("fieldsync.db")
}

/// Read the optional JSON config file, then apply `FIELDSYNC_*` overrides.
pub fn load_config(config_path: Option<&Path>) -> Result<SyncConfig, CliError> {
    let config = match config_path {
        Some(path) => {
            let payload = std::fs::read_to_string(path)?;
            parse_sync_config(&payload).map_err(CliError::Config)?
        }
        None => SyncConfig::default(),
    };
    config.with_env_overrides().map_err(CliError::Config)
}

pub async fn open_database(path: &Path) -> Result<DatabaseService, CliError> {
    Ok(DatabaseService::open_path(path.to_path_buf()).await?)
}

pub async fn open_queue(path: &Path) -> Result<MutationQueue, CliError> {
    Ok(MutationQueue::new(open_database(path).await?))
}

pub fn remote_store(config: &SyncConfig) -> Result<Arc<dyn RemoteStore>, CliError> {
    let base_url = config.api_base_url().ok_or(CliError::RemoteNotConfigured)?;
    Ok(Arc::new(HttpRemoteStore::new(base_url)?))
}

pub fn build_orchestrator(
    queue: MutationQueue,
    config: &SyncConfig,
) -> Result<SyncOrchestrator, CliError> {
    let remote = remote_store(config)?;
    Ok(SyncOrchestrator::new(queue, remote, RetryPolicy::from(config)))
}

pub fn survey_manager(
    db: DatabaseService,
    config: &SyncConfig,
) -> Result<SurveyAvailabilityManager, CliError> {
    Ok(SurveyAvailabilityManager::new(db, remote_store(config)?))
}

/// Forget the persisted active survey if it is `survey_id`.
pub async fn clear_active_survey(
    db: &DatabaseService,
    survey_id: &SurveyId,
) -> Result<bool, CliError> {
    let mut settings = db.load_settings().await?;
    if settings.last_active_survey_id.as_ref() != Some(survey_id) {
        return Ok(false);
    }
    settings.last_active_survey_id = None;
    db.save_settings(&settings).await?;
    Ok(true)
}

pub fn normalize_survey_id(id: &str) -> Result<SurveyId, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptySurveyId)
    } else {
        Ok(SurveyId::new(trimmed))
    }
}

pub async fn ensure_mutation_exists(
    queue: &MutationQueue,
    id: i64,
) -> Result<MutationId, CliError> {
    let mutation_id = MutationId::new(id);
    if queue.get(mutation_id).await?.is_none() {
        return Err(CliError::MutationNotFound(id));
    }
    Ok(mutation_id)
}

/// Keep entries whose status is listed, or every non-completed entry when
/// no status is given.
pub fn filter_queue(
    entries: Vec<UploadQueueEntry>,
    statuses: &[SyncStatus],
    include_completed: bool,
) -> Vec<UploadQueueEntry> {
    entries
        .into_iter()
        .filter(|entry| {
            let status = entry.mutation.sync_status;
            if statuses.is_empty() {
                include_completed || status != SyncStatus::Completed
            } else {
                statuses.contains(&status)
            }
        })
        .collect()
}

pub fn queue_entry_to_item(entry: &UploadQueueEntry) -> QueueItem {
    let now_ms = Utc::now().timestamp_millis();
    let mutation = &entry.mutation;
    QueueItem {
        id: mutation.id.get(),
        mutation_type: mutation.mutation_type.to_string(),
        kind: mutation.kind().as_str().to_string(),
        status: mutation.sync_status.to_string(),
        survey_id: mutation.survey_id.to_string(),
        survey_title: entry.survey_title.clone(),
        job_name: entry.job_name.clone(),
        loi_id: mutation.loi_id.to_string(),
        loi_name: entry.loi_display_name.clone(),
        retry_count: mutation.retry_count,
        last_error: mutation.last_error.clone(),
        next_attempt_at: mutation.next_attempt_at,
        updated_at: mutation.updated_at,
        relative_time: format_relative_time(mutation.updated_at, now_ms),
    }
}

pub fn format_queue_lines(entries: &[UploadQueueEntry], now_ms: i64) -> Vec<String> {
    entries
        .iter()
        .map(|entry| {
            let mutation = &entry.mutation;
            let target = entry
                .loi_display_name
                .clone()
                .unwrap_or_else(|| mutation.loi_id.to_string());
            let target = truncate(&target, 24);
            let job = entry.job_name.as_deref().unwrap_or("-");
            let relative_time = format_relative_time(mutation.updated_at, now_ms);
            let line = format!(
                "{:>6}  {:<6}  {:<10}  {:<27}  {target:<24}  {:<16}  {relative_time}",
                mutation.id.get(),
                mutation.mutation_type.as_str(),
                mutation.kind().as_str(),
                mutation.sync_status.as_str(),
                truncate(job, 16),
            );

            let mut details = Vec::new();
            if mutation.retry_count > 0 {
                details.push(format!("retries={}", mutation.retry_count));
            }
            if let Some(at) = mutation.next_attempt_at.filter(|at| *at > now_ms) {
                details.push(format!("next attempt {}", format_sync_timestamp(at)));
            }
            if let Some(error) = &mutation.last_error {
                details.push(truncate(error, 72));
            }

            if details.is_empty() {
                line
            } else {
                format!("{line}\n        {}", details.join("  "))
            }
        })
        .collect()
}

pub fn format_report_lines(report: &SyncReport) -> Vec<String> {
    if report.is_idle() && !report.cancelled {
        return vec!["Nothing to sync".to_string()];
    }

    let mut lines = vec![format!(
        "Completed {} mutation(s) in {} batch(es); {} media upload(s)",
        report.completed, report.batches_applied, report.media_uploaded
    )];
    if report.batches_rejected > 0 {
        lines.push(format!("Rejected batches: {}", report.batches_rejected));
    }
    if report.retried > 0 {
        lines.push(format!("Will retry: {}", report.retried));
    }
    if report.failed > 0 {
        lines.push(format!("Failed: {}", report.failed));
    }
    if report.blocked > 0 {
        lines.push(format!("Blocked behind failures: {}", report.blocked));
    }
    if report.deferred > 0 {
        lines.push(format!("Deferred: {}", report.deferred));
    }
    if report.cancelled {
        lines.push("Pass was cancelled before it finished".to_string());
    }
    lines
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}

pub fn truncate(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = collapsed.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}
