use std::collections::BTreeMap;

use clap::CommandFactory;
use fieldsync_core::models::{
    JobId, LoiChange, LoiId, Mutation, MutationId, MutationPayload, MutationType, SurveyId,
    SyncStatus, UploadQueueEntry, UserId,
};
use fieldsync_core::{SyncConfig, SyncReport};

use crate::cli::{Cli, CompletionShell};
use crate::commands::common::{
    filter_queue, format_queue_lines, format_relative_time, format_report_lines,
    format_sync_timestamp, load_config, normalize_survey_id, open_database, queue_entry_to_item,
    remote_store, truncate,
};
use crate::commands::completions::{load_hint, run_completions};
use crate::commands::maintenance::{purge_cutoff, run_discard, run_retry};
use crate::commands::survey::list_offline_surveys;
use crate::error::CliError;

fn entry(id: i64, status: SyncStatus) -> UploadQueueEntry {
    UploadQueueEntry {
        mutation: Mutation {
            id: MutationId::new(id),
            mutation_type: MutationType::Create,
            sync_status: status,
            survey_id: SurveyId::from("s1"),
            loi_id: LoiId::from("l1"),
            user_id: UserId::from("u1"),
            client_timestamp: 1_000,
            retry_count: 0,
            last_error: None,
            next_attempt_at: None,
            updated_at: 1_000,
            payload: MutationPayload::LocationOfInterest(LoiChange {
                job_id: JobId::from("j1"),
                geometry: None,
                custom_id: None,
                properties: BTreeMap::new(),
            }),
        },
        survey_title: Some("Forest plots".to_string()),
        job_name: Some("Tree census".to_string()),
        loi_display_name: Some("Plot 7".to_string()),
    }
}

#[test]
fn cli_definition_is_consistent() {
    Cli::command().debug_assert();
}

#[test]
fn format_relative_time_units() {
    let now = 10_000_000;
    assert_eq!(format_relative_time(now - 30_000, now), "just now");
    assert_eq!(format_relative_time(now - 120_000, now), "2m ago");
    assert_eq!(format_relative_time(now - 2 * 60 * 60_000, now), "2h ago");
}

#[test]
fn format_sync_timestamp_returns_utc_label() {
    assert_eq!(format_sync_timestamp(0), "1970-01-01 00:00:00 UTC");
}

#[test]
fn truncate_collapses_whitespace_and_adds_ellipsis() {
    assert_eq!(truncate("  short \n text ", 20), "short text");
    assert_eq!(
        truncate("This is a very long sentence that should be shortened", 20),
        "This is a very lo..."
    );
}

#[test]
fn normalize_survey_id_trims_and_rejects_empty() {
    assert_eq!(normalize_survey_id("  s1 ").unwrap(), SurveyId::from("s1"));
    assert!(matches!(
        normalize_survey_id(" \t "),
        Err(CliError::EmptySurveyId)
    ));
}

#[test]
fn filter_queue_hides_completed_unless_requested() {
    let entries = || {
        vec![
            entry(1, SyncStatus::Completed),
            entry(2, SyncStatus::Pending),
            entry(3, SyncStatus::Failed),
        ]
    };

    let ids = |entries: Vec<UploadQueueEntry>| {
        entries
            .iter()
            .map(|entry| entry.mutation.id.get())
            .collect::<Vec<_>>()
    };

    assert_eq!(ids(filter_queue(entries(), &[], false)), vec![2, 3]);
    assert_eq!(ids(filter_queue(entries(), &[], true)), vec![1, 2, 3]);
    assert_eq!(
        ids(filter_queue(entries(), &[SyncStatus::Failed], false)),
        vec![3]
    );
}

#[test]
fn queue_lines_show_retry_details() {
    let mut failing = entry(42, SyncStatus::Pending);
    failing.mutation.retry_count = 2;
    failing.mutation.last_error = Some("connection reset".to_string());
    failing.mutation.next_attempt_at = Some(5_000);

    let rendered = format_queue_lines(&[entry(1, SyncStatus::Pending), failing], 2_000);
    assert_eq!(rendered.len(), 2);
    assert!(!rendered[0].contains('\n'));
    assert!(rendered[0].contains("Plot 7"));
    assert!(rendered[0].contains("Tree census"));

    assert!(rendered[1].contains("    42  CREATE"));
    assert!(rendered[1].contains("PENDING"));
    assert!(rendered[1].contains("retries=2"));
    assert!(rendered[1].contains("next attempt 1970-01-01 00:00:05 UTC"));
    assert!(rendered[1].contains("connection reset"));
}

#[test]
fn queue_item_carries_display_metadata() {
    let item = queue_entry_to_item(&entry(7, SyncStatus::MediaUploadAwaitingRetry));
    assert_eq!(item.id, 7);
    assert_eq!(item.status, "MEDIA_UPLOAD_AWAITING_RETRY");
    assert_eq!(item.survey_title.as_deref(), Some("Forest plots"));
    assert_eq!(item.loi_name.as_deref(), Some("Plot 7"));
}

#[test]
fn report_lines_summarize_the_pass() {
    assert_eq!(
        format_report_lines(&SyncReport::default()),
        vec!["Nothing to sync".to_string()]
    );

    let report = SyncReport {
        batches_applied: 1,
        completed: 3,
        failed: 1,
        cancelled: true,
        ..SyncReport::default()
    };
    let lines = format_report_lines(&report);
    assert_eq!(
        lines[0],
        "Completed 3 mutation(s) in 1 batch(es); 0 media upload(s)"
    );
    assert!(lines.contains(&"Failed: 1".to_string()));
    assert!(lines.contains(&"Pass was cancelled before it finished".to_string()));
}

#[test]
fn purge_cutoff_subtracts_retention() {
    assert_eq!(purge_cutoff(10 * 3_600_000, 4), 6 * 3_600_000);
    assert_eq!(purge_cutoff(0, u64::MAX), -i64::MAX);
}

#[test]
fn load_config_reads_json_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.json");
    std::fs::write(&path, r#"{"max_attempts": 3, "sync_interval_secs": 0}"#).unwrap();

    let config = load_config(Some(&path)).unwrap();
    assert_eq!(config.max_attempts, 3);
    assert!(config.sync_interval().is_none());
}

#[test]
fn load_config_rejects_unknown_fields() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.json");
    std::fs::write(&path, r#"{"turso_url": "libsql://example"}"#).unwrap();

    assert!(matches!(load_config(Some(&path)), Err(CliError::Config(_))));
}

#[test]
fn remote_store_requires_api_base_url() {
    let config = SyncConfig {
        api_base_url: None,
        ..SyncConfig::default()
    };
    assert!(matches!(
        remote_store(&config),
        Err(CliError::RemoteNotConfigured)
    ));

    let config = SyncConfig {
        api_base_url: Some("https://api.example.com/".to_string()),
        ..SyncConfig::default()
    };
    assert!(remote_store(&config).is_ok());
}

#[test]
fn completions_write_to_output_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fieldsync.bash");

    run_completions(CompletionShell::Bash, Some(&path)).unwrap();
    let script = std::fs::read_to_string(&path).unwrap();
    assert!(script.contains("fieldsync"));
    assert!(script.contains("discard"));
    assert!(script.contains("survey"));
}

#[test]
fn completion_load_hint_matches_shell() {
    let path = std::path::Path::new("/tmp/fieldsync.ps1");
    assert_eq!(
        load_hint(CompletionShell::PowerShell, path),
        ". /tmp/fieldsync.ps1"
    );
    assert_eq!(
        load_hint(CompletionShell::Zsh, path),
        "source /tmp/fieldsync.ps1"
    );
    assert_eq!(
        load_hint(CompletionShell::Fish, path),
        "source /tmp/fieldsync.ps1"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn fresh_database_has_no_offline_surveys() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("nested").join("fieldsync.db");

    let db = open_database(&db_path).await.unwrap();
    assert!(list_offline_surveys(&db).await.unwrap().is_empty());
    assert!(db_path.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_and_discard_reject_unknown_ids() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("fieldsync.db");

    assert!(matches!(
        run_retry(99, &db_path).await,
        Err(CliError::MutationNotFound(99))
    ));
    assert!(matches!(
        run_discard(99, &db_path).await,
        Err(CliError::MutationNotFound(99))
    ));
}
