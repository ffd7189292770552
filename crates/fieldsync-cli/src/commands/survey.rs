use std::path::Path;

use fieldsync_core::db::{SqliteSurveyRepository, SurveyRepository};
use fieldsync_core::models::SurveyId;
use fieldsync_core::{DatabaseService, SyncConfig};

use crate::commands::common::{
    clear_active_survey, normalize_survey_id, open_database, survey_manager, SurveyItem,
};
use crate::error::CliError;

pub async fn run_survey_list(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let items = list_offline_surveys(&db).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if items.is_empty() {
        println!("No surveys available offline.");
        return Ok(());
    }

    for item in &items {
        let marker = if item.active { "*" } else { " " };
        println!("{marker} {:<24}  {}", item.id, item.title);
    }
    Ok(())
}

pub async fn run_survey_activate(
    id: &str,
    config: &SyncConfig,
    db_path: &Path,
) -> Result<(), CliError> {
    let survey_id = normalize_survey_id(id)?;
    let manager = survey_manager(open_database(db_path).await?, config)?;
    let survey = manager.activate(&survey_id).await?;
    println!("Activated {} ({})", survey.title, survey.id);
    Ok(())
}

pub async fn run_survey_deactivate(db_path: &Path) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let mut settings = db.load_settings().await?;
    match settings.last_active_survey_id.take() {
        Some(survey_id) => {
            db.save_settings(&settings).await?;
            println!("Deactivated {survey_id}");
        }
        None => println!("No survey is active."),
    }
    Ok(())
}

pub async fn run_survey_sync(
    id: &str,
    config: &SyncConfig,
    db_path: &Path,
) -> Result<(), CliError> {
    let survey_id = normalize_survey_id(id)?;
    let manager = survey_manager(open_database(db_path).await?, config)?;
    let survey = manager
        .sync_survey(&survey_id)
        .await?
        .ok_or_else(|| CliError::SurveyGone(survey_id.to_string()))?;
    println!("Synced {} ({})", survey.title, survey.id);
    Ok(())
}

pub async fn run_survey_remove(
    id: &str,
    config: &SyncConfig,
    db_path: &Path,
) -> Result<(), CliError> {
    let survey_id = normalize_survey_id(id)?;
    let db = open_database(db_path).await?;
    if clear_active_survey(&db, &survey_id).await? {
        tracing::info!("Deactivated {survey_id} before removal");
    }

    let manager = survey_manager(db, config)?;
    manager.remove_offline(&survey_id).await?;
    println!("{survey_id}");
    Ok(())
}

pub async fn list_offline_surveys(db: &DatabaseService) -> Result<Vec<SurveyItem>, CliError> {
    let active = db.load_settings().await?.last_active_survey_id;
    let surveys = db
        .read(|conn| SqliteSurveyRepository::new(conn).list_surveys())
        .await?;

    Ok(surveys
        .into_iter()
        .map(|(id, title)| survey_item(id, title, active.as_ref()))
        .collect())
}

fn survey_item(id: SurveyId, title: String, active: Option<&SurveyId>) -> SurveyItem {
    SurveyItem {
        active: active == Some(&id),
        id: id.to_string(),
        title,
    }
}
