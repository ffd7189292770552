//! fieldsync CLI - inspect and drive the offline mutation queue
//!
//! Lists queued survey changes, runs sync passes against the remote API, and
//! manages which surveys are available offline.

mod cli;
mod commands;
mod error;
#[cfg(test)]
mod tests;

use clap::Parser;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, SurveyCommands};
use crate::commands::common::{load_config, resolve_db_path};
use crate::commands::completions::run_completions;
use crate::commands::maintenance::{run_discard, run_purge, run_recover, run_retry};
use crate::commands::queue::run_queue;
use crate::commands::survey::{
    run_survey_activate, run_survey_deactivate, run_survey_list, run_survey_remove,
    run_survey_sync,
};
use crate::commands::sync::{run_sync, run_sync_watch};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let directive: Directive = "fieldsync=info"
        .parse()
        .map_err(|error| CliError::Config(format!("invalid log directive: {error}")))?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive))
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Queue { status, all, json } => run_queue(&status, all, json, &db_path).await?,
        Commands::Sync { watch: false } => run_sync(&db_path, &config).await?,
        Commands::Sync { watch: true } => run_sync_watch(&db_path, &config).await?,
        Commands::Recover => run_recover(&db_path).await?,
        Commands::Purge { older_than_hours } => {
            run_purge(older_than_hours, &config, &db_path).await?;
        }
        Commands::Retry { id } => run_retry(id, &db_path).await?,
        Commands::Discard { id } => run_discard(id, &db_path).await?,
        Commands::Survey { command } => match command {
            SurveyCommands::List { json } => run_survey_list(json, &db_path).await?,
            SurveyCommands::Activate { id } => run_survey_activate(&id, &config, &db_path).await?,
            SurveyCommands::Deactivate => run_survey_deactivate(&db_path).await?,
            SurveyCommands::Sync { id } => run_survey_sync(&id, &config, &db_path).await?,
            SurveyCommands::Remove { id } => run_survey_remove(&id, &config, &db_path).await?,
        },
        Commands::Completions { shell, output } => {
            run_completions(shell, output.as_deref())?;
        }
    }

    Ok(())
}
