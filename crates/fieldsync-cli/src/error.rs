use std::io;

use fieldsync_core::ActivationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] fieldsync_core::Error),
    #[error(transparent)]
    Activation(#[from] ActivationError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Survey ID cannot be empty")]
    EmptySurveyId,
    #[error("Mutation not found: {0}")]
    MutationNotFound(i64),
    #[error("Survey {0} does not exist remotely")]
    SurveyGone(String),
    #[error(
        "Remote API is not configured. Set api_base_url in the config file or FIELDSYNC_API_BASE_URL."
    )]
    RemoteNotConfigured,
}
