//! Local store for fieldsync

mod connection;
mod migrations;
mod mutation_repository;
mod settings_repository;
mod survey_repository;

pub use connection::Database;
pub use mutation_repository::{MutationRepository, SqliteMutationRepository, StatusChange};
pub use settings_repository::{SettingsRepository, SqliteSettingsRepository};
pub use survey_repository::{SqliteSurveyRepository, SurveyRepository};

#[cfg(test)]
pub(crate) use survey_repository::tests::{sample_loi, sample_survey};
