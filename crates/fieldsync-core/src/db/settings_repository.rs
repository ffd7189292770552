//! Local values repository implementation

use crate::error::Result;
use crate::models::{LocalSettings, SurveyId, UserId};
use rusqlite::{params, Connection, OptionalExtension};

const LAST_ACTIVE_SURVEY_ID: &str = "last_active_survey_id";
const LAST_USER_ID: &str = "last_user_id";

/// Trait for process-scoped local state storage
pub trait SettingsRepository {
    /// Load local settings from the database
    fn load(&self) -> Result<LocalSettings>;

    /// Save local settings to the database
    fn save(&self, settings: &LocalSettings) -> Result<()>;
}

/// `SQLite` implementation of `SettingsRepository`
pub struct SqliteSettingsRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteSettingsRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn get_value(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM local_values WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_value(&self, key: &str, value: Option<&str>) -> Result<()> {
        match value {
            Some(value) => {
                self.conn.execute(
                    "INSERT INTO local_values (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, value],
                )?;
            }
            None => {
                self.conn
                    .execute("DELETE FROM local_values WHERE key = ?1", params![key])?;
            }
        }
        Ok(())
    }
}

impl SettingsRepository for SqliteSettingsRepository<'_> {
    fn load(&self) -> Result<LocalSettings> {
        Ok(LocalSettings {
            last_active_survey_id: self.get_value(LAST_ACTIVE_SURVEY_ID)?.map(SurveyId::new),
            last_user_id: self.get_value(LAST_USER_ID)?.map(UserId::new),
        })
    }

    fn save(&self, settings: &LocalSettings) -> Result<()> {
        self.set_value(
            LAST_ACTIVE_SURVEY_ID,
            settings.last_active_survey_id.as_ref().map(SurveyId::as_str),
        )?;
        self.set_value(
            LAST_USER_ID,
            settings.last_user_id.as_ref().map(UserId::as_str),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_load_default_settings() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteSettingsRepository::new(db.connection());

        assert_eq!(repo.load().unwrap(), LocalSettings::default());
    }

    #[test]
    fn test_save_and_clear_settings() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteSettingsRepository::new(db.connection());

        let settings = LocalSettings {
            last_active_survey_id: Some(SurveyId::from("s1")),
            last_user_id: Some(UserId::from("u1")),
        };
        repo.save(&settings).unwrap();
        assert_eq!(repo.load().unwrap(), settings);

        repo.save(&LocalSettings {
            last_active_survey_id: None,
            ..settings
        })
        .unwrap();
        let loaded = repo.load().unwrap();
        assert!(loaded.last_active_survey_id.is_none());
        assert_eq!(loaded.last_user_id, Some(UserId::from("u1")));
    }
}
