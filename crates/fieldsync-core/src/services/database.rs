//! Shared database service wrapper used by the queue, orchestrator and
//! survey manager.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::db::{Database, SettingsRepository, SqliteSettingsRepository};
use crate::models::LocalSettings;
use crate::Result;

/// Thread-safe service owning the local store connection.
///
/// Every logical operation runs as one transaction while the lock is held;
/// the lock is never held across a remote call.
#[derive(Clone)]
pub struct DatabaseService {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl DatabaseService {
    /// Open a database service at the given filesystem path.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let db = Database::open(&db_path)?;
        tracing::info!("Opened local store at {}", db_path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory database service (primarily for tests).
    pub fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    /// Filesystem location, `None` for in-memory stores.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Run `operation` inside one transaction; it commits only if
    /// `operation` succeeds.
    pub async fn transaction<T, F>(&self, operation: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send,
        T: Send,
    {
        let db = self.db.lock().await;
        let tx = db.connection().unchecked_transaction()?;
        let value = operation(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Run a read-only query against the connection.
    pub async fn read<T, F>(&self, query: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send,
        T: Send,
    {
        let db = self.db.lock().await;
        query(db.connection())
    }

    /// Load process-scoped local state.
    pub async fn load_settings(&self) -> Result<LocalSettings> {
        self.read(|conn| SqliteSettingsRepository::new(conn).load())
            .await
    }

    /// Persist process-scoped local state.
    pub async fn save_settings(&self, settings: &LocalSettings) -> Result<()> {
        let settings = settings.clone();
        self.transaction(move |conn| SqliteSettingsRepository::new(conn).save(&settings))
            .await
    }
}
