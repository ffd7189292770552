//! fieldsync-core - Core library for fieldsync
//!
//! Offline-first survey data collection: the durable mutation queue, its
//! sync status lifecycle, the sync orchestrator that reconciles queued
//! changes with a remote store, survey availability, and task condition
//! evaluation. Used by the `fieldsync` CLI and any other front end.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod state;
pub mod survey;
pub mod sync;
pub mod util;

pub use config::SyncConfig;
pub use error::{Error, Result};
pub use services::{DatabaseService, MutationQueue};
pub use state::SyncState;
pub use survey::{ActivationError, SurveyAvailabilityManager};
pub use sync::{RemoteStore, SyncOrchestrator, SyncReport, SyncWorker};
