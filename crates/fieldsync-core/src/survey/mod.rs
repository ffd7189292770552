//! Survey availability: keeps the active survey's schema cached offline.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::db::{
    MutationRepository, SqliteMutationRepository, SqliteSurveyRepository, SurveyRepository,
};
use crate::error::{Error, Result};
use crate::models::{LocationOfInterest, Survey, SurveyId};
use crate::services::DatabaseService;
use crate::sync::{RemoteError, RemoteStore};

/// Outcome of a failed activation. Callers branch on the variant to offer
/// "remove locally" for `NotFound` and "retry when online" for
/// `OfflineUncached`.
#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("Survey {0} not found")]
    NotFound(SurveyId),

    #[error("Survey {survey_id} is not available offline: {source}")]
    OfflineUncached {
        survey_id: SurveyId,
        source: RemoteError,
    },

    #[error("Remote store error: {0}")]
    Remote(RemoteError),

    #[error(transparent)]
    Local(#[from] Error),
}

/// Activates, caches, refreshes and removes surveys.
#[derive(Clone)]
pub struct SurveyAvailabilityManager {
    db: DatabaseService,
    remote: Arc<dyn RemoteStore>,
    active: Arc<watch::Sender<Option<Survey>>>,
    activation: Arc<Mutex<()>>,
}

impl SurveyAvailabilityManager {
    pub fn new(db: DatabaseService, remote: Arc<dyn RemoteStore>) -> Self {
        let (active, _) = watch::channel(None);
        Self {
            db,
            remote,
            active: Arc::new(active),
            activation: Arc::new(Mutex::new(())),
        }
    }

    #[must_use]
    pub fn active_survey(&self) -> Option<Survey> {
        self.active.borrow().clone()
    }

    /// Observe the active survey; `None` while no survey is active.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<Survey>> {
        self.active.subscribe()
    }

    fn is_active(&self, survey_id: &SurveyId) -> bool {
        self.active
            .borrow()
            .as_ref()
            .is_some_and(|survey| &survey.id == survey_id)
    }

    /// Make `survey_id` the active survey, fetching and caching it first if
    /// it is not available offline.
    pub async fn activate(
        &self,
        survey_id: &SurveyId,
    ) -> std::result::Result<Survey, ActivationError> {
        let _activation = self.activation.lock().await;
        if let Some(active) = self.active_survey().filter(|survey| &survey.id == survey_id) {
            return Ok(active);
        }

        let cached = {
            let survey_id = survey_id.clone();
            self.db
                .read(move |conn| SqliteSurveyRepository::new(conn).get_survey(&survey_id))
                .await?
        };
        let survey = match cached {
            Some(survey) => survey,
            None => self.download(survey_id).await?,
        };

        let mut settings = self.db.load_settings().await?;
        settings.last_active_survey_id = Some(survey.id.clone());
        self.db.save_settings(&settings).await?;

        tracing::info!("Activated survey {} ({})", survey.id, survey.title);
        self.active.send_replace(Some(survey.clone()));
        Ok(survey)
    }

    async fn download(&self, survey_id: &SurveyId) -> std::result::Result<Survey, ActivationError> {
        let classify = |error: RemoteError| {
            if error.is_not_found() {
                ActivationError::NotFound(survey_id.clone())
            } else if error.is_transient() {
                ActivationError::OfflineUncached {
                    survey_id: survey_id.clone(),
                    source: error,
                }
            } else {
                ActivationError::Remote(error)
            }
        };

        let survey = self
            .remote
            .fetch_survey(survey_id)
            .await
            .map_err(classify)?
            .ok_or_else(|| ActivationError::NotFound(survey_id.clone()))?;
        let lois = self
            .remote
            .fetch_predefined_lois(&survey)
            .await
            .map_err(classify)?;
        self.store(&survey, lois).await?;
        tracing::info!("Made survey {} available offline", survey.id);
        Ok(survey)
    }

    /// Replace the cached schema and predefined LOIs in one transaction.
    async fn store(&self, survey: &Survey, lois: Vec<LocationOfInterest>) -> Result<()> {
        let survey = survey.clone();
        self.db
            .transaction(move |conn| {
                let repo = SqliteSurveyRepository::new(conn);
                repo.replace_survey(&survey)?;
                repo.replace_predefined_lois(&survey.id, &lois)
            })
            .await
    }

    /// Clear the active survey.
    pub async fn deactivate(&self) -> Result<()> {
        let previous = self.active.send_replace(None);
        let mut settings = self.db.load_settings().await?;
        if settings.last_active_survey_id.take().is_some() {
            self.db.save_settings(&settings).await?;
        }
        if let Some(survey) = previous {
            tracing::info!("Deactivated survey {}", survey.id);
        }
        Ok(())
    }

    /// Cold start: re-activate the previously active survey. Returns `None`
    /// when a survey is already active or none was active before.
    pub async fn reactivate_last(&self) -> std::result::Result<Option<Survey>, ActivationError> {
        if self.active_survey().is_some() {
            return Ok(None);
        }
        let settings = self.db.load_settings().await?;
        match settings.last_active_survey_id {
            Some(survey_id) => self.activate(&survey_id).await.map(Some),
            None => Ok(None),
        }
    }

    /// Delete the cached schema and data of a survey, deactivating it first.
    /// Queued mutations that have not synced are kept.
    pub async fn remove_offline(&self, survey_id: &SurveyId) -> Result<()> {
        let _activation = self.activation.lock().await;
        if self.is_active(survey_id) {
            self.deactivate().await?;
        }

        let (removed, purged) = {
            let survey_id = survey_id.clone();
            self.db
                .transaction(move |conn| {
                    let removed = SqliteSurveyRepository::new(conn).delete_survey(&survey_id)?;
                    let purged =
                        SqliteMutationRepository::new(conn).delete_terminal_for_survey(&survey_id)?;
                    Ok((removed, purged))
                })
                .await?
        };
        if removed {
            tracing::info!(
                "Removed offline survey {survey_id} ({purged} finished mutation(s) dropped)"
            );
        } else {
            tracing::debug!("Survey {survey_id} was not available offline");
        }
        Ok(())
    }

    /// Re-fetch a survey and its predefined LOIs. Returns `None` when the
    /// survey no longer exists remotely; the local copy is left in place.
    pub async fn sync_survey(&self, survey_id: &SurveyId) -> Result<Option<Survey>> {
        let Some(survey) = self.remote.fetch_survey(survey_id).await? else {
            tracing::warn!("Survey {survey_id} no longer exists remotely");
            return Ok(None);
        };
        let lois = self.remote.fetch_predefined_lois(&survey).await?;
        self.store(&survey, lois).await?;

        self.active.send_if_modified(|active| match active {
            Some(current) if current.id == survey.id => {
                *current = survey.clone();
                true
            }
            _ => false,
        });
        tracing::debug!("Synced survey {survey_id}");
        Ok(Some(survey))
    }

    /// Re-sync the cached survey on each remote change until the update
    /// stream ends or the survey stops being active.
    pub async fn follow_updates(&self, survey_id: &SurveyId) -> Result<JoinHandle<()>> {
        let mut updates = self.remote.stream_survey_updates(survey_id).await?;
        let mut active = self.subscribe();
        let manager = self.clone();
        let survey_id = survey_id.clone();

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    update = updates.recv() => {
                        let Some(update) = update else {
                            break;
                        };
                        if !manager.is_active(&survey_id) {
                            break;
                        }
                        tracing::debug!(
                            "Survey {} changed remotely at {}",
                            update.survey_id,
                            update.changed_at
                        );
                        if let Err(error) = manager.sync_survey(&survey_id).await {
                            tracing::warn!("Refreshing survey {survey_id} failed: {error}");
                        }
                    }
                    changed = active.changed() => {
                        if changed.is_err() || !manager.is_active(&survey_id) {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Stopped following survey {survey_id}");
        }))
    }

    /// Whether the cached survey can collect data offline.
    pub async fn is_usable(&self, survey_id: &SurveyId) -> Result<bool> {
        let survey_id = survey_id.clone();
        self.db
            .read(move |conn| {
                let repo = SqliteSurveyRepository::new(conn);
                let Some(survey) = repo.get_survey(&survey_id)? else {
                    return Ok(false);
                };
                Ok(survey.is_usable(repo.has_predefined_lois(&survey_id)?))
            })
            .await
    }

    /// Surveys cached offline as `(id, title)`.
    pub async fn offline_surveys(&self) -> Result<Vec<(SurveyId, String)>> {
        self.db
            .read(|conn| SqliteSurveyRepository::new(conn).list_surveys())
            .await
    }
}
