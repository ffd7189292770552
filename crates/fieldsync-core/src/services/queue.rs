//! Local mutation queue service
//!
//! The queue is the single writer of `mutation_queue` rows. Every operation
//! runs in one local transaction and publishes a `QueueEvent` per touched
//! mutation once that transaction has committed.

use std::collections::HashMap;

use rusqlite::Connection;
use tokio::sync::broadcast;

use crate::db::{
    MutationRepository, SqliteMutationRepository, SqliteSurveyRepository, StatusChange,
    SurveyRepository,
};
use crate::error::{Error, Result};
use crate::models::{
    LocationOfInterest, LoiId, MediaUpload, Mutation, MutationId, MutationPayload, MutationType,
    NewMedia, NewMutation, QueueEvent, Submission, Survey, SurveyId, SyncStatus,
    UploadQueueEntry,
};

use super::database::DatabaseService;

/// Capacity of the queue event channel; slow subscribers observe `Lagged`.
pub const EVENT_CAPACITY: usize = 256;

/// Independent sync legs of one LOI. At most one sync per lane is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    /// LOI and submission record mutations
    Records,
    /// Media uploads
    Media,
}

impl Lane {
    #[must_use]
    pub const fn in_flight_status(self) -> SyncStatus {
        match self {
            Self::Records => SyncStatus::InProgress,
            Self::Media => SyncStatus::MediaUploadInProgress,
        }
    }

    #[must_use]
    pub const fn of(mutation: &Mutation) -> Self {
        if mutation.is_media() {
            Self::Media
        } else {
            Self::Records
        }
    }
}

/// Durable, ordered store of pending mutations.
#[derive(Clone)]
pub struct MutationQueue {
    db: DatabaseService,
    events: broadcast::Sender<QueueEvent>,
}

impl MutationQueue {
    #[must_use]
    pub fn new(db: DatabaseService) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { db, events }
    }

    #[must_use]
    pub const fn database(&self) -> &DatabaseService {
        &self.db
    }

    /// Push stream of queue transitions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn publish(&self, events: impl IntoIterator<Item = QueueEvent>) {
        for event in events {
            // No subscribers is not an error.
            let _ = self.events.send(event);
        }
    }

    /// Queue a mutation whose local record is already written.
    pub async fn enqueue(&self, mutation: NewMutation) -> Result<Mutation> {
        let stored = self
            .db
            .transaction(move |conn| insert_mutation(conn, &mutation))
            .await?;
        tracing::debug!(
            "Enqueued {} {} mutation {} for LOI {}",
            stored.mutation_type,
            stored.kind().as_str(),
            stored.id,
            stored.loi_id
        );
        self.publish([QueueEvent::from_mutation(&stored)]);
        Ok(stored)
    }

    /// Write an LOI and queue its mutation atomically.
    pub async fn enqueue_location_of_interest(
        &self,
        loi: LocationOfInterest,
        mutation: NewMutation,
    ) -> Result<Mutation> {
        if !matches!(mutation.payload, MutationPayload::LocationOfInterest(_))
            || loi.id != mutation.loi_id
            || loi.survey_id != mutation.survey_id
        {
            return Err(Error::InvalidInput(format!(
                "mutation does not describe LOI {}",
                loi.id
            )));
        }

        let stored = self
            .db
            .transaction(move |conn| {
                let surveys = SqliteSurveyRepository::new(conn);
                if mutation.mutation_type == MutationType::Delete {
                    surveys.mark_loi_deleted(&loi.id)?;
                } else {
                    surveys.upsert_loi(&loi)?;
                }
                insert_mutation(conn, &mutation)
            })
            .await?;
        tracing::debug!("Enqueued LOI mutation {} for {}", stored.id, stored.loi_id);
        self.publish([QueueEvent::from_mutation(&stored)]);
        Ok(stored)
    }

    /// Write a submission and queue its mutation plus media satellites
    /// atomically.
    pub async fn enqueue_submission(
        &self,
        submission: Submission,
        mutation: NewMutation,
        media: Vec<NewMedia>,
    ) -> Result<(Mutation, Vec<Mutation>)> {
        let matches_record = match &mutation.payload {
            MutationPayload::Submission(change) => {
                change.submission_id == submission.id
                    && submission.loi_id == mutation.loi_id
                    && submission.survey_id == mutation.survey_id
            }
            _ => false,
        };
        if !matches_record {
            return Err(Error::InvalidInput(format!(
                "mutation does not describe submission {}",
                submission.id
            )));
        }

        let (stored, satellites) = self
            .db
            .transaction(move |conn| {
                let surveys = SqliteSurveyRepository::new(conn);
                if mutation.mutation_type == MutationType::Delete {
                    surveys.mark_submission_deleted(&submission.id)?;
                } else {
                    surveys.upsert_submission(&submission)?;
                }
                let stored = insert_mutation(conn, &mutation)?;

                let mut satellites = Vec::with_capacity(media.len());
                for file in media {
                    let satellite = NewMutation::at(
                        MutationType::Create,
                        stored.survey_id.clone(),
                        stored.loi_id.clone(),
                        stored.user_id.clone(),
                        stored.client_timestamp,
                        MutationPayload::Media(MediaUpload {
                            parent: stored.id,
                            submission_id: submission.id.clone(),
                            local_path: file.local_path,
                            remote_path: file.remote_path,
                        }),
                    )?;
                    satellites.push(insert_mutation(conn, &satellite)?);
                }
                Ok((stored, satellites))
            })
            .await?;

        tracing::debug!(
            "Enqueued submission mutation {} with {} media file(s)",
            stored.id,
            satellites.len()
        );
        self.publish(
            std::iter::once(&stored)
                .chain(&satellites)
                .map(QueueEvent::from_mutation),
        );
        Ok((stored, satellites))
    }

    pub async fn get(&self, id: MutationId) -> Result<Option<Mutation>> {
        self.db
            .read(move |conn| SqliteMutationRepository::new(conn).get(id))
            .await
    }

    /// Every mutation not yet COMPLETED or FAILED, oldest client timestamp first.
    pub async fn all_pending(&self) -> Result<Vec<Mutation>> {
        let open: Vec<SyncStatus> = SyncStatus::ALL
            .into_iter()
            .filter(|status| !status.is_terminal())
            .collect();
        self.by_status(&open).await
    }

    pub async fn by_status(&self, statuses: &[SyncStatus]) -> Result<Vec<Mutation>> {
        let statuses = statuses.to_vec();
        self.db
            .read(move |conn| SqliteMutationRepository::new(conn).list_by_status(&statuses))
            .await
    }

    /// Mutations of one LOI in the given statuses, oldest first.
    pub async fn by_entity(
        &self,
        loi_id: &LoiId,
        statuses: &[SyncStatus],
    ) -> Result<Vec<Mutation>> {
        let loi_id = loi_id.clone();
        let statuses = statuses.to_vec();
        self.db
            .read(move |conn| SqliteMutationRepository::new(conn).list_by_loi(&loi_id, &statuses))
            .await
    }

    /// Apply one validated status transition.
    pub async fn update_status(&self, id: MutationId, change: StatusChange) -> Result<Mutation> {
        let mut updated = self.apply_changes(vec![(id, change)]).await?;
        updated
            .pop()
            .ok_or_else(|| Error::NotFound(format!("mutation {id}")))
    }

    /// Apply several transitions in one transaction; all or none commit.
    pub async fn apply_changes(
        &self,
        changes: Vec<(MutationId, StatusChange)>,
    ) -> Result<Vec<Mutation>> {
        let updated = self
            .db
            .transaction(move |conn| {
                let repo = SqliteMutationRepository::new(conn);
                changes
                    .iter()
                    .map(|(id, change)| repo.update_status(*id, change))
                    .collect::<Result<Vec<_>>>()
            })
            .await?;
        self.publish(updated.iter().map(QueueEvent::from_mutation));
        Ok(updated)
    }

    /// Move `ids` of one LOI lane into their in-flight status.
    ///
    /// Returns `None` without touching anything when the lane already has a
    /// mutation in flight. Ids that are no longer eligible are skipped.
    pub async fn claim(
        &self,
        loi_id: &LoiId,
        lane: Lane,
        ids: &[MutationId],
    ) -> Result<Option<Vec<Mutation>>> {
        let loi_id = loi_id.clone();
        let ids = ids.to_vec();
        let claimed = self
            .db
            .transaction(move |conn| {
                let repo = SqliteMutationRepository::new(conn);
                if !repo
                    .list_by_loi(&loi_id, &[lane.in_flight_status()])?
                    .is_empty()
                {
                    return Ok(None);
                }

                let mut claimed = Vec::with_capacity(ids.len());
                for id in ids {
                    let Some(mutation) = repo.get(id)? else {
                        continue;
                    };
                    let steps: &[SyncStatus] = match (lane, mutation.sync_status) {
                        (Lane::Records, SyncStatus::Pending) if !mutation.is_media() => {
                            &[SyncStatus::InProgress]
                        }
                        (Lane::Media, SyncStatus::MediaUploadPending) => {
                            &[SyncStatus::MediaUploadInProgress]
                        }
                        (Lane::Media, SyncStatus::MediaUploadAwaitingRetry) => &[
                            SyncStatus::MediaUploadPending,
                            SyncStatus::MediaUploadInProgress,
                        ],
                        _ => continue,
                    };
                    let mut current = mutation;
                    for status in steps {
                        current = repo.update_status(id, &StatusChange::to(*status))?;
                    }
                    claimed.push(current);
                }
                Ok(Some(claimed))
            })
            .await?;

        if let Some(claimed) = &claimed {
            self.publish(claimed.iter().map(QueueEvent::from_mutation));
        }
        Ok(claimed)
    }

    /// Whether a media satellite's parent submission has reached the remote
    /// store (COMPLETED, or already purged).
    pub async fn parent_synced(&self, parent: MutationId) -> Result<bool> {
        let parent = self.get(parent).await?;
        Ok(parent.is_none_or(|parent| parent.sync_status == SyncStatus::Completed))
    }

    /// Startup sweep: move in-flight mutations left by an interrupted pass
    /// back to a syncable status.
    pub async fn recover_stale(&self) -> Result<usize> {
        let recovered = self
            .db
            .transaction(|conn| {
                let repo = SqliteMutationRepository::new(conn);
                let mut recovered = Vec::new();
                for mutation in repo.list_by_status(&SyncStatus::IN_FLIGHT)? {
                    if let Some(target) = mutation.sync_status.recovery_target() {
                        recovered.push(repo.update_status(mutation.id, &StatusChange::to(target))?);
                    }
                }
                Ok(recovered)
            })
            .await?;

        if !recovered.is_empty() {
            tracing::warn!(
                "Recovered {} mutation(s) left in flight by an interrupted sync",
                recovered.len()
            );
        }
        let count = recovered.len();
        self.publish(recovered.iter().map(QueueEvent::from_mutation));
        Ok(count)
    }

    /// Move any of `ids` still in flight back to a syncable status. Rows that
    /// already moved on or were removed are skipped.
    pub async fn release(&self, ids: &[MutationId]) -> Result<Vec<Mutation>> {
        let ids = ids.to_vec();
        let released = self
            .db
            .transaction(move |conn| {
                let repo = SqliteMutationRepository::new(conn);
                let mut released = Vec::new();
                for id in ids {
                    let Some(mutation) = repo.get(id)? else {
                        continue;
                    };
                    if let Some(target) = mutation.sync_status.recovery_target() {
                        released.push(repo.update_status(id, &StatusChange::to(target))?);
                    }
                }
                Ok(released)
            })
            .await?;
        self.publish(released.iter().map(QueueEvent::from_mutation));
        Ok(released)
    }

    /// Delete COMPLETED rows last updated before `older_than` (Unix ms).
    pub async fn purge_completed(&self, older_than: i64) -> Result<usize> {
        let purged = self
            .db
            .transaction(move |conn| {
                SqliteMutationRepository::new(conn).purge_completed(older_than)
            })
            .await?;
        if purged > 0 {
            tracing::info!("Purged {purged} completed mutation(s)");
        }
        Ok(purged)
    }

    /// Drop a mutation that has not synced, together with its media
    /// satellites.
    pub async fn discard(&self, id: MutationId) -> Result<Vec<Mutation>> {
        let removed = self
            .db
            .transaction(move |conn| {
                let repo = SqliteMutationRepository::new(conn);
                let mutation = repo
                    .get(id)?
                    .ok_or_else(|| Error::NotFound(format!("mutation {id}")))?;
                if mutation.sync_status.is_in_flight()
                    || mutation.sync_status == SyncStatus::Completed
                {
                    return Err(Error::InvalidInput(format!(
                        "mutation {id} is {} and cannot be discarded",
                        mutation.sync_status
                    )));
                }

                let mut removed = repo.list_children(id)?;
                if removed.iter().any(|child| child.sync_status.is_in_flight()) {
                    return Err(Error::InvalidInput(format!(
                        "media of mutation {id} is uploading"
                    )));
                }
                for child in &removed {
                    repo.delete(child.id)?;
                }
                repo.delete(id)?;
                removed.insert(0, mutation);
                Ok(removed)
            })
            .await?;

        tracing::info!("Discarded mutation {id} ({} row(s))", removed.len());
        self.publish(removed.iter().map(QueueEvent::removed));
        Ok(removed)
    }

    /// Revive a FAILED mutation as a fresh PENDING copy with a new id.
    ///
    /// The copy keeps the original client timestamp so per-entity order is
    /// unchanged; media satellites are re-pointed to it.
    pub async fn retry_failed(&self, id: MutationId) -> Result<Mutation> {
        let (old, fresh) = self
            .db
            .transaction(move |conn| {
                let repo = SqliteMutationRepository::new(conn);
                let old = repo
                    .get(id)?
                    .ok_or_else(|| Error::NotFound(format!("mutation {id}")))?;
                if old.sync_status != SyncStatus::Failed {
                    return Err(Error::InvalidInput(format!(
                        "mutation {id} is {}; only FAILED mutations can be retried",
                        old.sync_status
                    )));
                }

                let copy = NewMutation::at(
                    old.mutation_type,
                    old.survey_id.clone(),
                    old.loi_id.clone(),
                    old.user_id.clone(),
                    old.client_timestamp,
                    old.payload.clone(),
                )?;
                let fresh = insert_row(&repo, &copy)?;
                repo.reparent(old.id, fresh.id)?;
                repo.delete(old.id)?;
                Ok((old, fresh))
            })
            .await?;

        tracing::info!("Retrying failed mutation {} as {}", old.id, fresh.id);
        self.publish([QueueEvent::removed(&old), QueueEvent::from_mutation(&fresh)]);
        Ok(fresh)
    }

    /// All queued rows with display metadata, oldest first.
    pub async fn upload_queue(&self) -> Result<Vec<UploadQueueEntry>> {
        self.db
            .read(|conn| {
                let mutations =
                    SqliteMutationRepository::new(conn).list_by_status(&SyncStatus::ALL)?;
                let surveys = SqliteSurveyRepository::new(conn);
                let mut cache: HashMap<SurveyId, Option<Survey>> = HashMap::new();

                let mut entries = Vec::with_capacity(mutations.len());
                for mutation in mutations {
                    if !cache.contains_key(&mutation.survey_id) {
                        let survey = surveys.get_survey(&mutation.survey_id)?;
                        cache.insert(mutation.survey_id.clone(), survey);
                    }
                    let survey = cache.get(&mutation.survey_id).and_then(Option::as_ref);

                    let job_id = match &mutation.payload {
                        MutationPayload::LocationOfInterest(change) => Some(change.job_id.clone()),
                        MutationPayload::Submission(change) => Some(change.job_id.clone()),
                        MutationPayload::Media(upload) => surveys
                            .get_submission(&upload.submission_id)?
                            .map(|submission| submission.job_id),
                    };
                    let job_name = job_id.and_then(|job_id| {
                        survey
                            .and_then(|survey| survey.job(&job_id))
                            .map(|job| job.name.clone())
                    });

                    entries.push(UploadQueueEntry {
                        survey_title: survey.map(|survey| survey.title.clone()),
                        job_name,
                        loi_display_name: surveys
                            .get_loi(&mutation.loi_id)?
                            .map(|loi| loi.display_name()),
                        mutation,
                    });
                }
                Ok(entries)
            })
            .await
    }
}

/// Insert a mutation after checking the survey is cached, clamping the
/// client timestamp so a skewed clock never reorders an entity's edits.
fn insert_mutation(conn: &Connection, mutation: &NewMutation) -> Result<Mutation> {
    mutation.validate()?;
    let surveys = SqliteSurveyRepository::new(conn);
    if !surveys.contains_survey(&mutation.survey_id)? {
        return Err(Error::NotFound(format!(
            "survey {} is not available offline",
            mutation.survey_id
        )));
    }

    let repo = SqliteMutationRepository::new(conn);
    if let MutationPayload::Media(upload) = &mutation.payload {
        let parent = repo
            .get(upload.parent)?
            .ok_or_else(|| Error::NotFound(format!("parent mutation {}", upload.parent)))?;
        if !matches!(parent.payload, MutationPayload::Submission(_)) {
            return Err(Error::InvalidInput(format!(
                "media parent {} is not a submission mutation",
                upload.parent
            )));
        }
    }

    let mut mutation = mutation.clone();
    if let Some(latest) = repo.latest_client_timestamp(&mutation.entity_id())? {
        if latest > mutation.client_timestamp {
            tracing::debug!(
                "Clamping client timestamp {} to {latest} for entity {}",
                mutation.client_timestamp,
                mutation.entity_id()
            );
            mutation.client_timestamp = latest;
        }
    }
    insert_row(&repo, &mutation)
}

/// Insert and, for media, enter the upload lifecycle.
fn insert_row(repo: &SqliteMutationRepository<'_>, mutation: &NewMutation) -> Result<Mutation> {
    let stored = repo.insert(mutation)?;
    if stored.is_media() {
        return repo.update_status(stored.id, &StatusChange::to(SyncStatus::MediaUploadPending));
    }
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{sample_loi, sample_survey};
    use crate::models::{
        AuditInfo, JobId, LoiChange, MutationKind, SubmissionChange, SubmissionId, TaskId,
        TaskSelections, TaskType, TaskValue, UserId, ValueDelta,
    };
    use crate::sync::{InMemoryRemoteStore, RemoteError, RetryPolicy, SyncOrchestrator};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::Arc;

    async fn queue_with_survey() -> MutationQueue {
        let db = DatabaseService::open_in_memory().unwrap();
        db.transaction(|conn| SqliteSurveyRepository::new(conn).replace_survey(&sample_survey()))
            .await
            .unwrap();
        MutationQueue::new(db)
    }

    fn loi_mutation(mutation_type: MutationType, loi: &str, at: i64) -> NewMutation {
        NewMutation::at(
            mutation_type,
            SurveyId::from("s1"),
            LoiId::from(loi),
            UserId::from("u1"),
            at,
            MutationPayload::LocationOfInterest(LoiChange {
                job_id: JobId::from("j1"),
                geometry: Some(sample_loi(loi, false).geometry),
                custom_id: None,
                properties: BTreeMap::new(),
            }),
        )
        .unwrap()
    }

    fn submission(id: &str) -> Submission {
        Submission {
            id: SubmissionId::from(id),
            survey_id: SurveyId::from("s1"),
            loi_id: LoiId::from("l1"),
            job_id: JobId::from("j1"),
            values: TaskSelections::new(),
            created: AuditInfo::now(UserId::from("u1")),
            last_modified: AuditInfo::now(UserId::from("u1")),
        }
    }

    fn submission_mutation(id: &str, at: i64) -> NewMutation {
        NewMutation::at(
            MutationType::Create,
            SurveyId::from("s1"),
            LoiId::from("l1"),
            UserId::from("u1"),
            at,
            MutationPayload::Submission(SubmissionChange {
                submission_id: SubmissionId::from(id),
                job_id: JobId::from("j1"),
                deltas: vec![ValueDelta {
                    task_id: TaskId::from("t2"),
                    task_type: TaskType::Text,
                    new_value: Some(TaskValue::Text {
                        text: "spring".to_string(),
                    }),
                }],
            }),
        )
        .unwrap()
    }

    fn photo(name: &str) -> NewMedia {
        NewMedia {
            local_path: PathBuf::from(format!("/data/photos/{name}")),
            remote_path: format!("user-media/{name}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn enqueue_requires_cached_survey() {
        let queue = MutationQueue::new(DatabaseService::open_in_memory().unwrap());
        let error = queue
            .enqueue(loi_mutation(MutationType::Create, "l1", 10))
            .await
            .unwrap_err();
        assert!(matches!(error, Error::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn enqueue_writes_record_and_queue_row_together() {
        let queue = queue_with_survey().await;
        let mut events = queue.subscribe();

        let stored = queue
            .enqueue_location_of_interest(
                sample_loi("l1", false),
                loi_mutation(MutationType::Create, "l1", 10),
            )
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.mutation_id, stored.id);
        assert_eq!(event.status, Some(SyncStatus::Pending));

        let loi = queue
            .database()
            .read(|conn| SqliteSurveyRepository::new(conn).get_loi(&LoiId::from("l1")))
            .await
            .unwrap();
        assert!(loi.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mismatched_record_is_rejected_before_writing() {
        let queue = queue_with_survey().await;
        let error = queue
            .enqueue_location_of_interest(
                sample_loi("other", false),
                loi_mutation(MutationType::Create, "l1", 10),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, Error::InvalidInput(_)));
        assert!(queue.all_pending().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn submission_media_enter_upload_lifecycle() {
        let queue = queue_with_survey().await;
        let (parent, media) = queue
            .enqueue_submission(
                submission("sub-1"),
                submission_mutation("sub-1", 20),
                vec![photo("a.jpg"), photo("b.jpg")],
            )
            .await
            .unwrap();

        assert_eq!(parent.sync_status, SyncStatus::Pending);
        assert_eq!(media.len(), 2);
        for satellite in &media {
            assert_eq!(satellite.kind(), MutationKind::Media);
            assert_eq!(satellite.sync_status, SyncStatus::MediaUploadPending);
            assert_eq!(satellite.entity_id(), "sub-1");
        }
        assert!(!queue.parent_synced(parent.id).await.unwrap());

        let entries = queue.upload_queue().await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].survey_title.as_deref(), Some("Water points"));
        assert_eq!(entries[2].job_name.as_deref(), Some("Wells"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn skewed_clock_never_reorders_an_entity() {
        let queue = queue_with_survey().await;
        let first = queue
            .enqueue(loi_mutation(MutationType::Create, "l1", 500))
            .await
            .unwrap();
        let second = queue
            .enqueue(loi_mutation(MutationType::Update, "l1", 100))
            .await
            .unwrap();

        assert_eq!(second.client_timestamp, 500);
        assert!(first.order_key() < second.order_key());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn claim_is_exclusive_per_lane() {
        let queue = queue_with_survey().await;
        let a = queue
            .enqueue(loi_mutation(MutationType::Create, "l1", 1))
            .await
            .unwrap();
        let b = queue
            .enqueue(loi_mutation(MutationType::Update, "l1", 2))
            .await
            .unwrap();

        let claimed = queue
            .claim(&LoiId::from("l1"), Lane::Records, &[a.id])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed[0].sync_status, SyncStatus::InProgress);

        let second = queue
            .claim(&LoiId::from("l1"), Lane::Records, &[b.id])
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn completed_mutations_leave_all_pending() {
        let queue = queue_with_survey().await;
        let stored = queue
            .enqueue(loi_mutation(MutationType::Create, "l1", 1))
            .await
            .unwrap();
        queue
            .update_status(stored.id, StatusChange::to(SyncStatus::InProgress))
            .await
            .unwrap();
        queue
            .update_status(stored.id, StatusChange::to(SyncStatus::Completed))
            .await
            .unwrap();

        assert!(queue.all_pending().await.unwrap().is_empty());
        assert_eq!(queue.purge_completed(i64::MAX).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn recover_stale_uses_legal_transitions() {
        let queue = queue_with_survey().await;
        let (parent, media) = queue
            .enqueue_submission(
                submission("sub-1"),
                submission_mutation("sub-1", 1),
                vec![photo("a.jpg")],
            )
            .await
            .unwrap();
        queue
            .claim(&LoiId::from("l1"), Lane::Records, &[parent.id])
            .await
            .unwrap();
        queue
            .claim(&LoiId::from("l1"), Lane::Media, &[media[0].id])
            .await
            .unwrap();

        assert_eq!(queue.recover_stale().await.unwrap(), 2);
        let parent = queue.get(parent.id).await.unwrap().unwrap();
        let media = queue.get(media[0].id).await.unwrap().unwrap();
        assert_eq!(parent.sync_status, SyncStatus::Pending);
        assert_eq!(media.sync_status, SyncStatus::MediaUploadAwaitingRetry);
        assert_eq!(queue.recover_stale().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retry_failed_replaces_row_and_repoints_media() {
        let queue = queue_with_survey().await;
        let (parent, media) = queue
            .enqueue_submission(
                submission("sub-1"),
                submission_mutation("sub-1", 1),
                vec![photo("a.jpg")],
            )
            .await
            .unwrap();
        queue
            .update_status(parent.id, StatusChange::to(SyncStatus::InProgress))
            .await
            .unwrap();
        queue
            .update_status(
                parent.id,
                StatusChange::to(SyncStatus::Failed).with_error("permission denied"),
            )
            .await
            .unwrap();

        let fresh = queue.retry_failed(parent.id).await.unwrap();
        assert!(fresh.id > media[0].id);
        assert_eq!(fresh.sync_status, SyncStatus::Pending);
        assert_eq!(fresh.client_timestamp, parent.client_timestamp);
        assert!(queue.get(parent.id).await.unwrap().is_none());

        let satellite = queue.get(media[0].id).await.unwrap().unwrap();
        let MutationPayload::Media(upload) = satellite.payload else {
            panic!("expected media payload");
        };
        assert_eq!(upload.parent, fresh.id);

        let error = queue.retry_failed(fresh.id).await.unwrap_err();
        assert!(matches!(error, Error::InvalidInput(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn discard_removes_satellites() {
        let queue = queue_with_survey().await;
        let (parent, _) = queue
            .enqueue_submission(
                submission("sub-1"),
                submission_mutation("sub-1", 1),
                vec![photo("a.jpg")],
            )
            .await
            .unwrap();

        let removed = queue.discard(parent.id).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(queue.all_pending().await.unwrap().is_empty());
        assert!(matches!(
            queue.discard(parent.id).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    fn drain(
        events: &mut broadcast::Receiver<QueueEvent>,
    ) -> Vec<(MutationId, Option<SyncStatus>)> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push((event.mutation_id, event.status));
        }
        seen
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn subscribers_see_every_transition() {
        let queue = queue_with_survey().await;
        let remote = Arc::new(InMemoryRemoteStore::new());
        let orchestrator =
            SyncOrchestrator::new(queue.clone(), remote.clone(), RetryPolicy::immediate(3));
        let stored = queue
            .enqueue(loi_mutation(MutationType::Create, "l1", 10))
            .await
            .unwrap();
        let mut events = queue.subscribe();

        remote.fail_next_batches(1, &RemoteError::unavailable("no signal"));
        orchestrator.sync_pass().await.unwrap();
        assert_eq!(
            drain(&mut events),
            vec![
                (stored.id, Some(SyncStatus::InProgress)),
                (stored.id, Some(SyncStatus::Pending)),
            ]
        );

        orchestrator.sync_pass().await.unwrap();
        assert_eq!(
            drain(&mut events),
            vec![
                (stored.id, Some(SyncStatus::InProgress)),
                (stored.id, Some(SyncStatus::Completed)),
            ]
        );

        let stale = queue
            .enqueue(loi_mutation(MutationType::Create, "l2", 20))
            .await
            .unwrap();
        queue
            .update_status(stale.id, StatusChange::to(SyncStatus::InProgress))
            .await
            .unwrap();
        queue.recover_stale().await.unwrap();
        assert_eq!(
            drain(&mut events),
            vec![
                (stale.id, Some(SyncStatus::Pending)),
                (stale.id, Some(SyncStatus::InProgress)),
                (stale.id, Some(SyncStatus::Pending)),
            ]
        );

        queue.discard(stale.id).await.unwrap();
        let removed = events.recv().await.unwrap();
        assert_eq!(removed.mutation_id, stale.id);
        assert_eq!(removed.status, None);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn release_only_touches_rows_still_in_flight() {
        let queue = queue_with_survey().await;
        let claimed = queue
            .enqueue(loi_mutation(MutationType::Create, "l1", 10))
            .await
            .unwrap();
        let settled = queue
            .enqueue(loi_mutation(MutationType::Create, "l2", 20))
            .await
            .unwrap();
        for id in [claimed.id, settled.id] {
            queue
                .update_status(id, StatusChange::to(SyncStatus::InProgress))
                .await
                .unwrap();
        }
        queue
            .update_status(settled.id, StatusChange::to(SyncStatus::Completed))
            .await
            .unwrap();

        let released = queue
            .release(&[claimed.id, settled.id, MutationId::new(9_999)])
            .await
            .unwrap();

        assert_eq!(released.len(), 1);
        assert_eq!(released[0].id, claimed.id);
        assert_eq!(released[0].sync_status, SyncStatus::Pending);
        let settled = queue.get(settled.id).await.unwrap().unwrap();
        assert_eq!(settled.sync_status, SyncStatus::Completed);
    }
}
