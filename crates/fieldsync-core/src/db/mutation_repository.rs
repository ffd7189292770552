//! Mutation queue repository implementation

use std::collections::BTreeMap;
use std::path::PathBuf;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{
    Geometry, JobId, LoiChange, LoiId, MediaUpload, Mutation, MutationId, MutationKind,
    MutationPayload, MutationType, NewMutation, SubmissionChange, SubmissionId, SurveyId,
    SyncStatus, TaskId, TaskType, TaskValue, UserId, ValueDelta,
};
use crate::util::now_millis;

/// Requested status transition plus failure bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub status: SyncStatus,
    /// `None` keeps the stored count
    pub retry_count: Option<u32>,
    /// `None` keeps the stored error
    pub error: Option<String>,
    /// Earliest next attempt; `None` clears it
    pub next_attempt_at: Option<i64>,
}

impl StatusChange {
    #[must_use]
    pub const fn to(status: SyncStatus) -> Self {
        Self {
            status,
            retry_count: None,
            error: None,
            next_attempt_at: None,
        }
    }

    #[must_use]
    pub const fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    #[must_use]
    pub const fn retry_at(mut self, at: i64) -> Self {
        self.next_attempt_at = Some(at);
        self
    }
}

/// Trait for mutation queue storage operations
pub trait MutationRepository {
    /// Persist a validated mutation in `PENDING` state
    fn insert(&self, mutation: &NewMutation) -> Result<Mutation>;

    /// Get a mutation by queue id
    fn get(&self, id: MutationId) -> Result<Option<Mutation>>;

    /// Mutations in any of the given statuses, oldest client timestamp first
    fn list_by_status(&self, statuses: &[SyncStatus]) -> Result<Vec<Mutation>>;

    /// Mutations of one LOI in any of the given statuses, oldest first
    fn list_by_loi(&self, loi_id: &LoiId, statuses: &[SyncStatus]) -> Result<Vec<Mutation>>;

    /// Newest client timestamp queued for an entity, in any status
    fn latest_client_timestamp(&self, entity_id: &str) -> Result<Option<i64>>;

    /// Media satellites of a submission mutation
    fn list_children(&self, parent: MutationId) -> Result<Vec<Mutation>>;

    /// Apply a validated status transition
    fn update_status(&self, id: MutationId, change: &StatusChange) -> Result<Mutation>;

    /// Point satellites of `from` at `to`
    fn reparent(&self, from: MutationId, to: MutationId) -> Result<usize>;

    /// Remove a mutation row
    fn delete(&self, id: MutationId) -> Result<()>;

    /// Delete `COMPLETED` rows last written before `older_than` (Unix ms)
    fn purge_completed(&self, older_than: i64) -> Result<usize>;

    /// Delete terminal rows of a survey
    fn delete_terminal_for_survey(&self, survey_id: &SurveyId) -> Result<usize>;
}

/// `SQLite` implementation of `MutationRepository`
pub struct SqliteMutationRepository<'a> {
    conn: &'a Connection,
}

const SELECT_COLUMNS: &str = "SELECT id, kind, type, sync_status, survey_id, loi_id, parent_id,
        user_id, client_timestamp, retry_count, last_error, next_attempt_at, updated_at, payload
     FROM mutation_queue";

impl<'a> SqliteMutationRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn query(&self, sql: &str, values: Vec<String>) -> Result<Vec<Mutation>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), parse_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawMutation::into_mutation).collect()
    }
}

fn placeholders(count: usize, offset: usize) -> String {
    (1..=count)
        .map(|index| format!("?{}", index + offset))
        .collect::<Vec<_>>()
        .join(", ")
}

fn status_values(statuses: &[SyncStatus]) -> Vec<String> {
    statuses.iter().map(|status| status.as_str().to_string()).collect()
}

impl MutationRepository for SqliteMutationRepository<'_> {
    fn insert(&self, mutation: &NewMutation) -> Result<Mutation> {
        mutation.validate()?;
        let now = now_millis();
        let (job_id, parent_id) = match &mutation.payload {
            MutationPayload::LocationOfInterest(change) => (Some(change.job_id.to_string()), None),
            MutationPayload::Submission(change) => (Some(change.job_id.to_string()), None),
            MutationPayload::Media(upload) => (None, Some(upload.parent.get())),
        };
        let payload = encode_payload(&mutation.payload)?;

        self.conn.execute(
            "INSERT INTO mutation_queue (
                kind, type, sync_status, survey_id, loi_id, entity_id, job_id, parent_id,
                user_id, client_timestamp, retry_count, updated_at, payload
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?12)",
            params![
                mutation.payload.kind().as_str(),
                mutation.mutation_type.as_str(),
                SyncStatus::Pending.as_str(),
                mutation.survey_id.as_str(),
                mutation.loi_id.as_str(),
                mutation.entity_id(),
                job_id,
                parent_id,
                mutation.user_id.as_str(),
                mutation.client_timestamp,
                now,
                payload,
            ],
        )?;

        let id = MutationId::new(self.conn.last_insert_rowid());
        self.get(id)?
            .ok_or_else(|| Error::Database(format!("mutation {id} vanished after insert")))
    }

    fn get(&self, id: MutationId) -> Result<Option<Mutation>> {
        let raw = self
            .conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                params![id.get()],
                parse_row,
            )
            .optional()?;
        raw.map(RawMutation::into_mutation).transpose()
    }

    fn list_by_status(&self, statuses: &[SyncStatus]) -> Result<Vec<Mutation>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "{SELECT_COLUMNS} WHERE sync_status IN ({}) ORDER BY client_timestamp ASC, id ASC",
            placeholders(statuses.len(), 0)
        );
        self.query(&sql, status_values(statuses))
    }

    fn list_by_loi(&self, loi_id: &LoiId, statuses: &[SyncStatus]) -> Result<Vec<Mutation>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "{SELECT_COLUMNS} WHERE loi_id = ?1 AND sync_status IN ({})
             ORDER BY client_timestamp ASC, id ASC",
            placeholders(statuses.len(), 1)
        );
        let mut values = vec![loi_id.to_string()];
        values.extend(status_values(statuses));
        self.query(&sql, values)
    }

    fn latest_client_timestamp(&self, entity_id: &str) -> Result<Option<i64>> {
        let latest = self.conn.query_row(
            "SELECT MAX(client_timestamp) FROM mutation_queue WHERE entity_id = ?1",
            params![entity_id],
            |row| row.get(0),
        )?;
        Ok(latest)
    }

    fn list_children(&self, parent: MutationId) -> Result<Vec<Mutation>> {
        let sql = format!("{SELECT_COLUMNS} WHERE parent_id = ?1 ORDER BY id ASC");
        self.query(&sql, vec![parent.get().to_string()])
    }

    fn update_status(&self, id: MutationId, change: &StatusChange) -> Result<Mutation> {
        let current = self
            .get(id)?
            .ok_or_else(|| Error::NotFound(format!("mutation {id}")))?;
        current.sync_status.transition_to(change.status)?;

        let retry_count = change.retry_count.unwrap_or(current.retry_count);
        let last_error = change.error.clone().or(current.last_error);
        self.conn.execute(
            "UPDATE mutation_queue
             SET sync_status = ?1, retry_count = ?2, last_error = ?3, next_attempt_at = ?4,
                 updated_at = ?5
             WHERE id = ?6",
            params![
                change.status.as_str(),
                i64::from(retry_count),
                last_error,
                change.next_attempt_at,
                now_millis(),
                id.get(),
            ],
        )?;

        tracing::debug!(
            "Mutation {id}: {} -> {} (retries {retry_count})",
            current.sync_status,
            change.status
        );
        self.get(id)?
            .ok_or_else(|| Error::NotFound(format!("mutation {id}")))
    }

    fn reparent(&self, from: MutationId, to: MutationId) -> Result<usize> {
        let children = self.list_children(from)?;
        for child in &children {
            let MutationPayload::Media(upload) = &child.payload else {
                continue;
            };
            let moved = MutationPayload::Media(MediaUpload {
                parent: to,
                ..upload.clone()
            });
            self.conn.execute(
                "UPDATE mutation_queue SET parent_id = ?1, payload = ?2 WHERE id = ?3",
                params![to.get(), encode_payload(&moved)?, child.id.get()],
            )?;
        }
        Ok(children.len())
    }

    fn delete(&self, id: MutationId) -> Result<()> {
        let rows = self
            .conn
            .execute("DELETE FROM mutation_queue WHERE id = ?1", params![id.get()])?;
        if rows == 0 {
            return Err(Error::NotFound(format!("mutation {id}")));
        }
        Ok(())
    }

    fn purge_completed(&self, older_than: i64) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM mutation_queue WHERE sync_status = ?1 AND updated_at < ?2",
            params![SyncStatus::Completed.as_str(), older_than],
        )?;
        Ok(rows)
    }

    fn delete_terminal_for_survey(&self, survey_id: &SurveyId) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM mutation_queue WHERE survey_id = ?1 AND sync_status IN (?2, ?3)",
            params![
                survey_id.as_str(),
                SyncStatus::Completed.as_str(),
                SyncStatus::Failed.as_str(),
            ],
        )?;
        Ok(rows)
    }
}

/// Row as stored, before payload decoding.
struct RawMutation {
    id: i64,
    kind: String,
    mutation_type: String,
    sync_status: String,
    survey_id: String,
    loi_id: String,
    parent_id: Option<i64>,
    user_id: String,
    client_timestamp: i64,
    retry_count: i64,
    last_error: Option<String>,
    next_attempt_at: Option<i64>,
    updated_at: i64,
    payload: String,
}

fn parse_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawMutation> {
    Ok(RawMutation {
        id: row.get(0)?,
        kind: row.get(1)?,
        mutation_type: row.get(2)?,
        sync_status: row.get(3)?,
        survey_id: row.get(4)?,
        loi_id: row.get(5)?,
        parent_id: row.get(6)?,
        user_id: row.get(7)?,
        client_timestamp: row.get(8)?,
        retry_count: row.get(9)?,
        last_error: row.get(10)?,
        next_attempt_at: row.get(11)?,
        updated_at: row.get(12)?,
        payload: row.get(13)?,
    })
}

impl RawMutation {
    fn into_mutation(self) -> Result<Mutation> {
        let kind = MutationKind::parse(&self.kind)?;
        let sync_status = self
            .sync_status
            .parse::<SyncStatus>()
            .map_err(Error::Database)?;
        let parent = self.parent_id.map(MutationId::new);
        Ok(Mutation {
            id: MutationId::new(self.id),
            mutation_type: MutationType::parse(&self.mutation_type),
            sync_status,
            survey_id: SurveyId::new(self.survey_id),
            loi_id: LoiId::new(self.loi_id),
            user_id: UserId::new(self.user_id),
            client_timestamp: self.client_timestamp,
            retry_count: u32::try_from(self.retry_count).unwrap_or(u32::MAX),
            last_error: self.last_error,
            next_attempt_at: self.next_attempt_at,
            updated_at: self.updated_at,
            payload: decode_payload(kind, &self.payload, parent)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Local payload format
//
// Kept independent of the wire format in `sync::wire` so either side can
// evolve without migrating the other.
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct StoredLoiChange {
    job_id: String,
    #[serde(default)]
    geometry: Option<Geometry>,
    #[serde(default)]
    custom_id: Option<String>,
    #[serde(default)]
    properties: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredDelta {
    task_id: String,
    task_type: String,
    #[serde(default)]
    value: Option<TaskValue>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredSubmissionChange {
    submission_id: String,
    job_id: String,
    deltas: Vec<StoredDelta>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredMedia {
    submission_id: String,
    local_path: String,
    remote_path: String,
}

fn encode_payload(payload: &MutationPayload) -> Result<String> {
    let json = match payload {
        MutationPayload::LocationOfInterest(change) => serde_json::to_string(&StoredLoiChange {
            job_id: change.job_id.to_string(),
            geometry: change.geometry.clone(),
            custom_id: change.custom_id.clone(),
            properties: change.properties.clone(),
        })?,
        MutationPayload::Submission(change) => {
            serde_json::to_string(&StoredSubmissionChange {
                submission_id: change.submission_id.to_string(),
                job_id: change.job_id.to_string(),
                deltas: change
                    .deltas
                    .iter()
                    .map(|delta| StoredDelta {
                        task_id: delta.task_id.to_string(),
                        task_type: delta.task_type.as_str().to_string(),
                        value: delta.new_value.clone(),
                    })
                    .collect(),
            })?
        }
        MutationPayload::Media(upload) => serde_json::to_string(&StoredMedia {
            submission_id: upload.submission_id.to_string(),
            local_path: upload.local_path.to_string_lossy().into_owned(),
            remote_path: upload.remote_path.clone(),
        })?,
    };
    Ok(json)
}

fn decode_payload(
    kind: MutationKind,
    payload: &str,
    parent: Option<MutationId>,
) -> Result<MutationPayload> {
    Ok(match kind {
        MutationKind::LocationOfInterest => {
            let stored: StoredLoiChange = serde_json::from_str(payload)?;
            MutationPayload::LocationOfInterest(LoiChange {
                job_id: JobId::new(stored.job_id),
                geometry: stored.geometry,
                custom_id: stored.custom_id,
                properties: stored.properties,
            })
        }
        MutationKind::Submission => {
            let stored: StoredSubmissionChange = serde_json::from_str(payload)?;
            MutationPayload::Submission(SubmissionChange {
                submission_id: SubmissionId::new(stored.submission_id),
                job_id: JobId::new(stored.job_id),
                deltas: stored
                    .deltas
                    .into_iter()
                    .map(|delta| ValueDelta {
                        task_id: TaskId::new(delta.task_id),
                        task_type: delta.task_type.parse().unwrap_or(TaskType::Unknown),
                        new_value: delta.value,
                    })
                    .collect(),
            })
        }
        MutationKind::Media => {
            let stored: StoredMedia = serde_json::from_str(payload)?;
            let parent = parent
                .ok_or_else(|| Error::Database("media mutation without parent".to_string()))?;
            MutationPayload::Media(MediaUpload {
                parent,
                submission_id: SubmissionId::new(stored.submission_id),
                local_path: PathBuf::from(stored.local_path),
                remote_path: stored.remote_path,
            })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::Coordinate;
    use pretty_assertions::assert_eq;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn loi_create(loi: &str, at: i64) -> NewMutation {
        NewMutation::at(
            MutationType::Create,
            SurveyId::from("s1"),
            LoiId::from(loi),
            UserId::from("u1"),
            at,
            MutationPayload::LocationOfInterest(LoiChange {
                job_id: JobId::from("j1"),
                geometry: Some(Geometry::Point {
                    coordinate: Coordinate::new(1.0, 2.0),
                }),
                custom_id: None,
                properties: BTreeMap::new(),
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_insert_and_get() {
        let db = setup();
        let repo = SqliteMutationRepository::new(db.connection());

        let new = loi_create("l1", 100);
        let stored = repo.insert(&new).unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Pending);
        assert_eq!(stored.retry_count, 0);
        assert_eq!(stored.payload, new.payload);

        let fetched = repo.get(stored.id).unwrap().unwrap();
        assert_eq!(fetched.client_timestamp, 100);
        assert_eq!(fetched.payload, new.payload);
    }

    #[test]
    fn test_ids_are_monotonic_and_never_reused() {
        let db = setup();
        let repo = SqliteMutationRepository::new(db.connection());

        let first = repo.insert(&loi_create("l1", 1)).unwrap();
        repo.delete(first.id).unwrap();
        let second = repo.insert(&loi_create("l1", 2)).unwrap();
        assert!(second.id > first.id);
    }

    #[test]
    fn test_list_orders_by_client_timestamp() {
        let db = setup();
        let repo = SqliteMutationRepository::new(db.connection());

        repo.insert(&loi_create("l1", 300)).unwrap();
        repo.insert(&loi_create("l2", 100)).unwrap();
        repo.insert(&loi_create("l1", 200)).unwrap();

        let timestamps: Vec<i64> = repo
            .list_by_status(&[SyncStatus::Pending])
            .unwrap()
            .iter()
            .map(|mutation| mutation.client_timestamp)
            .collect();
        assert_eq!(timestamps, vec![100, 200, 300]);

        let l1 = repo
            .list_by_loi(&LoiId::from("l1"), &[SyncStatus::Pending])
            .unwrap();
        assert_eq!(l1.len(), 2);
        assert!(repo.list_by_status(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_update_status_validates_transitions() {
        let db = setup();
        let repo = SqliteMutationRepository::new(db.connection());
        let stored = repo.insert(&loi_create("l1", 1)).unwrap();

        let error = repo
            .update_status(stored.id, &StatusChange::to(SyncStatus::Completed))
            .unwrap_err();
        assert!(matches!(error, Error::IllegalTransition(_)));

        repo.update_status(stored.id, &StatusChange::to(SyncStatus::InProgress))
            .unwrap();
        let retried = repo
            .update_status(
                stored.id,
                &StatusChange::to(SyncStatus::Pending)
                    .with_retry_count(1)
                    .with_error("network unavailable")
                    .retry_at(5_000),
            )
            .unwrap();
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.last_error.as_deref(), Some("network unavailable"));
        assert_eq!(retried.next_attempt_at, Some(5_000));
    }

    #[test]
    fn test_unknown_stored_type_survives_read() {
        let db = setup();
        let repo = SqliteMutationRepository::new(db.connection());
        let stored = repo.insert(&loi_create("l1", 1)).unwrap();

        db.connection()
            .execute(
                "UPDATE mutation_queue SET type = 'MERGE' WHERE id = ?1",
                params![stored.id.get()],
            )
            .unwrap();

        let fetched = repo.get(stored.id).unwrap().unwrap();
        assert_eq!(fetched.mutation_type, MutationType::Unknown);
    }

    #[test]
    fn test_purge_completed_respects_cutoff() {
        let db = setup();
        let repo = SqliteMutationRepository::new(db.connection());
        let stored = repo.insert(&loi_create("l1", 1)).unwrap();
        repo.update_status(stored.id, &StatusChange::to(SyncStatus::InProgress))
            .unwrap();
        repo.update_status(stored.id, &StatusChange::to(SyncStatus::Completed))
            .unwrap();

        assert_eq!(repo.purge_completed(0).unwrap(), 0);
        assert_eq!(repo.purge_completed(i64::MAX).unwrap(), 1);
        assert!(repo.get(stored.id).unwrap().is_none());
    }
}
