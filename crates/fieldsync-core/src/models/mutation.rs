//! Mutation model: pending local changes awaiting reconciliation

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::error::{Error, Result};

use super::ids::{JobId, LoiId, MutationId, SubmissionId, SurveyId, UserId};
use super::loi::Geometry;
use super::submission::ValueDelta;
use super::sync_status::SyncStatus;

/// Operation a mutation performs on its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationType {
    Create,
    Update,
    Delete,
    /// Unrecognized stored value (schema skew); never applied remotely
    #[serde(other)]
    Unknown,
}

impl MutationType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Unknown => "UNKNOWN",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "CREATE" => Self::Create,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for MutationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind discriminator of the mutation variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationKind {
    LocationOfInterest,
    Submission,
    Media,
}

impl MutationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LocationOfInterest => "LOCATION_OF_INTEREST",
            Self::Submission => "SUBMISSION",
            Self::Media => "MEDIA",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "LOCATION_OF_INTEREST" => Ok(Self::LocationOfInterest),
            "SUBMISSION" => Ok(Self::Submission),
            "MEDIA" => Ok(Self::Media),
            other => Err(Error::Database(format!("unknown mutation kind '{other}'"))),
        }
    }
}

/// Change to a location of interest.
#[derive(Debug, Clone, PartialEq)]
pub struct LoiChange {
    pub job_id: JobId,
    /// Required for CREATE; `None` on UPDATE leaves the geometry unchanged
    pub geometry: Option<Geometry>,
    pub custom_id: Option<String>,
    pub properties: BTreeMap<String, String>,
}

/// Ordered task value deltas for one submission.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionChange {
    pub submission_id: SubmissionId,
    pub job_id: JobId,
    pub deltas: Vec<ValueDelta>,
}

/// Media file that belongs to a queued submission mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaUpload {
    /// Owning submission mutation
    pub parent: MutationId,
    pub submission_id: SubmissionId,
    pub local_path: PathBuf,
    /// Destination path on the remote media store
    pub remote_path: String,
}

/// Variant payload; each variant carries only its own fields.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationPayload {
    LocationOfInterest(LoiChange),
    Submission(SubmissionChange),
    Media(MediaUpload),
}

impl MutationPayload {
    #[must_use]
    pub const fn kind(&self) -> MutationKind {
        match self {
            Self::LocationOfInterest(_) => MutationKind::LocationOfInterest,
            Self::Submission(_) => MutationKind::Submission,
            Self::Media(_) => MutationKind::Media,
        }
    }
}

/// A validated mutation that has not been assigned a queue id yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMutation {
    pub mutation_type: MutationType,
    pub survey_id: SurveyId,
    pub loi_id: LoiId,
    pub user_id: UserId,
    /// Device clock (Unix ms) when the edit was made
    pub client_timestamp: i64,
    pub payload: MutationPayload,
}

impl NewMutation {
    /// Build and validate a mutation stamped with the current device time.
    pub fn new(
        mutation_type: MutationType,
        survey_id: SurveyId,
        loi_id: LoiId,
        user_id: UserId,
        payload: MutationPayload,
    ) -> Result<Self> {
        Self::at(
            mutation_type,
            survey_id,
            loi_id,
            user_id,
            chrono::Utc::now().timestamp_millis(),
            payload,
        )
    }

    /// Build and validate a mutation with an explicit client timestamp.
    pub fn at(
        mutation_type: MutationType,
        survey_id: SurveyId,
        loi_id: LoiId,
        user_id: UserId,
        client_timestamp: i64,
        payload: MutationPayload,
    ) -> Result<Self> {
        let mutation = Self {
            mutation_type,
            survey_id,
            loi_id,
            user_id,
            client_timestamp,
            payload,
        };
        mutation.validate()?;
        Ok(mutation)
    }

    /// Structural completeness check; runs before anything is persisted.
    pub fn validate(&self) -> Result<()> {
        if self.mutation_type == MutationType::Unknown {
            return Err(Error::InvalidInput(
                "Mutation type must be CREATE, UPDATE or DELETE".to_string(),
            ));
        }
        require_id(self.survey_id.is_blank(), "survey_id")?;
        require_id(self.loi_id.is_blank(), "loi_id")?;
        require_id(self.user_id.is_blank(), "user_id")?;
        if self.client_timestamp <= 0 {
            return Err(Error::InvalidInput(
                "Mutation client_timestamp must be positive".to_string(),
            ));
        }

        match &self.payload {
            MutationPayload::LocationOfInterest(change) => {
                require_id(change.job_id.is_blank(), "job_id")?;
                match (&change.geometry, self.mutation_type) {
                    (None, MutationType::Create) => Err(Error::InvalidInput(
                        "LOI CREATE requires a geometry".to_string(),
                    )),
                    (Some(geometry), _) if !geometry.is_valid() => Err(Error::InvalidInput(
                        "LOI geometry is not valid".to_string(),
                    )),
                    _ => Ok(()),
                }
            }
            MutationPayload::Submission(change) => {
                require_id(change.submission_id.is_blank(), "submission_id")?;
                require_id(change.job_id.is_blank(), "job_id")?;
                if change.deltas.iter().any(|delta| delta.task_id.is_blank()) {
                    return Err(Error::InvalidInput(
                        "Submission delta task_id cannot be empty".to_string(),
                    ));
                }
                Ok(())
            }
            MutationPayload::Media(upload) => {
                require_id(upload.submission_id.is_blank(), "submission_id")?;
                if upload.local_path.as_os_str().is_empty() {
                    return Err(Error::InvalidInput(
                        "Media local_path cannot be empty".to_string(),
                    ));
                }
                require_id(upload.remote_path.trim().is_empty(), "remote_path")?;
                if self.mutation_type != MutationType::Create {
                    return Err(Error::InvalidInput(
                        "Media mutations can only be CREATE".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Ordering/blocking key: LOI id for LOI mutations, submission id otherwise.
    #[must_use]
    pub fn entity_id(&self) -> String {
        entity_id(&self.loi_id, &self.payload)
    }
}

fn require_id(blank: bool, field: &str) -> Result<()> {
    if blank {
        Err(Error::InvalidInput(format!("Mutation {field} cannot be empty")))
    } else {
        Ok(())
    }
}

fn entity_id(loi_id: &LoiId, payload: &MutationPayload) -> String {
    match payload {
        MutationPayload::LocationOfInterest(_) => loi_id.to_string(),
        MutationPayload::Submission(change) => change.submission_id.to_string(),
        MutationPayload::Media(upload) => upload.submission_id.to_string(),
    }
}

/// Media file to attach while enqueueing a submission mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMedia {
    pub local_path: PathBuf,
    pub remote_path: String,
}

/// A persisted mutation together with its queue bookkeeping.
///
/// Identity is the queue id.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub id: MutationId,
    pub mutation_type: MutationType,
    pub sync_status: SyncStatus,
    pub survey_id: SurveyId,
    pub loi_id: LoiId,
    pub user_id: UserId,
    pub client_timestamp: i64,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Earliest time (Unix ms) the next attempt may start
    pub next_attempt_at: Option<i64>,
    /// Last queue write (Unix ms)
    pub updated_at: i64,
    pub payload: MutationPayload,
}

impl PartialEq for Mutation {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Mutation {}

impl Mutation {
    #[must_use]
    pub const fn kind(&self) -> MutationKind {
        self.payload.kind()
    }

    #[must_use]
    pub fn entity_id(&self) -> String {
        entity_id(&self.loi_id, &self.payload)
    }

    #[must_use]
    pub const fn is_media(&self) -> bool {
        matches!(self.payload, MutationPayload::Media(_))
    }

    /// Sort key for causal application order.
    #[must_use]
    pub const fn order_key(&self) -> (i64, MutationId) {
        (self.client_timestamp, self.id)
    }

    /// Whether a sync pass may pick this mutation up at `now`.
    #[must_use]
    pub fn is_due(&self, now: i64) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now)
    }
}
