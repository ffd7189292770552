//! Remote store capability consumed by the sync engine

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::{LocationOfInterest, Mutation, MutationId, Survey, SurveyId, UserId};

/// Classification of a remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteErrorKind {
    /// Network unreachable, timeout, or server-side outage
    Unavailable,
    /// Remote asked the client to slow down
    Throttled,
    PermissionDenied,
    /// Schema violation or malformed payload
    InvalidPayload,
    /// Survey or entity missing remotely
    NotFound,
    Other,
}

impl RemoteErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unavailable => "unavailable",
            Self::Throttled => "throttled",
            Self::PermissionDenied => "permission denied",
            Self::InvalidPayload => "invalid payload",
            Self::NotFound => "not found",
            Self::Other => "remote error",
        }
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified remote failure. Raw transport errors never leave the
/// `RemoteStore` implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Unavailable, message)
    }

    pub fn throttled(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Throttled, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::PermissionDenied, message)
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::InvalidPayload, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::NotFound, message)
    }

    /// Transient failures are retried with backoff; everything else is final.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            RemoteErrorKind::Unavailable | RemoteErrorKind::Throttled
        )
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind == RemoteErrorKind::NotFound
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Failure attributed to one member of a rejected batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationFailure {
    pub mutation_id: MutationId,
    pub error: RemoteError,
}

/// Result of an atomic batch submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every mutation was applied
    Applied,
    /// Nothing was applied; the listed members caused the rejection
    Rejected(Vec<MutationFailure>),
}

/// Change notification for a survey's remote schema or LOIs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurveyUpdate {
    pub survey_id: SurveyId,
    /// Remote change time (Unix ms)
    pub changed_at: i64,
}

/// Remote store operations.
///
/// `apply_mutation_batch` must be atomic: implementations never apply part
/// of a batch.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Full survey schema, or `None` when the survey does not exist remotely
    async fn fetch_survey(&self, survey_id: &SurveyId) -> RemoteResult<Option<Survey>>;

    /// LOIs imported by survey organizers
    async fn fetch_predefined_lois(&self, survey: &Survey) -> RemoteResult<Vec<LocationOfInterest>>;

    /// Apply record mutations, ordered by client timestamp, as one unit
    async fn apply_mutation_batch(
        &self,
        mutations: &[Mutation],
        user_id: &UserId,
    ) -> RemoteResult<BatchOutcome>;

    /// Upload a local file to the media store
    async fn upload_media(&self, local_path: &Path, remote_path: &str) -> RemoteResult<()>;

    /// Resolve a media path to a download URL
    async fn download_url(&self, remote_path: &str) -> RemoteResult<String>;

    /// Change events for one survey until the receiver is dropped
    async fn stream_survey_updates(
        &self,
        survey_id: &SurveyId,
    ) -> RemoteResult<mpsc::Receiver<SurveyUpdate>>;
}
