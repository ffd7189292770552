//! Sync status lifecycle of a queued mutation

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lifecycle state of a queued mutation.
///
/// `Completed` and `Failed` are terminal. A failed mutation is only revived by
/// replacing it with a fresh `Pending` one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    MediaUploadPending,
    MediaUploadInProgress,
    MediaUploadAwaitingRetry,
}

/// Attempted transition that is not in the lifecycle table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Illegal sync status transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: SyncStatus,
    pub to: SyncStatus,
}

impl SyncStatus {
    pub const ALL: [Self; 7] = [
        Self::Pending,
        Self::InProgress,
        Self::Completed,
        Self::Failed,
        Self::MediaUploadPending,
        Self::MediaUploadInProgress,
        Self::MediaUploadAwaitingRetry,
    ];

    /// Statuses a sync pass may pick up.
    pub const SYNCABLE: [Self; 3] = [
        Self::Pending,
        Self::MediaUploadPending,
        Self::MediaUploadAwaitingRetry,
    ];

    /// Statuses that mean a sync is currently in flight.
    pub const IN_FLIGHT: [Self; 2] = [Self::InProgress, Self::MediaUploadInProgress];

    /// Whether `self -> to` is a legal lifecycle transition.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::InProgress | Self::MediaUploadPending)
                | (
                    Self::InProgress,
                    Self::Completed | Self::Pending | Self::Failed
                )
                | (Self::MediaUploadPending, Self::MediaUploadInProgress)
                | (
                    Self::MediaUploadInProgress,
                    Self::Completed | Self::MediaUploadAwaitingRetry | Self::Failed
                )
                | (Self::MediaUploadAwaitingRetry, Self::MediaUploadPending)
        )
    }

    /// Validate a transition, returning the new status.
    pub const fn transition_to(self, to: Self) -> Result<Self, TransitionError> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(TransitionError { from: self, to })
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::InProgress | Self::MediaUploadInProgress)
    }

    /// Status a stale in-flight entry is swept back to after an interrupted pass.
    #[must_use]
    pub const fn recovery_target(self) -> Option<Self> {
        match self {
            Self::InProgress => Some(Self::Pending),
            Self::MediaUploadInProgress => Some(Self::MediaUploadAwaitingRetry),
            _ => None,
        }
    }

    /// Storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::MediaUploadPending => "MEDIA_UPLOAD_PENDING",
            Self::MediaUploadInProgress => "MEDIA_UPLOAD_IN_PROGRESS",
            Self::MediaUploadAwaitingRetry => "MEDIA_UPLOAD_AWAITING_RETRY",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown sync status '{s}'"))
    }
}
