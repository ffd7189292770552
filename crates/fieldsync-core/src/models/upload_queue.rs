//! Read models for the sync-status UI

use serde::Serialize;

use super::ids::{LoiId, MutationId};
use super::mutation::{Mutation, MutationKind, MutationType};
use super::sync_status::SyncStatus;

/// Queue row resolved with display metadata.
#[derive(Debug, Clone)]
pub struct UploadQueueEntry {
    pub mutation: Mutation,
    pub survey_title: Option<String>,
    pub job_name: Option<String>,
    pub loi_display_name: Option<String>,
}

/// Emitted on every enqueue and status transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueEvent {
    pub mutation_id: MutationId,
    pub loi_id: LoiId,
    pub kind: MutationKind,
    pub mutation_type: MutationType,
    /// `None` when the mutation was removed from the queue
    pub status: Option<SyncStatus>,
    pub retry_count: u32,
}

impl QueueEvent {
    #[must_use]
    pub fn from_mutation(mutation: &Mutation) -> Self {
        Self {
            mutation_id: mutation.id,
            loi_id: mutation.loi_id.clone(),
            kind: mutation.kind(),
            mutation_type: mutation.mutation_type,
            status: Some(mutation.sync_status),
            retry_count: mutation.retry_count,
        }
    }

    #[must_use]
    pub fn removed(mutation: &Mutation) -> Self {
        Self {
            status: None,
            ..Self::from_mutation(mutation)
        }
    }
}
