//! Sync orchestrator: drains the mutation queue into the remote store
//!
//! A pass groups syncable mutations by LOI. Record mutations of one LOI are
//! claimed together and submitted as one atomic batch; media satellites are
//! uploaded on a separate lane so photos never hold back field edits.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

use crate::db::StatusChange;
use crate::error::Result;
use crate::models::{
    LoiId, Mutation, MutationId, MutationKind, MutationPayload, MutationType, SyncStatus,
};
use crate::services::{Lane, MutationQueue};
use crate::util::now_millis;

use super::remote::{BatchOutcome, RemoteError, RemoteResult, RemoteStore};
use super::retry::RetryPolicy;

/// Counters describing one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub batches_applied: usize,
    pub batches_rejected: usize,
    pub completed: usize,
    /// Returned to a syncable status for a later attempt
    pub retried: usize,
    pub failed: usize,
    /// Held behind an earlier FAILED mutation of the same entity
    pub blocked: usize,
    /// Not yet due, or their lane was busy
    pub deferred: usize,
    pub media_uploaded: usize,
    pub cancelled: bool,
}

impl SyncReport {
    /// Whether the pass found nothing to do.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.completed == 0
            && self.retried == 0
            && self.failed == 0
            && self.blocked == 0
            && self.deferred == 0
    }

    fn record(&mut self, updated: &[Mutation]) {
        for mutation in updated {
            match mutation.sync_status {
                SyncStatus::Completed => self.completed += 1,
                SyncStatus::Failed => self.failed += 1,
                _ => self.retried += 1,
            }
        }
    }
}

/// In-process lane reservations; the queue's IN_PROGRESS rows guard across
/// processes, this set guards concurrent passes inside one process.
#[derive(Debug, Default)]
struct LaneLocks {
    held: Mutex<HashSet<(LoiId, Lane)>>,
}

impl LaneLocks {
    fn try_acquire(&self, loi_id: &LoiId, lane: Lane) -> Option<LaneGuard<'_>> {
        let key = (loi_id.clone(), lane);
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if held.insert(key.clone()) {
            Some(LaneGuard { locks: self, key })
        } else {
            None
        }
    }
}

struct LaneGuard<'a> {
    locks: &'a LaneLocks,
    key: (LoiId, Lane),
}

impl Drop for LaneGuard<'_> {
    fn drop(&mut self) {
        self.locks
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Earliest FAILED record mutation per entity; later mutations of that
/// entity are held until the failure is retried or discarded.
///
/// Failed media never enter the index: a photo may wait on its submission,
/// but the submission never waits on a photo.
#[derive(Debug, Default)]
struct FailureIndex {
    by_entity: HashMap<String, (i64, MutationId)>,
    loi_creates: HashMap<LoiId, (i64, MutationId)>,
}

impl FailureIndex {
    fn add(&mut self, mutation: &Mutation) {
        if mutation.is_media() {
            return;
        }
        let key = mutation.order_key();
        let earliest = self.by_entity.entry(mutation.entity_id()).or_insert(key);
        *earliest = (*earliest).min(key);
        if mutation.kind() == MutationKind::LocationOfInterest
            && mutation.mutation_type == MutationType::Create
        {
            let earliest = self.loi_creates.entry(mutation.loi_id.clone()).or_insert(key);
            *earliest = (*earliest).min(key);
        }
    }

    fn blocks(&self, mutation: &Mutation) -> bool {
        let key = mutation.order_key();
        let same_entity = self
            .by_entity
            .get(&mutation.entity_id())
            .is_some_and(|failed| *failed < key);
        let missing_loi = mutation.kind() != MutationKind::LocationOfInterest
            && self
                .loi_creates
                .get(&mutation.loi_id)
                .is_some_and(|failed| *failed < key);
        same_entity || missing_loi
    }
}

/// Work gathered for one pass.
#[derive(Debug, Default)]
struct PassPlan {
    records: Vec<(LoiId, Vec<Mutation>)>,
    media: Vec<(LoiId, Vec<Mutation>)>,
}

/// Drives queued mutations to the remote store.
#[derive(Clone)]
pub struct SyncOrchestrator {
    queue: MutationQueue,
    remote: Arc<dyn RemoteStore>,
    policy: RetryPolicy,
    lanes: Arc<LaneLocks>,
}

impl SyncOrchestrator {
    pub fn new(queue: MutationQueue, remote: Arc<dyn RemoteStore>, policy: RetryPolicy) -> Self {
        Self {
            queue,
            remote,
            policy,
            lanes: Arc::new(LaneLocks::default()),
        }
    }

    #[must_use]
    pub const fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run one pass that cannot be cancelled.
    pub async fn sync_pass(&self) -> Result<SyncReport> {
        let (_keep, cancel) = watch::channel(false);
        self.sync_pass_with(&cancel).await
    }

    /// Run one pass; setting `cancel` to `true` stops it after rolling the
    /// current group back to a syncable status.
    pub async fn sync_pass_with(&self, cancel: &watch::Receiver<bool>) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let now = now_millis();

        let mut failures = FailureIndex::default();
        for failed in self.queue.by_status(&[SyncStatus::Failed]).await? {
            failures.add(&failed);
        }

        let syncable = self.queue.by_status(&SyncStatus::SYNCABLE).await?;
        let syncable = self
            .fail_unknown_types(syncable, &mut failures, &mut report)
            .await?;
        let plan = plan_pass(syncable, &failures, now, &mut report);

        for (loi_id, group) in plan.records {
            if is_cancelled(cancel) {
                report.cancelled = true;
                break;
            }
            self.sync_record_group(&loi_id, group, cancel, &mut failures, &mut report)
                .await?;
        }

        for (loi_id, group) in plan.media {
            if report.cancelled || is_cancelled(cancel) {
                report.cancelled = true;
                break;
            }
            // Parents may have failed earlier in this pass.
            let (group, held): (Vec<_>, Vec<_>) =
                group.into_iter().partition(|media| !failures.blocks(media));
            report.blocked += held.len();
            if !group.is_empty() {
                self.upload_media_group(&loi_id, group, cancel, &mut report)
                    .await?;
            }
        }

        if report.is_idle() {
            tracing::debug!("Sync pass found nothing to do");
        } else {
            tracing::info!(
                "Sync pass: {} completed, {} retried, {} failed, {} blocked, {} deferred, {} media uploaded",
                report.completed,
                report.retried,
                report.failed,
                report.blocked,
                report.deferred,
                report.media_uploaded
            );
        }
        Ok(report)
    }

    /// Mutations with an unrecognized stored type are never sent; they fail
    /// so the user can discard them.
    async fn fail_unknown_types(
        &self,
        syncable: Vec<Mutation>,
        failures: &mut FailureIndex,
        report: &mut SyncReport,
    ) -> Result<Vec<Mutation>> {
        let (unknown, known): (Vec<_>, Vec<_>) = syncable
            .into_iter()
            .partition(|mutation| mutation.mutation_type == MutationType::Unknown);

        for mutation in unknown {
            let lane = Lane::of(&mutation);
            let Some(_guard) = self.lanes.try_acquire(&mutation.loi_id, lane) else {
                report.deferred += 1;
                continue;
            };
            let claimed = self
                .queue
                .claim(&mutation.loi_id, lane, &[mutation.id])
                .await?;
            let Some(claimed) = claimed else {
                report.deferred += 1;
                continue;
            };
            let changes = claimed
                .iter()
                .map(|claimed| {
                    (
                        claimed.id,
                        StatusChange::to(SyncStatus::Failed)
                            .with_error("unknown mutation type; discard this change"),
                    )
                })
                .collect();
            let updated = self.queue.apply_changes(changes).await?;
            for failed in &updated {
                tracing::error!(
                    "Mutation {} for LOI {} has an unknown type and was not sent",
                    failed.id,
                    failed.loi_id
                );
                failures.add(failed);
            }
            report.record(&updated);
        }
        Ok(known)
    }

    async fn sync_record_group(
        &self,
        loi_id: &LoiId,
        group: Vec<Mutation>,
        cancel: &watch::Receiver<bool>,
        failures: &mut FailureIndex,
        report: &mut SyncReport,
    ) -> Result<()> {
        let Some(_guard) = self.lanes.try_acquire(loi_id, Lane::Records) else {
            report.deferred += group.len();
            return Ok(());
        };
        let ids: Vec<MutationId> = group.iter().map(|mutation| mutation.id).collect();
        let Some(claimed) = self.queue.claim(loi_id, Lane::Records, &ids).await? else {
            tracing::debug!("LOI {loi_id} already has a sync in flight");
            report.deferred += group.len();
            return Ok(());
        };
        let result = self
            .submit_records(loi_id, &claimed, cancel, failures, report)
            .await;
        if result.is_err() {
            let ids: Vec<MutationId> = claimed.iter().map(|mutation| mutation.id).collect();
            self.release_claim(&ids).await;
        }
        result
    }

    async fn submit_records(
        &self,
        loi_id: &LoiId,
        claimed: &[Mutation],
        cancel: &watch::Receiver<bool>,
        failures: &mut FailureIndex,
        report: &mut SyncReport,
    ) -> Result<()> {
        let Some(user_id) = claimed.first().map(|mutation| mutation.user_id.clone()) else {
            return Ok(());
        };

        tracing::debug!("Submitting {} mutation(s) for LOI {loi_id}", claimed.len());
        let outcome = tokio::select! {
            biased;
            () = wait_for_cancel(cancel.clone()) => None,
            outcome = self.remote.apply_mutation_batch(claimed, &user_id) => Some(outcome),
        };

        let changes = match outcome {
            None => {
                tracing::warn!("Sync of LOI {loi_id} cancelled; rolling back");
                report.cancelled = true;
                claimed
                    .iter()
                    .map(|mutation| (mutation.id, StatusChange::to(SyncStatus::Pending)))
                    .collect()
            }
            Some(Ok(BatchOutcome::Applied)) => {
                report.batches_applied += 1;
                claimed
                    .iter()
                    .map(|mutation| (mutation.id, StatusChange::to(SyncStatus::Completed)))
                    .collect()
            }
            Some(Ok(BatchOutcome::Rejected(rejections))) => {
                report.batches_rejected += 1;
                let (named, unmatched): (Vec<_>, Vec<_>) =
                    rejections.into_iter().partition(|failure| {
                        claimed.iter().any(|mutation| mutation.id == failure.mutation_id)
                    });
                if named.is_empty() {
                    // Nothing to single out, so the whole batch takes the failure.
                    let error = unmatched.into_iter().next().map_or_else(
                        || RemoteError::invalid_payload("batch rejected without a cause"),
                        |failure| failure.error,
                    );
                    tracing::warn!(
                        "Batch for LOI {loi_id} rejected without naming a member: {error}"
                    );
                    claimed
                        .iter()
                        .map(|mutation| {
                            let change =
                                self.failure_change(mutation, &error, SyncStatus::Pending);
                            (mutation.id, change)
                        })
                        .collect()
                } else {
                    let causes: HashMap<MutationId, RemoteError> = named
                        .into_iter()
                        .map(|failure| (failure.mutation_id, failure.error))
                        .collect();
                    claimed
                        .iter()
                        .map(|mutation| {
                            let change = causes.get(&mutation.id).map_or_else(
                                // Collateral of another member's rejection.
                                || StatusChange::to(SyncStatus::Pending),
                                |error| self.failure_change(mutation, error, SyncStatus::Pending),
                            );
                            (mutation.id, change)
                        })
                        .collect()
                }
            }
            Some(Err(error)) => {
                report.batches_rejected += 1;
                tracing::warn!("Batch for LOI {loi_id} failed: {error}");
                claimed
                    .iter()
                    .map(|mutation| {
                        let change = self.failure_change(mutation, &error, SyncStatus::Pending);
                        (mutation.id, change)
                    })
                    .collect()
            }
        };

        let updated = self.queue.apply_changes(changes).await?;
        for mutation in &updated {
            if mutation.sync_status == SyncStatus::Failed {
                tracing::error!(
                    "Mutation {} ({} {}) for LOI {} failed: {}",
                    mutation.id,
                    mutation.mutation_type,
                    mutation.kind().as_str(),
                    mutation.loi_id,
                    mutation.last_error.as_deref().unwrap_or("unknown error")
                );
                failures.add(mutation);
            }
        }
        report.record(&updated);
        Ok(())
    }

    async fn upload_media_group(
        &self,
        loi_id: &LoiId,
        group: Vec<Mutation>,
        cancel: &watch::Receiver<bool>,
        report: &mut SyncReport,
    ) -> Result<()> {
        let Some(_guard) = self.lanes.try_acquire(loi_id, Lane::Media) else {
            report.deferred += group.len();
            return Ok(());
        };
        let ids: Vec<MutationId> = group.iter().map(|mutation| mutation.id).collect();
        let Some(claimed) = self.queue.claim(loi_id, Lane::Media, &ids).await? else {
            report.deferred += group.len();
            return Ok(());
        };
        let claimed_ids: Vec<MutationId> = claimed.iter().map(|mutation| mutation.id).collect();
        let result = self.upload_claimed(claimed, cancel, report).await;
        if result.is_err() {
            self.release_claim(&claimed_ids).await;
        }
        result
    }

    async fn upload_claimed(
        &self,
        claimed: Vec<Mutation>,
        cancel: &watch::Receiver<bool>,
        report: &mut SyncReport,
    ) -> Result<()> {
        for media in claimed {
            let MutationPayload::Media(upload) = &media.payload else {
                continue;
            };

            let outcome: Option<RemoteResult<()>> = if report.cancelled {
                None
            } else {
                tokio::select! {
                    biased;
                    () = wait_for_cancel(cancel.clone()) => None,
                    outcome = self
                        .remote
                        .upload_media(&upload.local_path, &upload.remote_path) => Some(outcome),
                }
            };

            let change = match outcome {
                None => {
                    report.cancelled = true;
                    StatusChange::to(SyncStatus::MediaUploadAwaitingRetry)
                }
                Some(Ok(())) => {
                    report.media_uploaded += 1;
                    if self.queue.parent_synced(upload.parent).await? {
                        StatusChange::to(SyncStatus::Completed)
                    } else {
                        StatusChange::to(SyncStatus::MediaUploadAwaitingRetry)
                            .with_error("uploaded; waiting for the submission to sync")
                    }
                }
                Some(Err(error)) => {
                    tracing::warn!("Upload of {} failed: {error}", upload.remote_path);
                    self.failure_change(&media, &error, SyncStatus::MediaUploadAwaitingRetry)
                }
            };
            let updated = self.queue.update_status(media.id, change).await?;
            report.record(std::slice::from_ref(&updated));
        }
        Ok(())
    }

    /// Return claimed rows still in flight to a syncable status after a
    /// local error cut the group short.
    async fn release_claim(&self, ids: &[MutationId]) {
        match self.queue.release(ids).await {
            Ok(released) if !released.is_empty() => tracing::warn!(
                "Released {} mutation(s) left in flight by a failed sync",
                released.len()
            ),
            Ok(_) => {}
            Err(error) => tracing::error!("Releasing claimed mutations failed: {error}"),
        }
    }

    /// Transition for a member that caused a remote failure.
    fn failure_change(
        &self,
        mutation: &Mutation,
        error: &RemoteError,
        retry_status: SyncStatus,
    ) -> StatusChange {
        if !error.is_transient() {
            return StatusChange::to(SyncStatus::Failed).with_error(error.to_string());
        }
        let retry_count = mutation.retry_count.saturating_add(1);
        if self.policy.is_exhausted(retry_count) {
            return StatusChange::to(SyncStatus::Failed)
                .with_retry_count(retry_count)
                .with_error(format!("retries exhausted: {error}"));
        }
        StatusChange::to(retry_status)
            .with_retry_count(retry_count)
            .with_error(error.to_string())
            .retry_at(self.policy.next_attempt_at(now_millis(), retry_count))
    }
}

/// Split syncable mutations into per-LOI groups, holding back blocked and
/// not-yet-due work.
fn plan_pass(
    syncable: Vec<Mutation>,
    failures: &FailureIndex,
    now: i64,
    report: &mut SyncReport,
) -> PassPlan {
    let mut records: BTreeMap<LoiId, Vec<Mutation>> = BTreeMap::new();
    let mut media: BTreeMap<LoiId, Vec<Mutation>> = BTreeMap::new();
    for mutation in syncable {
        if failures.blocks(&mutation) {
            tracing::debug!(
                "Mutation {} is blocked behind a failed change to {}",
                mutation.id,
                mutation.entity_id()
            );
            report.blocked += 1;
            continue;
        }
        let lane = if mutation.is_media() { &mut media } else { &mut records };
        lane.entry(mutation.loi_id.clone()).or_default().push(mutation);
    }

    let mut plan = PassPlan::default();
    for (target, groups) in [(&mut plan.records, records), (&mut plan.media, media)] {
        for (loi_id, group) in groups {
            // Any member not yet due holds back the whole group to keep order.
            if group.iter().any(|mutation| !mutation.is_due(now)) {
                report.deferred += group.len();
                continue;
            }
            target.push((loi_id, group));
        }
        target.sort_by_key(|(_, group)| group.first().map(Mutation::order_key));
    }
    plan
}

fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

/// Resolves once cancellation is requested; never resolves if the sender
/// is dropped without cancelling.
async fn wait_for_cancel(mut cancel: watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
